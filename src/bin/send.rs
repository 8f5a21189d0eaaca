//! GUDP 송신기
//!
//! 파일(또는 생성한 테스트 패턴)을 GUDP로 한 peer에게 보낸다.
//! 첫 메시지는 전체 길이(8바이트 big-endian), 이후 페이로드 조각.
//!
//! 사용법:
//!   cargo run --release --bin gudp-send -- [OPTIONS]
//!
//! 예시:
//!   # 파일 전송
//!   cargo run --release --bin gudp-send -- --peer 127.0.0.1:9000 --input data.bin
//!
//!   # 1MB 테스트 패턴, 첫 ACK 손실 흉내
//!   cargo run --release --bin gudp-send -- -p 127.0.0.1:9000 --size 1048576 --drop-sender first-ack

use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use gudp::{Config, DropPolicy, GudpSocket};

/// 송신기 설정
struct SendOptions {
    bind_addr: SocketAddr,
    peer_addr: SocketAddr,
    input_path: Option<PathBuf>,
    test_size: usize,
    config: Config,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            peer_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            input_path: None,
            test_size: 64 * 1024,
            config: Config::default(),
        }
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| format!("{} 값 필요", flag))
}

fn parse_args() -> Result<SendOptions, Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = SendOptions::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--bind" | "-b" => {
                options.bind_addr = value(&args, i, flag)?.parse()?;
                i += 1;
            }
            "--peer" | "-p" => {
                options.peer_addr = value(&args, i, flag)?.parse()?;
                i += 1;
            }
            "--input" | "-i" => {
                options.input_path = Some(PathBuf::from(value(&args, i, flag)?));
                i += 1;
            }
            "--size" => {
                options.test_size = value(&args, i, flag)?.parse()?;
                i += 1;
            }
            "--window" | "-w" => {
                options.config.window_size = value(&args, i, flag)?.parse()?;
                i += 1;
            }
            "--timeout" => {
                options.config.timeout_ms = value(&args, i, flag)?.parse()?;
                i += 1;
            }
            "--retry" => {
                options.config.max_retry = value(&args, i, flag)?.parse()?;
                i += 1;
            }
            "--drop-sender" => {
                options.config.sender_drop = value(&args, i, flag)?.parse::<DropPolicy>()?;
                i += 1;
            }
            "--drop-receiver" => {
                options.config.receiver_drop = value(&args, i, flag)?.parse::<DropPolicy>()?;
                i += 1;
            }
            "--unstable" => {
                let base = Config::unstable_network();
                options.config = Config {
                    sender_drop: options.config.sender_drop,
                    receiver_drop: options.config.receiver_drop,
                    ..base
                };
            }
            "--help" | "-h" => {
                println!(
                    r#"GUDP Send - Go-Back-N UDP 송신기

사용법:
  cargo run --release --bin gudp-send -- [OPTIONS]

옵션:
  -b, --bind <ADDR>          로컬 바인드 주소 (기본: 0.0.0.0:0)
  -p, --peer <ADDR>          수신기 주소 (기본: 127.0.0.1:9000)
  -i, --input <PATH>         보낼 파일 (없으면 테스트 패턴)
  --size <BYTES>             테스트 패턴 크기 (기본: 65536)
  -w, --window <N>           GBN 윈도우 크기 (기본: 3)
  --timeout <MS>             재전송 타임아웃 (기본: 3000)
  --retry <N>                최대 재전송 횟수 (기본: 7)
  --drop-sender <POLICY>     송신 경로 손실 정책
  --drop-receiver <POLICY>   수신 경로 손실 정책
  --unstable                 불안정한 네트워크용 설정
  -h, --help                 이 도움말 출력

손실 정책:
  nothing, first-bsn, first-data, first-ack, first-fin, random[:P], all
"#
                );
                std::process::exit(0);
            }
            other => return Err(format!("알 수 없는 옵션: {}", other).into()),
        }
        i += 1;
    }

    Ok(options)
}

fn main() -> Result<(), Box<dyn Error>> {
    // 로깅 설정 (RUST_LOG 우선)
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let options = parse_args()?;

    let data = match &options.input_path {
        Some(path) => std::fs::read(path)?,
        None => (0..options.test_size).map(|i| (i % 251) as u8).collect(),
    };

    info!("GUDP Send starting...");
    info!("Peer: {}", options.peer_addr);
    info!("Payload: {} bytes", data.len());
    info!(
        "Window: {}, timeout: {}ms, max retry: {}",
        options.config.window_size, options.config.timeout_ms, options.config.max_retry
    );

    let socket = GudpSocket::bind(options.bind_addr, options.config)?;
    if let Some(addr) = socket.local_addr() {
        info!("Bound to local address: {}", addr);
    }

    let start = Instant::now();
    let chunk_size = socket.config().max_payload_len();

    socket.send(options.peer_addr, &(data.len() as u64).to_be_bytes())?;
    for chunk in data.chunks(chunk_size) {
        socket.send(options.peer_addr, chunk)?;
    }
    socket.finish()?;

    let elapsed = start.elapsed();
    let stats = socket.stats();
    socket.close()?;

    info!(
        "Sent {} bytes in {:.2}s ({:.2} KB/s)",
        data.len(),
        elapsed.as_secs_f64(),
        data.len() as f64 / 1024.0 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    info!("{}", stats.summary());

    Ok(())
}
