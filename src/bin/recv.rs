//! GUDP 수신기
//!
//! gudp-send가 보낸 길이 헤더와 페이로드를 받아 파일로 저장한다.
//!
//! 사용법:
//!   cargo run --release --bin gudp-recv -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin gudp-recv -- --bind 0.0.0.0:9000 --output received.bin

use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use gudp::{Config, DropPolicy, GudpSocket};

/// 수신기 설정
struct RecvOptions {
    bind_addr: SocketAddr,
    output_path: Option<PathBuf>,
    config: Config,
}

impl Default for RecvOptions {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            output_path: None,
            config: Config::default(),
        }
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| format!("{} 값 필요", flag))
}

fn parse_args() -> Result<RecvOptions, Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = RecvOptions::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--bind" | "-b" => {
                options.bind_addr = value(&args, i, flag)?.parse()?;
                i += 1;
            }
            "--output" | "-o" => {
                options.output_path = Some(PathBuf::from(value(&args, i, flag)?));
                i += 1;
            }
            "--window" | "-w" => {
                options.config.window_size = value(&args, i, flag)?.parse()?;
                i += 1;
            }
            "--drop-receiver" => {
                options.config.receiver_drop = value(&args, i, flag)?.parse::<DropPolicy>()?;
                i += 1;
            }
            "--help" | "-h" => {
                println!(
                    r#"GUDP Recv - Go-Back-N UDP 수신기

사용법:
  cargo run --release --bin gudp-recv -- [OPTIONS]

옵션:
  -b, --bind <ADDR>          바인드 주소 (기본: 0.0.0.0:9000)
  -o, --output <PATH>        수신 데이터 저장 경로
  -w, --window <N>           수신 윈도우 크기 (송신기와 같게, 기본: 3)
  --drop-receiver <POLICY>   수신 경로 손실 정책
  -h, --help                 이 도움말 출력
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
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let options = parse_args()?;
    let linger = options.config.timeout() * 2;

    let socket = GudpSocket::bind(options.bind_addr, options.config)?;
    info!("GUDP Recv listening on {:?}", socket.local_addr());

    // 길이 헤더
    let header = socket.receive()?;
    let peer = header.peer;
    let total = match <[u8; 8]>::try_from(header.payload.as_ref()) {
        Ok(bytes) => u64::from_be_bytes(bytes) as usize,
        Err(_) => return Err(format!("잘못된 길이 헤더: {} bytes", header.payload.len()).into()),
    };
    info!("Receiving {} bytes from {}", total, peer);

    let start = Instant::now();
    let mut data = Vec::with_capacity(total);
    while data.len() < total {
        let datagram = socket.receive()?;
        if datagram.peer != peer {
            warn!("ignoring message from {}", datagram.peer);
            continue;
        }
        data.extend_from_slice(&datagram.payload);
    }
    let elapsed = start.elapsed();

    info!(
        "Received {} bytes in {:.2}s ({:.2} KB/s)",
        data.len(),
        elapsed.as_secs_f64(),
        data.len() as f64 / 1024.0 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    if let Some(path) = &options.output_path {
        std::fs::write(path, &data)?;
        info!("Saved to {}", path.display());
    }

    // 송신 측 FIN이 ACK 받을 때까지 잠시 유지
    std::thread::sleep(linger);
    info!("{}", socket.stats().summary());
    socket.close()?;

    Ok(())
}
