//! # GUDP (Go-Back-N UDP)
//!
//! UDP 위의 신뢰성 있는 순서 보장 데이터그램 스트림
//!
//! ## 핵심 특징
//! - **Go-Back-N**: 고정 윈도우, 누적 ACK, 타임아웃 시 윈도우 전체 재전송
//! - **BSN/DATA/FIN**: 전송 시작 시퀀스, 데이터, 종료 마커
//! - **peer 별 endpoint**: 한 소켓으로 여러 peer와 동시에 송수신
//! - **재전송 한도**: 한도 초과 시 송신 엔진 종료 후 API 호출자에게 에러 전달
//! - **손실 정책**: 테스트용 인위적 패킷 손실 (첫 BSN/DATA/ACK/FIN, 확률, 전부)
//! - **메모리 시뮬레이터**: 손실/중복/재정렬 링크 위에서 엔진 검증
//!
//! ```no_run
//! use gudp::{Config, GudpSocket};
//!
//! # fn main() -> gudp::Result<()> {
//! let socket = GudpSocket::bind("0.0.0.0:0", Config::default())?;
//! socket.send("127.0.0.1:9000".parse().unwrap(), b"hello")?;
//! socket.finish()?;
//! socket.close()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod drop_policy;
pub mod endpoint;
pub mod error;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod simulator;
pub mod socket;
pub mod stats;
pub mod transport;

pub use config::Config;
pub use drop_policy::{DropPolicies, DropPolicy, DropRole};
pub use endpoint::{Endpoint, EndpointTable, SenderState};
pub use error::{Error, Result};
pub use packet::{Packet, PacketType};
pub use simulator::{LinkFaults, MemoryTransport, Network};
pub use socket::{Datagram, GudpSocket};
pub use stats::TransferStats;
pub use transport::{Transport, UdpTransport};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 최대 데이터그램 크기 (헤더 포함)
pub const MAX_DATAGRAM_LEN: usize = 1500;

/// 헤더 크기: version(1) + type(1) + seqno(4) + payload_len(2)
pub const HEADER_SIZE: usize = 8;

/// 최대 페이로드 크기
pub const MAX_PAYLOAD_LEN: usize = MAX_DATAGRAM_LEN - HEADER_SIZE;
