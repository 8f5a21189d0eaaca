//! 에러 타입 정의

use std::net::SocketAddr;

use thiserror::Error;

/// GUDP 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("인코딩 에러: payload {len} bytes, 최대 {max} bytes")]
    Encoding { len: usize, max: usize },

    #[error("디코딩 에러: {0}")]
    Decoding(String),

    #[error("재전송 한도 초과: peer={peer}, retries={retries}")]
    RetryExhausted { peer: SocketAddr, retries: u32 },

    #[error("전송 계층 실패: {0}")]
    TransportFailed(String),

    #[error("소켓 종료됨")]
    Closed,

    #[error("잘못된 설정: {0}")]
    InvalidConfig(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Decoding(e.to_string())
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
