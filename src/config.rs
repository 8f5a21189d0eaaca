//! 프로토콜 설정

use std::time::Duration;

use crate::drop_policy::DropPolicy;
use crate::{Error, Result, HEADER_SIZE, MAX_DATAGRAM_LEN};

/// GUDP 프로토콜 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// GBN 윈도우 크기 (동시에 전송 중일 수 있는 패킷 수)
    pub window_size: usize,

    /// 재전송 타임아웃 (밀리초)
    pub timeout_ms: u64,

    /// 같은 윈도우에 대한 최대 재전송 횟수
    /// 초과하면 송신 엔진이 종료됨
    pub max_retry: u32,

    /// 최대 데이터그램 크기 (헤더 포함)
    pub max_datagram_len: usize,

    /// 송신 엔진 tick 간격 (밀리초)
    pub sender_tick_ms: u64,

    /// finish() 폴링 간격 (밀리초)
    /// sender_tick_ms보다 길어야 송신 엔진 종료를 감지할 수 있음
    pub finish_poll_ms: u64,

    /// UDP 수신 대기 간격 (밀리초)
    /// close() 후 수신 엔진이 빠져나오기까지의 최대 지연
    pub recv_poll_ms: u64,

    /// 송신 경로 손실 정책 (테스트용)
    pub sender_drop: DropPolicy,

    /// 수신 경로 손실 정책 (테스트용)
    pub receiver_drop: DropPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window_size: 3,
            timeout_ms: 3000,        // 3초
            max_retry: 7,
            max_datagram_len: MAX_DATAGRAM_LEN,
            sender_tick_ms: 50,
            finish_poll_ms: 200,
            recv_poll_ms: 100,
            sender_drop: DropPolicy::Nothing,
            receiver_drop: DropPolicy::Nothing,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 최대 페이로드 크기
    pub fn max_payload_len(&self) -> usize {
        self.max_datagram_len
            .saturating_sub(HEADER_SIZE)
            .min(u16::MAX as usize)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sender_tick(&self) -> Duration {
        Duration::from_millis(self.sender_tick_ms)
    }

    pub fn finish_poll(&self) -> Duration {
        Duration::from_millis(self.finish_poll_ms)
    }

    pub fn recv_poll(&self) -> Duration {
        Duration::from_millis(self.recv_poll_ms)
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(Error::InvalidConfig("window_size는 1 이상".into()));
        }
        if self.window_size > i16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "window_size {} 너무 큼",
                self.window_size
            )));
        }
        if self.max_datagram_len <= HEADER_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max_datagram_len {}은 헤더({})보다 커야 함",
                self.max_datagram_len, HEADER_SIZE
            )));
        }
        if self.timeout_ms == 0 || self.sender_tick_ms == 0 || self.recv_poll_ms == 0 {
            return Err(Error::InvalidConfig("타이머 간격은 0일 수 없음".into()));
        }
        for policy in [self.sender_drop, self.receiver_drop] {
            if let DropPolicy::Random(p) = policy {
                if !(0.0..=1.0).contains(&p) {
                    return Err(Error::InvalidConfig(format!("손실 확률 {} 범위 밖", p)));
                }
            }
        }
        Ok(())
    }

    /// 로컬/루프백 테스트용 설정
    pub fn fast_local() -> Self {
        Self {
            window_size: 8,
            timeout_ms: 100,
            max_retry: 20,
            max_datagram_len: MAX_DATAGRAM_LEN,
            sender_tick_ms: 2,
            finish_poll_ms: 10,
            recv_poll_ms: 20,
            sender_drop: DropPolicy::Nothing,
            receiver_drop: DropPolicy::Nothing,
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            window_size: 4,
            timeout_ms: 1500,
            max_retry: 15,
            max_datagram_len: 1200,          // 작은 데이터그램
            sender_tick_ms: 20,
            finish_poll_ms: 200,
            recv_poll_ms: 100,
            sender_drop: DropPolicy::Nothing,
            receiver_drop: DropPolicy::Nothing,
        }
    }
}
