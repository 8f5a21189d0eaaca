//! 전송 통계

use std::time::{Duration, Instant};

/// 전체 전송 통계
///
/// 두 엔진이 갱신하고 소켓이 스냅샷을 돌려준다.
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 처음 전송한 패킷 수 (BSN/DATA/FIN)
    pub packets_sent: u64,

    /// 타임아웃으로 재전송한 패킷 수
    pub retransmitted_packets: u64,

    /// 타임아웃 발생 횟수
    pub timeouts: u64,

    /// 누적 ACK로 확인된 패킷 수
    pub packets_acked: u64,

    /// 보낸 ACK 수
    pub acks_sent: u64,

    /// 받은 ACK 수 (유효 범위)
    pub acks_received: u64,

    /// 범위 밖이라 버린 ACK 수
    pub stale_acks: u64,

    /// 애플리케이션에 전달한 DATA 수
    pub data_delivered: u64,

    /// 전달한 페이로드 바이트
    pub bytes_delivered: u64,

    /// 순서가 어긋나 다시 ACK한 패킷 수
    pub out_of_order: u64,

    /// 테스트 정책으로 버린 패킷 수
    pub simulated_drops: u64,

    /// 디코딩 실패 수
    pub decode_errors: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            packets_sent: 0,
            retransmitted_packets: 0,
            timeouts: 0,
            packets_acked: 0,
            acks_sent: 0,
            acks_received: 0,
            stale_acks: 0,
            data_delivered: 0,
            bytes_delivered: 0,
            out_of_order: 0,
            simulated_drops: 0,
            decode_errors: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 재전송 비율 (재전송 / 전체 전송)
    pub fn retransmission_ratio(&self) -> f64 {
        let total = self.packets_sent + self.retransmitted_packets;
        if total == 0 {
            return 0.0;
        }
        self.retransmitted_packets as f64 / total as f64
    }

    /// 전달 처리율 (bytes/sec)
    pub fn delivery_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes_delivered as f64 / elapsed
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Sent: {} | Retransmitted: {} ({:.1}%) | Timeouts: {} | ACK rx/tx: {}/{} | Delivered: {} ({} bytes) | Drops: {}",
            self.elapsed().as_secs_f64(),
            self.packets_sent,
            self.retransmitted_packets,
            self.retransmission_ratio() * 100.0,
            self.timeouts,
            self.acks_received,
            self.acks_sent,
            self.data_delivered,
            self.bytes_delivered,
            self.simulated_drops,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}
