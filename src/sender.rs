//! 송신 엔진
//!
//! - 송신 테이블의 모든 endpoint에 대해 tick마다 GBN FSM 한 단계 실행
//! - 재전송 타이머 만료 감지 및 윈도우 전체 재전송 (go back N)
//! - 재전송 한도 초과 시 엔진 종료 (소켓 facade가 감지)
//!
//! ```text
//!  INIT ──▶ WAIT ──(미전송 패킷)──▶ SEND ──▶ WAIT
//!            ▲                       ▲
//!   ACK ──▶ RCV ─────────────────────┤
//!  만료 ──▶ TIMEOUT ──(재전송)───────┘
//! ```

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, SenderState};
use crate::socket::{Shared, Termination};
use crate::{Error, Result};

/// 송신 엔진 핸들
///
/// 수신 엔진도 ACK 처리 시 같은 FSM을 실행하므로 복제해서 나눠 가진다.
#[derive(Clone)]
pub struct SenderEngine {
    shared: Arc<Shared>,
}

impl SenderEngine {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// 백그라운드 스레드로 시작
    pub(crate) fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("gudp-sender".into())
            .spawn(move || self.run())
    }

    fn is_running(&self) -> bool {
        self.shared.sender_running.load(Ordering::SeqCst)
    }

    fn run(&self) {
        info!("GUDP sender engine started");

        let exit = match self.run_loop() {
            Ok(()) => Termination::Stopped,
            // close() 도중 닫힌 전송 계층
            Err(Error::TransportFailed(_)) if !self.is_running() => Termination::Stopped,
            Err(e) => {
                warn!("송신 엔진 종료: {}", e);
                Termination::from_error(&e)
            }
        };
        self.shared.record_sender_exit(exit);

        {
            let _table = self.shared.outbound.lock();
            self.shared.sender_running.store(false, Ordering::SeqCst);
            self.shared.outbound.notify_all();
        }
        info!("GUDP sender engine stopped");
    }

    fn run_loop(&self) -> Result<()> {
        let tick = self.shared.config.sender_tick();

        while self.is_running() {
            {
                let mut table = self.shared.outbound.lock();
                if !self.is_running() {
                    break;
                }

                if table.is_empty() {
                    self.shared.outbound.notify_all();
                    self.shared.outbound.wait(&mut table);
                    continue;
                }

                let now = Instant::now();
                for ep in table.iter_mut() {
                    if ep.poll_timer(now) {
                        self.shared.stats.write().timeouts += 1;
                        debug!("TIMEOUT {}: retry={} base={}", ep.peer(), ep.retry, ep.base);
                    }
                    self.step(ep)?;
                }

                // 완료된 전송 정리. 마지막 seq는 다음 ISN 추첨을 위해 남긴다.
                table.retain(|ep| {
                    let done = ep.finished && ep.is_queue_empty();
                    if done {
                        self.shared.finished_last.lock().insert(ep.peer(), ep.last);
                        debug!("outbound endpoint {} removed (last {})", ep.peer(), ep.last);
                    }
                    !done
                });

                if table.is_empty() {
                    self.shared.outbound.notify_all();
                } else if table.iter().all(Endpoint::is_queue_empty) && self.is_running() {
                    self.shared.outbound.wait(&mut table);
                }
            }

            // 잠금 밖에서 쉼
            thread::sleep(tick);
        }

        Ok(())
    }

    /// endpoint FSM 한 단계
    ///
    /// 호출자는 송신 테이블 잠금을 잡고 있어야 한다.
    pub(crate) fn step(&self, ep: &mut Endpoint) -> Result<()> {
        match ep.state {
            SenderState::Init => {
                ep.state = SenderState::Wait;
            }

            SenderState::Wait => {
                if ep.has_unsent() {
                    ep.state = SenderState::Send;
                } else {
                    self.shared.outbound.notify_all();
                }
            }

            SenderState::Send => {
                let max_payload = self.shared.config.max_payload_len();
                while ep.can_send() {
                    let seq = ep.next_seq;
                    let frame = match ep.packet(seq) {
                        Some(packet) => packet.encode(max_payload)?,
                        None => {
                            warn!("seq {} 패킷 없음: {}", seq, ep.peer());
                            break;
                        }
                    };
                    self.transmit(ep, &frame)?;
                    debug!("SEND {} -> {}", seq, ep.peer());

                    if ep.base == ep.next_seq {
                        ep.start_timer(Instant::now());
                    }
                    ep.next_seq = seq.wrapping_add(1);
                    self.shared.stats.write().packets_sent += 1;
                }
                ep.state = SenderState::Wait;
            }

            SenderState::Rcv => {
                if ep.next_seq == ep.base {
                    ep.stop_timer();
                    ep.retry = 0;
                } else {
                    ep.start_timer(Instant::now());
                }
                ep.state = SenderState::Send;
            }

            SenderState::Timeout => {
                if ep.retry >= ep.max_retry {
                    warn!(
                        "재전송 한도 초과: {} (retry {}/{})",
                        ep.peer(),
                        ep.retry,
                        ep.max_retry
                    );
                    self.shared.outbound.notify_all();
                    return Err(Error::RetryExhausted {
                        peer: ep.peer(),
                        retries: ep.retry,
                    });
                }

                ep.start_timer(Instant::now());
                let max_payload = self.shared.config.max_payload_len();
                let frames = ep
                    .unacked()
                    .map(|p| p.encode(max_payload))
                    .collect::<Result<Vec<_>>>()?;
                for frame in &frames {
                    self.transmit(ep, frame)?;
                }
                debug!(
                    "RESEND {}..{} -> {} (retry {})",
                    ep.base,
                    ep.next_seq,
                    ep.peer(),
                    ep.retry + 1
                );

                {
                    let mut stats = self.shared.stats.write();
                    stats.retransmitted_packets += frames.len() as u64;
                }
                ep.retry += 1;
                ep.state = SenderState::Send;
            }
        }

        Ok(())
    }

    /// 유효한 ACK 반영 후 호출: RCV 처리와 이어지는 전송을 바로 실행
    pub(crate) fn on_ack(&self, ep: &mut Endpoint) -> Result<()> {
        ep.state = SenderState::Rcv;
        self.step(ep)?;
        self.step(ep)?;
        self.shared.outbound.notify_all();
        Ok(())
    }

    fn transmit(&self, ep: &Endpoint, frame: &[u8]) -> Result<()> {
        self.shared
            .transport
            .send_to(frame, ep.peer())
            .map_err(|e| Error::TransportFailed(format!("send to {}: {}", ep.peer(), e)))
    }
}
