//! GUDP 소켓
//!
//! 애플리케이션이 쓰는 유일한 진입점. 송신/수신 엔진 스레드를 띄우고
//! 두 endpoint 테이블을 공유한다.
//!
//! ```text
//!  send() ──▶ outbound table ◀── SenderEngine (tick) ──▶ Transport
//!                  ▲                                        │
//!                  └──── ACK ── ReceiverEngine ◀────────────┘
//!  receive() ◀── inbound table ◀──── BSN/DATA/FIN ──┘
//! ```

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::drop_policy::{DropPolicies, DropPolicy, DropRole};
use crate::endpoint::{Endpoint, EndpointTable};
use crate::packet::Packet;
use crate::receiver::ReceiverEngine;
use crate::sender::SenderEngine;
use crate::stats::TransferStats;
use crate::transport::{Transport, UdpTransport};
use crate::{Config, Error, Result};

/// ISN 재추첨 최대 횟수
const ISN_DRAW_ATTEMPTS: usize = 16;

/// 엔진 종료 사유
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Termination {
    /// close()에 의한 정상 종료
    Stopped,
    RetryExhausted { peer: SocketAddr, retries: u32 },
    TransportFailed(String),
}

impl Termination {
    pub(crate) fn from_error(e: &Error) -> Self {
        match e {
            Error::RetryExhausted { peer, retries } => Termination::RetryExhausted {
                peer: *peer,
                retries: *retries,
            },
            Error::TransportFailed(cause) => Termination::TransportFailed(cause.clone()),
            other => Termination::TransportFailed(other.to_string()),
        }
    }

    fn to_error(&self) -> Option<Error> {
        match self {
            Termination::Stopped => None,
            Termination::RetryExhausted { peer, retries } => Some(Error::RetryExhausted {
                peer: *peer,
                retries: *retries,
            }),
            Termination::TransportFailed(cause) => Some(Error::TransportFailed(cause.clone())),
        }
    }
}

/// 소켓과 두 엔진이 공유하는 상태
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) outbound: EndpointTable,
    pub(crate) inbound: EndpointTable,
    pub(crate) drops: RwLock<DropPolicies>,
    pub(crate) stats: RwLock<TransferStats>,
    /// 송신 테이블에서 정리된 peer별 마지막 seq (다음 ISN 추첨용)
    pub(crate) finished_last: Mutex<HashMap<SocketAddr, i32>>,
    pub(crate) sender_running: AtomicBool,
    pub(crate) receiver_running: AtomicBool,
    sender_exit: Mutex<Option<Termination>>,
    receiver_exit: Mutex<Option<Termination>>,
}

impl Shared {
    pub(crate) fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        let drops = DropPolicies {
            sender: config.sender_drop,
            receiver: config.receiver_drop,
        };
        Self {
            config,
            transport,
            outbound: EndpointTable::new(),
            inbound: EndpointTable::new(),
            drops: RwLock::new(drops),
            stats: RwLock::new(TransferStats::new()),
            finished_last: Mutex::new(HashMap::new()),
            sender_running: AtomicBool::new(true),
            receiver_running: AtomicBool::new(true),
            sender_exit: Mutex::new(None),
            receiver_exit: Mutex::new(None),
        }
    }

    /// 처음 기록된 사유만 유지
    pub(crate) fn record_sender_exit(&self, exit: Termination) {
        let mut slot = self.sender_exit.lock();
        if slot.is_none() {
            *slot = Some(exit);
        }
    }

    pub(crate) fn record_receiver_exit(&self, exit: Termination) {
        let mut slot = self.receiver_exit.lock();
        if slot.is_none() {
            *slot = Some(exit);
        }
    }

    /// 수신 엔진이 ACK 처리 중 송신 경로에서 실패했을 때 송신 엔진 종료
    ///
    /// 호출자는 송신 테이블 잠금을 잡고 있어야 한다.
    pub(crate) fn abort_sender(&self, e: &Error) {
        if !self.sender_running.load(Ordering::SeqCst) {
            return;
        }
        warn!("송신 엔진 종료: {}", e);
        self.record_sender_exit(Termination::from_error(e));
        self.sender_running.store(false, Ordering::SeqCst);
        self.outbound.notify_all();
    }

    /// 엔진을 멈추게 한 치명적 에러
    pub(crate) fn fatal_error(&self) -> Option<Error> {
        let sender = self.sender_exit.lock().as_ref().and_then(Termination::to_error);
        sender.or_else(|| self.receiver_exit.lock().as_ref().and_then(Termination::to_error))
    }

    /// 두 엔진에 정지 신호 (각 테이블 잠금 아래에서 깨움)
    fn stop_engines(&self) {
        {
            let _table = self.outbound.lock();
            self.sender_running.store(false, Ordering::SeqCst);
            self.outbound.notify_all();
        }
        {
            let _table = self.inbound.lock();
            self.receiver_running.store(false, Ordering::SeqCst);
            self.inbound.notify_all();
        }
    }
}

/// 수신한 메시지 하나
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub peer: SocketAddr,
    pub payload: Bytes,
}

/// 신뢰성 있는 순서 보장 데이터그램 소켓
pub struct GudpSocket {
    shared: Arc<Shared>,
    sender_handle: Mutex<Option<JoinHandle<()>>>,
    receiver_handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl GudpSocket {
    /// UDP 주소에 바인드하고 엔진 시작
    pub fn bind<A: ToSocketAddrs>(addr: A, config: Config) -> Result<Self> {
        config.validate()?;
        let transport = UdpTransport::bind(addr, config.recv_poll())?;
        Self::with_transport(transport, config)
    }

    /// 임의의 전송 계층 위에서 엔진 시작
    pub fn with_transport<T: Transport + 'static>(transport: T, config: Config) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared::new(config, Arc::new(transport)));
        let sender = SenderEngine::new(shared.clone());
        let receiver = ReceiverEngine::new(shared.clone(), sender.clone());

        let sender_handle = sender.spawn()?;
        let receiver_handle = match receiver.spawn() {
            Ok(handle) => handle,
            Err(e) => {
                shared.stop_engines();
                shared.transport.close();
                let _ = sender_handle.join();
                return Err(e.into());
            }
        };

        match shared.transport.local_addr() {
            Some(addr) => info!("GUDP socket started on {}", addr),
            None => info!("GUDP socket started"),
        }

        Ok(Self {
            shared,
            sender_handle: Mutex::new(Some(sender_handle)),
            receiver_handle: Mutex::new(Some(receiver_handle)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.transport.local_addr()
    }

    /// 메시지 하나를 peer에게 보낼 큐에 넣음 (블로킹 없음)
    ///
    /// 전송이 끝난(또는 처음 보는) peer면 새 BSN으로 전송을 시작한다.
    pub fn send(&self, peer: SocketAddr, data: &[u8]) -> Result<()> {
        self.check_alive()?;

        let max = self.shared.config.max_payload_len();
        if data.len() > max {
            return Err(Error::Encoding {
                len: data.len(),
                max,
            });
        }
        let payload = Bytes::copy_from_slice(data);

        let mut table = self.shared.outbound.lock();
        let idx = match table.iter().position(|ep| ep.peer() == peer) {
            Some(idx) => idx,
            None => {
                table.push(Endpoint::new(peer, &self.shared.config));
                let idx = table.len() - 1;
                let previous = self.shared.finished_last.lock().get(&peer).copied();
                let isn = draw_isn(previous, self.shared.config.window_size);
                table[idx].begin_transmission(isn);
                info!("new transmission to {} (BSN {})", peer, isn);
                idx
            }
        };

        let ep = &mut table[idx];
        if ep.finished {
            let isn = draw_isn(Some(ep.last), self.shared.config.window_size);
            ep.begin_transmission(isn);
            info!("new transmission to {} (BSN {})", peer, isn);
        }

        let seq = ep.enqueue(Packet::data(peer, 0, payload));
        debug!("queued DATA {} -> {} ({} bytes)", seq, peer, data.len());

        self.shared.outbound.notify_all();
        Ok(())
    }

    /// 순서대로 도착한 다음 메시지 (블로킹)
    pub fn receive(&self) -> Result<Datagram> {
        match self.receive_until(None)? {
            Some(datagram) => Ok(datagram),
            None => Err(Error::Closed),
        }
    }

    /// `receive`와 같지만 제한 시간이 지나면 `Ok(None)`
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<Datagram>> {
        self.receive_until(Some(Instant::now() + timeout))
    }

    /// 버퍼로 복사해 받음. 버퍼보다 긴 메시지는 잘린다.
    pub fn receive_into(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let datagram = self.receive()?;
        let len = datagram.payload.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram.payload[..len]);
        Ok((len, datagram.peer))
    }

    fn receive_until(&self, deadline: Option<Instant>) -> Result<Option<Datagram>> {
        let mut table = self.shared.inbound.lock();
        loop {
            if let Some(ep) = table.iter_mut().find(|ep| ep.has_delivered()) {
                if let Some(payload) = ep.pop_delivered() {
                    return Ok(Some(Datagram {
                        peer: ep.peer(),
                        payload,
                    }));
                }
            }

            if self.closed.load(Ordering::SeqCst)
                || !self.shared.receiver_running.load(Ordering::SeqCst)
            {
                return Err(self.shared.fatal_error().unwrap_or(Error::Closed));
            }

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    self.shared.inbound.wait_for(&mut table, deadline - now);
                }
                None => self.shared.inbound.wait(&mut table),
            }
        }
    }

    /// 큐에 넣은 모든 메시지를 보내고 FIN까지 ACK 받을 때까지 대기
    pub fn finish(&self) -> Result<()> {
        self.check_alive()?;

        {
            let mut table = self.shared.outbound.lock();
            for ep in table.iter_mut().filter(|ep| !ep.finished) {
                let peer = ep.peer();
                let seq = ep.enqueue(Packet::fin(peer, 0));
                debug!("queued FIN {} -> {}", seq, peer);
            }
            self.shared.outbound.notify_all();
        }

        let poll = self.shared.config.finish_poll();
        loop {
            {
                let mut table = self.shared.outbound.lock();
                if table.iter().all(Endpoint::is_drained) {
                    for ep in table.iter_mut() {
                        ep.finished = true;
                    }
                    info!("all transmissions finished");
                    return Ok(());
                }
            }

            thread::sleep(poll);
            self.check_alive()?;
        }
    }

    /// 엔진을 멈추고 전송 계층을 닫음. 여러 번 호출해도 안전하다.
    ///
    /// 엔진이 치명적 에러로 먼저 멈췄으면 그 에러를 돌려준다.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shared.stop_engines();
        self.shared.transport.close();

        for handle in [self.sender_handle.lock().take(), self.receiver_handle.lock().take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                warn!("engine thread panicked");
            }
        }

        info!("GUDP socket closed");
        match self.shared.fatal_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 역할별 손실 정책 교체 (테스트용)
    pub fn set_drop_policy(&self, role: DropRole, policy: DropPolicy) {
        info!("drop policy {:?} = {}", role, policy);
        self.shared.drops.write().set(role, policy);
    }

    pub fn drop_policy(&self, role: DropRole) -> DropPolicy {
        self.shared.drops.read().get(role)
    }

    /// 통계 스냅샷
    pub fn stats(&self) -> TransferStats {
        self.shared.stats.read().clone()
    }

    fn check_alive(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if let Some(e) = self.shared.fatal_error() {
            return Err(e);
        }
        if !self.shared.sender_running.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl Drop for GudpSocket {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("close on drop: {}", e);
        }
    }
}

/// `[0, i16::MAX)` 구간 ISN
///
/// 이전 전송이 있으면 수신 측이 늦은 BSN으로 오인하지 않도록
/// 마지막 seq 다음 값에서 윈도우보다 멀리 떨어진 값을 고른다.
fn draw_isn(previous_last: Option<i32>, window_size: usize) -> i32 {
    let mut rng = rand::thread_rng();
    let mut isn = rng.gen_range(0..i16::MAX as i32);

    if let Some(last) = previous_last {
        let expected = last as i64 + 1;
        for _ in 0..ISN_DRAW_ATTEMPTS {
            if (isn as i64 - expected).abs() > window_size as i64 {
                break;
            }
            isn = rng.gen_range(0..i16::MAX as i32);
        }
    }
    isn
}
