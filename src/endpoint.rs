//! Endpoint: 원격 peer 당 제어 블록
//!
//! 하나의 구조체가 송신 역할(GBN 윈도우)과 수신 역할(순서 보장 전달)
//! 상태를 모두 가진다. 실제로는 송신 테이블과 수신 테이블에 서로 다른
//! 인스턴스로 존재한다.
//!
//! ```text
//!   base          next_seq            last
//!    │               │                 │
//! ───┼───────────────┼─────────────────┼──▶ seq
//!    │<── in flight ─▶│<── 전송 대기 ──▶│
//!    └──────────── outbound FIFO ──────┘
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::packet::Packet;
use crate::Config;

/// GBN 송신 FSM 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Init,
    Wait,
    Send,
    Rcv,
    Timeout,
}

/// 단발성 재전송 타이머
///
/// 콜백 스레드 대신 deadline만 저장한다. 송신 엔진 tick이 만료를 확인하고
/// 상태를 TIMEOUT으로 바꾼다.
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    duration: Duration,
    deadline: Option<Instant>,
}

impl RetransmitTimer {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            deadline: None,
        }
    }

    /// 기존 타이머를 취소하고 새로 시작
    pub fn start(&mut self, now: Instant) {
        self.deadline = Some(now + self.duration);
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 만료됐으면 해제하고 true (한 번만 발화)
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// 원격 peer 제어 블록
#[derive(Debug)]
pub struct Endpoint {
    peer: SocketAddr,

    /// 아직 ACK 받지 못한 가장 낮은 seq
    pub base: i32,

    /// 다음에 전송할 seq
    pub next_seq: i32,

    /// 큐에 들어간 가장 높은 seq
    pub last: i32,

    /// [base, last] 구간 패킷
    outbound: VecDeque<Packet>,

    /// 현재 윈도우 재전송 횟수
    pub retry: u32,

    pub max_retry: u32,

    pub state: SenderState,

    timer: RetransmitTimer,

    /// 순서대로 다음에 받을 seq
    pub expected_seq: i32,

    /// 애플리케이션이 아직 가져가지 않은 페이로드
    delivered: VecDeque<Bytes>,

    /// FIN 수락(수신) 또는 finish() 완료(송신)
    pub finished: bool,

    window_size: usize,

    /// 송신 역할에서 "첫 번째" 손실을 이미 흉내냈는지
    pub drop_send_once: bool,

    /// 수신 역할에서 "첫 번째" 손실을 이미 흉내냈는지
    pub drop_receive_once: bool,
}

impl Endpoint {
    pub fn new(peer: SocketAddr, config: &Config) -> Self {
        Self {
            peer,
            base: 0,
            next_seq: 0,
            last: 0,
            outbound: VecDeque::with_capacity(config.window_size + 2),
            retry: 0,
            max_retry: config.max_retry,
            state: SenderState::Init,
            timer: RetransmitTimer::new(config.timeout()),
            expected_seq: 0,
            delivered: VecDeque::new(),
            finished: false,
            window_size: config.window_size,
            drop_send_once: false,
            drop_receive_once: false,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    // ───────────────────────────────────────────────────────────────
    // 송신 역할
    // ───────────────────────────────────────────────────────────────

    /// 새 전송 시작: BSN을 큐에 넣고 시퀀스 상태를 ISN으로 맞춤
    pub fn begin_transmission(&mut self, isn: i32) {
        self.outbound.clear();
        self.base = isn;
        self.next_seq = isn;
        self.last = isn;
        self.retry = 0;
        self.finished = false;
        self.state = SenderState::Init;
        self.timer.stop();
        self.outbound.push_back(Packet::bsn(self.peer, isn));
    }

    /// 다음 패킷에 붙일 seq
    pub fn next_enqueue_seq(&self) -> i32 {
        self.last.wrapping_add(1)
    }

    /// `last + 1` 위치에 패킷 추가
    pub fn enqueue(&mut self, mut packet: Packet) -> i32 {
        let seq = self.next_enqueue_seq();
        packet.seqno = seq;
        packet.peer = self.peer;
        self.outbound.push_back(packet);
        self.last = seq;
        seq
    }

    /// seq에 해당하는 패킷 (큐에 그대로 남음)
    pub fn packet(&self, seq: i32) -> Option<&Packet> {
        let front = self.outbound.front()?.seqno;
        let idx = (seq as i64) - (front as i64);
        if idx < 0 {
            return None;
        }
        self.outbound
            .get(idx as usize)
            .filter(|p| p.seqno == seq)
            .or_else(|| self.outbound.iter().find(|p| p.seqno == seq))
    }

    /// 아직 한 번도 보내지 않은 패킷이 있는지
    pub fn has_unsent(&self) -> bool {
        self.outbound
            .back()
            .map_or(false, |p| p.seqno >= self.next_seq)
    }

    /// 윈도우에 여유가 있고 보낼 패킷이 있는지
    pub fn can_send(&self) -> bool {
        self.in_flight() < self.window_size as i64 && self.next_seq <= self.last
    }

    /// 전송했지만 ACK 받지 못한 패킷 수
    pub fn in_flight(&self) -> i64 {
        self.next_seq as i64 - self.base as i64
    }

    pub fn queue_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn is_queue_empty(&self) -> bool {
        self.outbound.is_empty()
    }

    /// 큐가 비었고 마지막 패킷까지 ACK 받음
    pub fn is_drained(&self) -> bool {
        self.outbound.is_empty() && self.base > self.last
    }

    /// 누적 ACK 적용
    ///
    /// `base <= ack-1 <= last`일 때만 seq < ack 패킷을 제거하고
    /// `base = ack`. 범위 밖이면 아무것도 바꾸지 않고 false.
    pub fn acknowledge(&mut self, ack: i32) -> bool {
        let acked = ack as i64 - 1;
        if acked < self.base as i64 || acked > self.last as i64 {
            return false;
        }
        while self
            .outbound
            .front()
            .map_or(false, |p| (p.seqno as i64) < ack as i64)
        {
            self.outbound.pop_front();
        }
        self.base = ack;
        if self.next_seq < self.base {
            self.next_seq = self.base;
        }
        true
    }

    /// [base, next_seq) 구간 패킷 (재전송용)
    pub fn unacked(&self) -> impl Iterator<Item = &Packet> {
        let next_seq = self.next_seq;
        self.outbound.iter().take_while(move |p| p.seqno < next_seq)
    }

    pub fn start_timer(&mut self, now: Instant) {
        self.timer.start(now);
    }

    pub fn stop_timer(&mut self) {
        self.timer.stop();
    }

    pub fn timer(&self) -> &RetransmitTimer {
        &self.timer
    }

    /// 타이머 만료 확인, 만료 시 상태를 TIMEOUT으로
    pub fn poll_timer(&mut self, now: Instant) -> bool {
        if self.timer.fire_if_due(now) {
            self.state = SenderState::Timeout;
            true
        } else {
            false
        }
    }

    // ───────────────────────────────────────────────────────────────
    // 수신 역할
    // ───────────────────────────────────────────────────────────────

    /// 순서대로 도착한 페이로드 보관
    pub fn deliver(&mut self, payload: Bytes) {
        self.delivered.push_back(payload);
    }

    pub fn pop_delivered(&mut self) -> Option<Bytes> {
        self.delivered.pop_front()
    }

    pub fn has_delivered(&self) -> bool {
        !self.delivered.is_empty()
    }

    pub fn delivered_len(&self) -> usize {
        self.delivered.len()
    }

    /// seq가 현재 수신 윈도우 근처인지: `[expected - window, expected + window)`
    ///
    /// 아래쪽 끝은 ACK가 모두 유실된 윈도우의 첫 패킷 재전송이라 포함한다.
    pub fn in_receive_window(&self, seq: i32) -> bool {
        let window = self.window_size as i64;
        let expected = self.expected_seq as i64;
        let seq = seq as i64;
        seq >= expected - window && seq < expected + window
    }

    /// 새 전송을 위한 초기화
    ///
    /// 시퀀스 상태와 손실 플래그만 지운다. 이미 ACK한 페이로드는
    /// 애플리케이션이 가져갈 때까지 남겨둔다.
    pub fn reset_for_new_transmission(&mut self) {
        self.outbound.clear();
        self.retry = 0;
        self.base = 0;
        self.next_seq = 0;
        self.last = 0;
        self.expected_seq = 0;
        self.finished = false;
        self.drop_receive_once = false;
        self.timer.stop();
    }
}

/// Mutex + Condvar로 보호되는 endpoint 목록
#[derive(Debug, Default)]
pub struct EndpointTable {
    endpoints: Mutex<Vec<Endpoint>>,
    cond: Condvar,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<Endpoint>> {
        self.endpoints.lock()
    }

    pub fn wait(&self, guard: &mut MutexGuard<'_, Vec<Endpoint>>) {
        self.cond.wait(guard);
    }

    pub fn wait_for(&self, guard: &mut MutexGuard<'_, Vec<Endpoint>>, timeout: Duration) {
        let _ = self.cond.wait_for(guard, timeout);
    }

    pub fn notify_one(&self) {
        self.cond.notify_one();
    }

    pub fn notify_all(&self) {
        self.cond.notify_all();
    }
}

/// peer에 해당하는 endpoint 찾기
pub fn find_mut<'a>(endpoints: &'a mut [Endpoint], peer: SocketAddr) -> Option<&'a mut Endpoint> {
    endpoints.iter_mut().find(|ep| ep.peer == peer)
}
