//! 수신 엔진
//!
//! - 전송 계층에서 데이터그램을 받아 타입별로 분기
//! - ACK: 송신 endpoint 윈도우 전진 후 송신 FSM 실행
//! - BSN/DATA/FIN: 순서대로 받은 것만 수락하고 누적 ACK 응답
//! - 테스트용 손실 정책 적용

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::drop_policy::DropPolicy;
use crate::endpoint::{find_mut, Endpoint};
use crate::packet::{Packet, PacketType};
use crate::sender::SenderEngine;
use crate::socket::{Shared, Termination};
use crate::{Error, Result};

/// 수신 엔진
pub struct ReceiverEngine {
    shared: Arc<Shared>,
    sender: SenderEngine,
}

fn roll() -> f64 {
    rand::thread_rng().gen()
}

impl ReceiverEngine {
    pub(crate) fn new(shared: Arc<Shared>, sender: SenderEngine) -> Self {
        Self { shared, sender }
    }

    /// 백그라운드 스레드로 시작
    pub(crate) fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("gudp-receiver".into())
            .spawn(move || self.run())
    }

    fn is_running(&self) -> bool {
        self.shared.receiver_running.load(Ordering::SeqCst)
    }

    fn run(&self) {
        info!("GUDP receiver engine started");

        let exit = match self.run_loop() {
            Ok(()) => Termination::Stopped,
            Err(Error::TransportFailed(_)) if !self.is_running() => Termination::Stopped,
            Err(e) => {
                warn!("수신 엔진 종료: {}", e);
                Termination::from_error(&e)
            }
        };
        self.shared.record_receiver_exit(exit);

        {
            let _table = self.shared.inbound.lock();
            self.shared.receiver_running.store(false, Ordering::SeqCst);
            self.shared.inbound.notify_all();
        }
        info!("GUDP receiver engine stopped");
    }

    fn run_loop(&self) -> Result<()> {
        let mut buf = vec![0u8; self.shared.config.max_datagram_len];

        while self.is_running() {
            let (len, src) = match self.shared.transport.recv_from(&mut buf) {
                Ok(received) => received,
                Err(_) if !self.is_running() => break,
                Err(e) => return Err(Error::TransportFailed(format!("receive: {}", e))),
            };

            let packet = match Packet::decode(&buf[..len], src) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("패킷 디코딩 실패 ({}): {}", src, e);
                    self.shared.stats.write().decode_errors += 1;
                    continue;
                }
            };

            self.handle_packet(packet)?;
        }

        Ok(())
    }

    /// 패킷 하나 처리
    pub(crate) fn handle_packet(&self, packet: Packet) -> Result<()> {
        let policy = self.shared.drops.read().receiver;

        if policy == DropPolicy::All {
            debug!("RCV {} {} from {}: DROP (ALL)", packet.kind, packet.seqno, packet.peer);
            self.shared.stats.write().simulated_drops += 1;
            return Ok(());
        }

        match packet.kind {
            PacketType::Ack => self.handle_ack(packet),
            PacketType::Bsn => self.handle_bsn(packet, policy),
            PacketType::Data | PacketType::Fin => self.handle_in_order(packet, policy),
        }
    }

    fn handle_ack(&self, packet: Packet) -> Result<()> {
        let policy = self.shared.drops.read().sender;
        let mut table = self.shared.outbound.lock();

        let ep = match find_mut(&mut table, packet.peer) {
            Some(ep) => ep,
            None => {
                debug!("RCV ACK {} from {}: no outbound endpoint", packet.seqno, packet.peer);
                return Ok(());
            }
        };

        if policy.should_drop(PacketType::Ack, ep.drop_send_once, roll()) {
            if policy.targets_first(PacketType::Ack) {
                ep.drop_send_once = true;
            }
            debug!("RCV ACK {} from {}: DROP ({})", packet.seqno, packet.peer, policy);
            self.shared.stats.write().simulated_drops += 1;
            return Ok(());
        }

        let before = ep.base;
        if !ep.acknowledge(packet.seqno) {
            debug!(
                "RCV ACK {} from {}: out of window [{}, {}]",
                packet.seqno,
                packet.peer,
                ep.base,
                ep.last
            );
            self.shared.stats.write().stale_acks += 1;
            return Ok(());
        }
        debug!("RCV ACK {} from {}", packet.seqno, packet.peer);

        {
            let mut stats = self.shared.stats.write();
            stats.acks_received += 1;
            stats.packets_acked += (ep.base as i64 - before as i64).max(0) as u64;
        }

        // 송신 경로 실패는 송신 엔진의 종료 사유
        if let Err(e) = self.sender.on_ack(ep) {
            self.shared.abort_sender(&e);
        }
        Ok(())
    }

    fn handle_bsn(&self, packet: Packet, policy: DropPolicy) -> Result<()> {
        let seq = packet.seqno;
        let peer = packet.peer;
        let mut table = self.shared.inbound.lock();

        let idx = match table.iter().position(|ep| ep.peer() == peer) {
            Some(idx) => idx,
            None => {
                let mut ep = Endpoint::new(peer, &self.shared.config);
                if policy.should_drop(PacketType::Bsn, ep.drop_receive_once, roll()) {
                    ep.drop_receive_once = policy.targets_first(PacketType::Bsn);
                    ep.expected_seq = seq;
                    debug!("RCV BSN {} from {}: DROP ({})", seq, peer, policy);
                    self.shared.stats.write().simulated_drops += 1;
                } else {
                    ep.expected_seq = seq.wrapping_add(1);
                    info!("new inbound endpoint {} (BSN {})", peer, seq);
                    self.send_ack(&mut ep, seq.wrapping_add(1), policy)?;
                }
                table.push(ep);
                return Ok(());
            }
        };
        let ep = &mut table[idx];

        if ep.finished {
            // 이전 전송의 늦은 BSN 재전송 (윈도우 끝 포함)
            let distance = (seq as i64 - ep.expected_seq as i64).abs();
            if distance <= ep.window_size() as i64 {
                debug!("RCV BSN {} from {}: stale, ignored", seq, peer);
                return Ok(());
            }

            // 새 전송의 첫 BSN
            let dropped = policy.should_drop(PacketType::Bsn, false, roll());
            ep.reset_for_new_transmission();
            if dropped {
                ep.drop_receive_once = policy.targets_first(PacketType::Bsn);
                ep.expected_seq = seq;
                debug!("RCV BSN {} from {}: DROP ({}), endpoint reset", seq, peer, policy);
                self.shared.stats.write().simulated_drops += 1;
                return Ok(());
            }
            ep.expected_seq = seq.wrapping_add(1);
            info!("inbound endpoint {} reset for new transmission (BSN {})", peer, seq);
            return self.send_ack(ep, seq.wrapping_add(1), policy);
        }

        if policy.should_drop(PacketType::Bsn, ep.drop_receive_once, roll()) {
            if policy.targets_first(PacketType::Bsn) {
                ep.drop_receive_once = true;
            }
            debug!("RCV BSN {} from {}: DROP ({})", seq, peer, policy);
            self.shared.stats.write().simulated_drops += 1;
            return Ok(());
        }

        if seq == ep.expected_seq {
            ep.expected_seq = seq.wrapping_add(1);
            debug!("RCV BSN {} from {}", seq, peer);
            self.send_ack(ep, seq.wrapping_add(1), policy)
        } else {
            // 이미 받은 BSN: 상태는 그대로 두고 마지막 ACK만 다시 보냄
            debug!("RCV BSN {} from {}: duplicate, expected {}", seq, peer, ep.expected_seq);
            let ack = ep.expected_seq;
            self.send_ack(ep, ack, policy)
        }
    }

    /// DATA/FIN 공통 처리
    fn handle_in_order(&self, packet: Packet, policy: DropPolicy) -> Result<()> {
        let seq = packet.seqno;
        let peer = packet.peer;
        let kind = packet.kind;
        let mut table = self.shared.inbound.lock();

        let ep = match find_mut(&mut table, peer) {
            Some(ep) => ep,
            None => {
                debug!("RCV {} {} from {}: no inbound endpoint", kind, seq, peer);
                return Ok(());
            }
        };

        if policy.should_drop(kind, ep.drop_receive_once, roll()) {
            if policy.targets_first(kind) {
                ep.drop_receive_once = true;
            }
            debug!("RCV {} {} from {}: DROP ({})", kind, seq, peer, policy);
            self.shared.stats.write().simulated_drops += 1;
            return Ok(());
        }

        if seq == ep.expected_seq {
            ep.expected_seq = seq.wrapping_add(1);
            match kind {
                PacketType::Fin => {
                    ep.finished = true;
                    info!("RCV FIN {} from {}: transmission finished", seq, peer);
                }
                _ => {
                    debug!("RCV DATA {} from {} ({} bytes)", seq, peer, packet.payload.len());
                    {
                        let mut stats = self.shared.stats.write();
                        stats.data_delivered += 1;
                        stats.bytes_delivered += packet.payload.len() as u64;
                    }
                    ep.deliver(packet.payload);
                }
            }
            self.send_ack(ep, seq.wrapping_add(1), policy)?;
            self.shared.inbound.notify_all();
            Ok(())
        } else if ep.in_receive_window(seq) {
            debug!("RCV {} {} from {}: expected {}", kind, seq, peer, ep.expected_seq);
            self.shared.stats.write().out_of_order += 1;
            let ack = ep.expected_seq;
            self.send_ack(ep, ack, policy)
        } else {
            debug!("RCV {} {} from {}: outside receive window, ignored", kind, seq, peer);
            Ok(())
        }
    }

    /// 누적 ACK 전송 (`ack` = 다음에 기대하는 seq)
    fn send_ack(&self, ep: &mut Endpoint, ack: i32, policy: DropPolicy) -> Result<()> {
        if policy.targets_first(PacketType::Ack) && !ep.drop_receive_once {
            ep.drop_receive_once = true;
            debug!("SEND ACK {} -> {}: DROP ({})", ack, ep.peer(), policy);
            self.shared.stats.write().simulated_drops += 1;
            return Ok(());
        }

        let frame = Packet::ack(ep.peer(), ack).encode(self.shared.config.max_payload_len())?;
        self.shared
            .transport
            .send_to(&frame, ep.peer())
            .map_err(|e| Error::TransportFailed(format!("send ACK to {}: {}", ep.peer(), e)))?;
        debug!("SEND ACK {} -> {}", ack, ep.peer());
        self.shared.stats.write().acks_sent += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use bytes::Bytes;

    use crate::drop_policy::DropRole;
    use crate::endpoint::SenderState;
    use crate::transport::RecordingTransport;
    use crate::Config;

    fn remote() -> SocketAddr {
        "10.0.0.2:2000".parse().unwrap()
    }

    fn harness(config: Config) -> (ReceiverEngine, Arc<Shared>, Arc<RecordingTransport>) {
        let capture = Arc::new(RecordingTransport::default());
        let shared = Arc::new(Shared::new(config, capture.clone()));
        let sender = SenderEngine::new(shared.clone());
        (ReceiverEngine::new(shared.clone(), sender), shared, capture)
    }

    fn acks(capture: &RecordingTransport) -> Vec<i32> {
        capture
            .take()
            .into_iter()
            .filter(|p| p.kind == PacketType::Ack)
            .map(|p| p.seqno)
            .collect()
    }

    fn data(seq: i32, body: &'static [u8]) -> Packet {
        Packet::data(remote(), seq, Bytes::from_static(body))
    }

    fn inbound<R>(shared: &Shared, f: impl FnOnce(&mut Endpoint) -> R) -> R {
        let mut table = shared.inbound.lock();
        f(find_mut(&mut table, remote()).unwrap())
    }

    fn delivered(shared: &Shared) -> Vec<Bytes> {
        inbound(shared, |ep| std::iter::from_fn(|| ep.pop_delivered()).collect())
    }

    #[test]
    fn test_in_order_transmission() {
        let (engine, shared, capture) = harness(Config::default());

        engine.handle_packet(Packet::bsn(remote(), 100)).unwrap();
        engine.handle_packet(data(101, b"x")).unwrap();
        engine.handle_packet(data(102, b"y")).unwrap();
        engine.handle_packet(Packet::fin(remote(), 103)).unwrap();

        assert_eq!(acks(&capture), vec![101, 102, 103, 104]);
        assert_eq!(delivered(&shared), vec![Bytes::from_static(b"x"), Bytes::from_static(b"y")]);
        assert!(inbound(&shared, |ep| ep.finished));
    }

    #[test]
    fn test_gap_reacks_expected() {
        let (engine, shared, capture) = harness(Config::default());

        engine.handle_packet(Packet::bsn(remote(), 100)).unwrap();
        engine.handle_packet(data(101, b"x")).unwrap();
        // 102 유실
        engine.handle_packet(data(103, b"z")).unwrap();

        assert_eq!(acks(&capture), vec![101, 102, 102]);
        assert_eq!(delivered(&shared).len(), 1);
        assert_eq!(inbound(&shared, |ep| ep.expected_seq), 102);
    }

    #[test]
    fn test_far_out_of_window_is_ignored() {
        let (engine, shared, capture) = harness(Config::default());

        engine.handle_packet(Packet::bsn(remote(), 100)).unwrap();
        let _ = capture.take();
        engine.handle_packet(data(5000, b"far")).unwrap();

        assert!(acks(&capture).is_empty());
        assert_eq!(inbound(&shared, |ep| ep.expected_seq), 101);
    }

    #[test]
    fn test_retransmission_at_window_edge_is_reacked() {
        let config = Config {
            window_size: 1,
            ..Config::default()
        };
        let (engine, shared, capture) = harness(config);

        engine.handle_packet(Packet::bsn(remote(), 0)).unwrap();
        engine.handle_packet(data(1, b"x")).unwrap();
        // ACK 2 유실 후 같은 DATA 재전송
        engine.handle_packet(data(1, b"x")).unwrap();

        assert_eq!(acks(&capture), vec![1, 2, 2]);
        assert_eq!(delivered(&shared).len(), 1);

        engine.handle_packet(Packet::fin(remote(), 2)).unwrap();
        engine.handle_packet(Packet::fin(remote(), 2)).unwrap();
        assert_eq!(acks(&capture), vec![3, 3]);
        assert!(inbound(&shared, |ep| ep.finished));
    }

    #[test]
    fn test_whole_window_retransmission_is_reacked() {
        let config = Config {
            window_size: 3,
            ..Config::default()
        };
        let (engine, shared, capture) = harness(config);

        engine.handle_packet(Packet::bsn(remote(), 100)).unwrap();
        for seq in 101..=103 {
            engine.handle_packet(data(seq, b"w")).unwrap();
        }
        let _ = capture.take();

        // 세 ACK 모두 유실: 송신 측은 101부터 다시 보냄
        engine.handle_packet(data(101, b"w")).unwrap();

        assert_eq!(acks(&capture), vec![104]);
        assert_eq!(inbound(&shared, |ep| ep.expected_seq), 104);
        assert_eq!(delivered(&shared).len(), 3);
    }

    #[test]
    fn test_duplicate_bsn_only_reacks() {
        let (engine, shared, capture) = harness(Config::default());

        engine.handle_packet(Packet::bsn(remote(), 100)).unwrap();
        engine.handle_packet(data(101, b"x")).unwrap();
        engine.handle_packet(Packet::bsn(remote(), 100)).unwrap();

        assert_eq!(acks(&capture), vec![101, 102, 102]);
        assert_eq!(inbound(&shared, |ep| ep.expected_seq), 102);
    }

    #[test]
    fn test_data_without_endpoint_is_ignored() {
        let (engine, shared, capture) = harness(Config::default());
        engine.handle_packet(data(1, b"x")).unwrap();
        assert!(capture.take().is_empty());
        assert!(shared.inbound.lock().is_empty());
    }

    #[test]
    fn test_new_transmission_resets_finished_endpoint() {
        let (engine, shared, capture) = harness(Config::default());

        engine.handle_packet(Packet::bsn(remote(), 100)).unwrap();
        engine.handle_packet(data(101, b"old")).unwrap();
        engine.handle_packet(Packet::fin(remote(), 102)).unwrap();
        let _ = capture.take();

        // 이전 BSN 재전송은 무시
        engine.handle_packet(Packet::bsn(remote(), 100)).unwrap();
        assert!(acks(&capture).is_empty());
        assert!(inbound(&shared, |ep| ep.finished));

        engine.handle_packet(Packet::bsn(remote(), 9000)).unwrap();
        engine.handle_packet(data(9001, b"new")).unwrap();
        assert_eq!(acks(&capture), vec![9001, 9002]);

        // 아직 가져가지 않은 페이로드는 유지
        assert_eq!(
            delivered(&shared),
            vec![Bytes::from_static(b"old"), Bytes::from_static(b"new")]
        );
        assert!(!inbound(&shared, |ep| ep.finished));
    }

    #[test]
    fn test_first_bsn_dropped_once() {
        let config = Config {
            receiver_drop: DropPolicy::FirstBsn,
            ..Config::default()
        };
        let (engine, shared, capture) = harness(config);

        engine.handle_packet(Packet::bsn(remote(), 7)).unwrap();
        assert!(acks(&capture).is_empty());
        assert_eq!(inbound(&shared, |ep| ep.expected_seq), 7);

        // 재전송된 BSN은 수락
        engine.handle_packet(Packet::bsn(remote(), 7)).unwrap();
        assert_eq!(acks(&capture), vec![8]);
        assert_eq!(shared.stats.read().simulated_drops, 1);
    }

    #[test]
    fn test_first_data_and_fin_dropped_once() {
        for policy in [DropPolicy::FirstData, DropPolicy::FirstFin] {
            let (engine, _shared, capture) = harness(Config::default());
            engine.shared.drops.write().set(DropRole::Receiver, policy);

            engine.handle_packet(Packet::bsn(remote(), 0)).unwrap();
            engine.handle_packet(data(1, b"a")).unwrap();
            engine.handle_packet(data(1, b"a")).unwrap();
            engine.handle_packet(Packet::fin(remote(), 2)).unwrap();
            engine.handle_packet(Packet::fin(remote(), 2)).unwrap();

            let expected = match policy {
                // DATA 1 손실 후 재전송 수락, FIN 중복은 범위 안이라 재ACK
                DropPolicy::FirstData => vec![1, 2, 3, 3],
                _ => vec![1, 2, 2, 3],
            };
            assert_eq!(acks(&capture), expected, "{}", policy);
        }
    }

    #[test]
    fn test_first_ack_drops_outgoing_ack() {
        let config = Config {
            receiver_drop: DropPolicy::FirstAck,
            ..Config::default()
        };
        let (engine, _shared, capture) = harness(config);

        engine.handle_packet(Packet::bsn(remote(), 50)).unwrap();
        engine.handle_packet(Packet::bsn(remote(), 50)).unwrap();
        assert_eq!(acks(&capture), vec![51]);
    }

    #[test]
    fn test_receiver_drop_all() {
        let config = Config {
            receiver_drop: DropPolicy::All,
            ..Config::default()
        };
        let (engine, shared, capture) = harness(config);

        engine.handle_packet(Packet::bsn(remote(), 1)).unwrap();
        engine.handle_packet(data(2, b"x")).unwrap();
        assert!(capture.take().is_empty());
        assert!(shared.inbound.lock().is_empty());
        assert_eq!(shared.stats.read().simulated_drops, 2);
    }

    fn outbound_endpoint(shared: &Shared, isn: i32, payloads: usize) {
        let mut ep = Endpoint::new(remote(), &shared.config);
        ep.begin_transmission(isn);
        for _ in 0..payloads {
            ep.enqueue(data(0, b"p"));
        }
        ep.state = SenderState::Send;
        shared.outbound.lock().push(ep);
    }

    #[test]
    fn test_ack_advances_outbound_window() {
        let config = Config {
            window_size: 2,
            ..Config::default()
        };
        let (engine, shared, capture) = harness(config);
        outbound_endpoint(&shared, 10, 3);
        {
            let mut table = shared.outbound.lock();
            engine.sender.step(&mut table[0]).unwrap();
        }
        let _ = capture.take();

        engine.handle_packet(Packet::ack(remote(), 11)).unwrap();

        let sent: Vec<i32> = capture.take().iter().map(|p| p.seqno).collect();
        assert_eq!(sent, vec![12]);
        let table = shared.outbound.lock();
        assert_eq!((table[0].base, table[0].next_seq), (11, 13));
        assert_eq!(shared.stats.read().acks_received, 1);
    }

    #[test]
    fn test_send_failure_on_ack_stops_sender_only() {
        let config = Config {
            window_size: 1,
            ..Config::default()
        };
        let shared = Arc::new(Shared::new(config, Arc::new(RecordingTransport::broken())));
        let engine = ReceiverEngine::new(shared.clone(), SenderEngine::new(shared.clone()));
        outbound_endpoint(&shared, 10, 1);
        {
            let mut table = shared.outbound.lock();
            table[0].next_seq = 11;
            table[0].state = SenderState::Wait;
        }

        // ACK 11로 윈도우가 열리면 DATA 11 전송 시도, 전송 계층 실패
        engine.handle_packet(Packet::ack(remote(), 11)).unwrap();

        assert!(!shared.sender_running.load(Ordering::SeqCst));
        assert!(shared.receiver_running.load(Ordering::SeqCst));
        assert!(matches!(shared.fatal_error(), Some(Error::TransportFailed(_))));
    }

    #[test]
    fn test_stale_ack_is_ignored() {
        let (engine, shared, _capture) = harness(Config::default());
        outbound_endpoint(&shared, 10, 1);

        engine.handle_packet(Packet::ack(remote(), 10)).unwrap();
        engine.handle_packet(Packet::ack(remote(), 99)).unwrap();

        assert_eq!(shared.outbound.lock()[0].base, 10);
        assert_eq!(shared.stats.read().stale_acks, 2);
    }

    #[test]
    fn test_sender_first_ack_drop() {
        let config = Config {
            sender_drop: DropPolicy::FirstAck,
            ..Config::default()
        };
        let (engine, shared, _capture) = harness(config);
        outbound_endpoint(&shared, 10, 1);
        {
            let mut table = shared.outbound.lock();
            engine.sender.step(&mut table[0]).unwrap();
        }

        engine.handle_packet(Packet::ack(remote(), 11)).unwrap();
        assert_eq!(shared.outbound.lock()[0].base, 10);

        engine.handle_packet(Packet::ack(remote(), 11)).unwrap();
        assert_eq!(shared.outbound.lock()[0].base, 11);
    }
}
