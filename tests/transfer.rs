//! 메모리 시뮬레이터 위에서 두 소켓 간 전송 통합 테스트
//!
//! 각 테스트는 독립된 `Network`를 만들고 그 위에 GUDP 소켓을 올린다.
//! 엔진은 실제 스레드로 돌고 링크 장애만 시뮬레이터가 흉내낸다.

use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use gudp::{Config, DropPolicy, DropRole, Error, GudpSocket, LinkFaults, Network};

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], port))
}

fn socket(network: &Network, port: u16, config: Config) -> GudpSocket {
    let transport = network.bind(addr(port)).expect("bind");
    GudpSocket::with_transport(transport, config).expect("socket")
}

/// 재전송 한도가 넉넉한 빠른 설정
fn patient() -> Config {
    Config {
        max_retry: 200,
        ..Config::fast_local()
    }
}

fn messages(count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| format!("message #{:04}", i).into_bytes())
        .collect()
}

fn collect(receiver: &GudpSocket, count: usize) -> Vec<(SocketAddr, Vec<u8>)> {
    (0..count)
        .map(|_| {
            let datagram = receiver
                .receive_timeout(RECEIVE_TIMEOUT)
                .expect("receive")
                .expect("message within timeout");
            (datagram.peer, datagram.payload.to_vec())
        })
        .collect()
}

/// a -> b 전송 후 b가 받은 페이로드
fn transfer(a: &GudpSocket, b: &GudpSocket, payloads: &[Vec<u8>]) -> Vec<Vec<u8>> {
    for payload in payloads {
        a.send(addr(2), payload).expect("send");
    }
    a.finish().expect("finish");
    collect(b, payloads.len())
        .into_iter()
        .map(|(peer, payload)| {
            assert_eq!(peer, addr(1));
            payload
        })
        .collect()
}

// ---------------------------------------------------------------------------
// 기본 전송
// ---------------------------------------------------------------------------

#[test]
fn test_ordered_delivery_on_clean_link() {
    let network = Network::new();
    let a = socket(&network, 1, Config::fast_local());
    let b = socket(&network, 2, Config::fast_local());

    let payloads = messages(40);
    assert_eq!(transfer(&a, &b, &payloads), payloads);

    let stats = a.stats();
    assert_eq!(stats.retransmitted_packets, 0);
    // BSN + DATA + FIN
    assert_eq!(stats.packets_sent, payloads.len() as u64 + 2);

    a.close().unwrap();
    b.close().unwrap();
}

#[test]
fn test_ordered_delivery_on_faulty_link() {
    let network = Network::with_faults(LinkFaults {
        loss_rate: 0.05,
        duplicate_rate: 0.05,
        reorder_rate: 0.05,
    });
    let a = socket(&network, 1, patient());
    let b = socket(&network, 2, patient());

    let payloads = messages(30);
    assert_eq!(transfer(&a, &b, &payloads), payloads);

    a.close().unwrap();
    b.close().unwrap();
}

#[test]
fn test_single_packet_window_on_lossy_link() {
    let network = Network::with_faults(LinkFaults::lossy(0.2));
    let config = Config {
        window_size: 1,
        max_retry: 30,
        ..Config::fast_local()
    };
    let a = socket(&network, 1, config.clone());
    let b = socket(&network, 2, config);

    let payloads = messages(20);
    assert_eq!(transfer(&a, &b, &payloads), payloads);

    a.close().unwrap();
    b.close().unwrap();
}

#[test]
fn test_empty_payload_is_delivered() {
    let network = Network::new();
    let a = socket(&network, 1, Config::fast_local());
    let b = socket(&network, 2, Config::fast_local());

    let payloads = vec![Vec::new(), b"after empty".to_vec()];
    assert_eq!(transfer(&a, &b, &payloads), payloads);
}

#[test]
fn test_second_transmission_to_same_peer() {
    let network = Network::new();
    let a = socket(&network, 1, Config::fast_local());
    let b = socket(&network, 2, Config::fast_local());

    let first = vec![b"one".to_vec(), b"two".to_vec()];
    assert_eq!(transfer(&a, &b, &first), first);

    let second = vec![b"three".to_vec()];
    assert_eq!(transfer(&a, &b, &second), second);
}

#[test]
fn test_two_senders_one_receiver() {
    let network = Network::new();
    let a = socket(&network, 1, Config::fast_local());
    let b = socket(&network, 2, Config::fast_local());
    let c = socket(&network, 3, Config::fast_local());

    let payloads = messages(10);
    thread::scope(|s| {
        for sender in [&a, &c] {
            let payloads = &payloads;
            s.spawn(move || {
                for payload in payloads {
                    sender.send(addr(2), payload).unwrap();
                }
                sender.finish().unwrap();
            });
        }
    });

    let received = collect(&b, payloads.len() * 2);
    for peer in [addr(1), addr(3)] {
        let from_peer: Vec<Vec<u8>> = received
            .iter()
            .filter(|(from, _)| *from == peer)
            .map(|(_, payload)| payload.clone())
            .collect();
        assert_eq!(from_peer, payloads, "messages from {}", peer);
    }
}

#[test]
fn test_bidirectional_transfer() {
    let network = Network::new();
    let a = socket(&network, 1, Config::fast_local());
    let b = socket(&network, 2, Config::fast_local());

    let payloads = messages(15);
    for payload in &payloads {
        a.send(addr(2), payload).unwrap();
        b.send(addr(1), payload).unwrap();
    }
    a.finish().unwrap();
    b.finish().unwrap();

    let at_b: Vec<Vec<u8>> = collect(&b, payloads.len()).into_iter().map(|(_, p)| p).collect();
    let at_a: Vec<Vec<u8>> = collect(&a, payloads.len()).into_iter().map(|(_, p)| p).collect();
    assert_eq!(at_b, payloads);
    assert_eq!(at_a, payloads);
}

// ---------------------------------------------------------------------------
// 손실 정책
// ---------------------------------------------------------------------------

#[test]
fn test_receiver_drop_policies_still_deliver() {
    let policies = [
        DropPolicy::FirstBsn,
        DropPolicy::FirstData,
        DropPolicy::FirstAck,
        DropPolicy::FirstFin,
        DropPolicy::Random(0.2),
    ];

    for policy in policies {
        let network = Network::new();
        let a = socket(&network, 1, patient());
        let b = socket(&network, 2, patient());
        b.set_drop_policy(DropRole::Receiver, policy);

        let payloads = messages(12);
        assert_eq!(transfer(&a, &b, &payloads), payloads, "policy {}", policy);

        if !matches!(policy, DropPolicy::Random(_)) {
            assert_eq!(b.stats().simulated_drops, 1, "policy {}", policy);
        }
        // 잃어버린 ACK는 다음 누적 ACK가 메워줄 수 있음
        if matches!(
            policy,
            DropPolicy::FirstBsn | DropPolicy::FirstData | DropPolicy::FirstFin
        ) {
            assert!(a.stats().timeouts >= 1, "policy {}", policy);
        }
    }
}

#[test]
fn test_sender_first_ack_drop_still_delivers() {
    let network = Network::new();
    let a = socket(
        &network,
        1,
        Config {
            sender_drop: DropPolicy::FirstAck,
            ..patient()
        },
    );
    let b = socket(&network, 2, patient());

    let payloads = messages(5);
    assert_eq!(transfer(&a, &b, &payloads), payloads);
    assert_eq!(a.stats().simulated_drops, 1);
}

#[test]
fn test_retry_exhaustion_is_reported() {
    let network = Network::new();
    let config = Config {
        timeout_ms: 20,
        max_retry: 3,
        sender_drop: DropPolicy::All,
        ..Config::fast_local()
    };
    let a = socket(&network, 1, config);
    let _b = socket(&network, 2, Config::fast_local());

    a.send(addr(2), b"lost forever").unwrap();
    match a.finish() {
        Err(Error::RetryExhausted { peer, retries }) => {
            assert_eq!(peer, addr(2));
            assert_eq!(retries, 3);
        }
        other => panic!("unexpected finish result: {:?}", other),
    }

    assert!(matches!(
        a.send(addr(2), b"again"),
        Err(Error::RetryExhausted { .. })
    ));
    assert!(matches!(a.close(), Err(Error::RetryExhausted { .. })));
    // 두 번째 close는 조용히 성공
    assert!(a.close().is_ok());
    assert_eq!(a.stats().timeouts, 4);
}

#[test]
fn test_receiver_drop_all_exhausts_sender() {
    let network = Network::new();
    let a = socket(
        &network,
        1,
        Config {
            timeout_ms: 20,
            max_retry: 2,
            ..Config::fast_local()
        },
    );
    let b = socket(&network, 2, Config::fast_local());
    b.set_drop_policy(DropRole::Receiver, DropPolicy::All);

    a.send(addr(2), b"x").unwrap();
    assert!(matches!(a.finish(), Err(Error::RetryExhausted { .. })));
    assert!(b.receive_timeout(Duration::from_millis(50)).unwrap().is_none());
}

#[test]
fn test_unreachable_peer_exhausts_sender() {
    let network = Network::new();
    let a = socket(
        &network,
        1,
        Config {
            timeout_ms: 20,
            max_retry: 2,
            ..Config::fast_local()
        },
    );

    a.send(addr(9), b"nobody home").unwrap();
    assert!(matches!(a.finish(), Err(Error::RetryExhausted { .. })));
}
