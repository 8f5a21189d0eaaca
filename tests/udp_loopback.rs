//! 실제 UDP 루프백 위 파일 전송 통합 테스트

use std::io::Write;
use std::thread;
use std::time::Duration;

use gudp::{Config, Error, GudpSocket};

fn bind() -> GudpSocket {
    GudpSocket::bind("127.0.0.1:0", Config::fast_local()).expect("bind loopback")
}

#[test]
fn test_file_transfer_over_loopback() {
    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let mut input = tempfile::NamedTempFile::new().unwrap();
    input.write_all(&data).unwrap();
    input.flush().unwrap();

    let sender = bind();
    let receiver = bind();
    let receiver_addr = receiver.local_addr().unwrap();

    let content = std::fs::read(input.path()).unwrap();
    let chunk_size = sender.config().max_payload_len();

    let reader = thread::spawn(move || {
        let header = receiver.receive().unwrap();
        let total = u64::from_be_bytes(header.payload.as_ref().try_into().unwrap()) as usize;
        let mut received = Vec::with_capacity(total);
        while received.len() < total {
            received.extend_from_slice(&receiver.receive().unwrap().payload);
        }
        // FIN이 ACK 받을 시간
        thread::sleep(Duration::from_millis(300));
        receiver.close().unwrap();
        received
    });

    sender
        .send(receiver_addr, &(content.len() as u64).to_be_bytes())
        .unwrap();
    for chunk in content.chunks(chunk_size) {
        sender.send(receiver_addr, chunk).unwrap();
    }
    sender.finish().unwrap();

    let received = reader.join().unwrap();
    assert_eq!(received.len(), data.len());
    assert!(received == data);

    let stats = sender.stats();
    assert!(stats.packets_acked >= (data.len() / chunk_size) as u64);
    sender.close().unwrap();
}

#[test]
fn test_close_unblocks_receive_on_udp() {
    let socket = std::sync::Arc::new(bind());
    let waiter = socket.clone();
    let handle = thread::spawn(move || waiter.receive());

    thread::sleep(Duration::from_millis(50));
    socket.close().unwrap();
    assert!(matches!(handle.join().unwrap(), Err(Error::Closed)));
}
