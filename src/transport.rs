//! 비신뢰 데이터그램 전송 계층
//!
//! 엔진은 이 trait만 사용한다. 메시지를 잃거나 중복/재정렬할 수는 있지만
//! 내용을 손상시키지는 않는다고 가정한다.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::debug;

/// 데이터그램 전송 계층
pub trait Transport: Send + Sync {
    /// 데이터그램 하나 전송
    fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<()>;

    /// 데이터그램 하나 수신 (블로킹)
    ///
    /// `close()` 이후에는 에러를 반환해야 한다.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// 자원 해제. 대기 중인 `recv_from`을 깨운다.
    fn close(&self);

    /// 바인드된 로컬 주소
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// 닫힌 전송 계층 에러
pub fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport closed")
}

/// `std::net::UdpSocket` 기반 전송 계층
///
/// 표준 UDP 소켓은 다른 스레드에서 닫아도 블로킹 수신이 풀리지 않으므로
/// 짧은 read timeout으로 돌면서 닫힘 플래그를 확인한다.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    closed: AtomicBool,
}

impl UdpTransport {
    /// 주소에 바인드
    pub fn bind<A: ToSocketAddrs>(addr: A, poll_interval: Duration) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        Self::from_socket(socket, poll_interval)
    }

    /// 이미 열린 소켓 사용
    pub fn from_socket(socket: UdpSocket, poll_interval: Duration) -> io::Result<Self> {
        socket.set_read_timeout(Some(poll_interval))?;
        Ok(Self {
            socket,
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.socket.send_to(buf, peer)?;
        Ok(())
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        loop {
            if self.is_closed() {
                return Err(closed_error());
            }
            match self.socket.recv_from(buf) {
                Ok(received) => return Ok(received),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                // 이전 send_to에 대한 ICMP port unreachable (Windows/Linux)
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    debug!("ignoring connection reset on UDP socket: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

/// 보낸 데이터그램을 디코딩해 기록만 하는 전송 계층 (엔진 단위 테스트용)
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingTransport {
    sent: parking_lot::Mutex<Vec<crate::packet::Packet>>,
    pub(crate) broken: bool,
}

#[cfg(test)]
impl RecordingTransport {
    pub(crate) fn broken() -> Self {
        Self {
            broken: true,
            ..Self::default()
        }
    }

    /// 지금까지 보낸 패킷을 꺼냄
    pub(crate) fn take(&self) -> Vec<crate::packet::Packet> {
        std::mem::take(&mut *self.sent.lock())
    }
}

#[cfg(test)]
impl Transport for RecordingTransport {
    fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<()> {
        if self.broken {
            return Err(closed_error());
        }
        let packet = crate::packet::Packet::decode(buf, peer)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.sent.lock().push(packet);
        Ok(())
    }

    fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        Err(closed_error())
    }

    fn close(&self) {}
}
