//! 메모리 내 네트워크 시뮬레이터
//!
//! 실제 소켓 없이 여러 [`MemoryTransport`]를 연결한다. 링크 장애 모델로
//! 손실, 중복, 재정렬을 흉내내어 GBN 재전송 경로를 테스트한다.
//!
//! | 장애   | 설명                                        |
//! |--------|---------------------------------------------|
//! | 손실   | `loss_rate` 확률로 데이터그램을 버림        |
//! | 중복   | `duplicate_rate` 확률로 두 번 전달          |
//! | 재정렬 | `reorder_rate` 확률로 붙잡아 다음 것 뒤에 전달 |

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::trace;

use crate::transport::{closed_error, Transport};

type Datagram = (Vec<u8>, SocketAddr);

/// 링크 장애 모델 (확률은 0.0 ~ 1.0)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkFaults {
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    pub reorder_rate: f64,
}

impl LinkFaults {
    /// 장애 없음
    pub fn none() -> Self {
        Self::default()
    }

    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            loss_rate,
            ..Self::default()
        }
    }
}

/// 시뮬레이터 통계
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub sent: u64,
    pub lost: u64,
    pub duplicated: u64,
    pub reordered: u64,
}

#[derive(Default)]
struct NetworkInner {
    hosts: RwLock<HashMap<SocketAddr, Sender<Datagram>>>,
    faults: RwLock<LinkFaults>,
    /// 재정렬용으로 붙잡은 데이터그램 (to, datagram)
    held: Mutex<Option<(SocketAddr, Datagram)>>,
    sent: AtomicU64,
    lost: AtomicU64,
    duplicated: AtomicU64,
    reordered: AtomicU64,
}

/// 메모리 내 네트워크
#[derive(Clone, Default)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: LinkFaults) -> Self {
        let network = Self::new();
        network.set_faults(faults);
        network
    }

    /// 장애 모델 교체
    pub fn set_faults(&self, faults: LinkFaults) {
        *self.inner.faults.write() = faults;
    }

    pub fn faults(&self) -> LinkFaults {
        *self.inner.faults.read()
    }

    /// 주소에 새 호스트 연결
    pub fn bind(&self, addr: SocketAddr) -> io::Result<MemoryTransport> {
        let (tx, rx) = unbounded();
        {
            let mut hosts = self.inner.hosts.write();
            if hosts.contains_key(&addr) {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} already bound", addr),
                ));
            }
            hosts.insert(addr, tx);
        }

        let (shutdown_tx, shutdown_rx) = unbounded();
        Ok(MemoryTransport {
            addr,
            network: self.clone(),
            inbox: rx,
            shutdown_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            sent: self.inner.sent.load(Ordering::Relaxed),
            lost: self.inner.lost.load(Ordering::Relaxed),
            duplicated: self.inner.duplicated.load(Ordering::Relaxed),
            reordered: self.inner.reordered.load(Ordering::Relaxed),
        }
    }

    fn unbind(&self, addr: SocketAddr) {
        self.inner.hosts.write().remove(&addr);
    }

    fn deliver(&self, to: SocketAddr, datagram: Datagram) {
        // 없는 호스트로 보낸 UDP는 그냥 사라짐
        if let Some(tx) = self.inner.hosts.read().get(&to) {
            let _ = tx.send(datagram);
        }
    }

    /// 장애 모델을 거쳐 전달
    fn route(&self, from: SocketAddr, to: SocketAddr, bytes: &[u8]) {
        let faults = self.faults();
        let mut rng = rand::thread_rng();
        self.inner.sent.fetch_add(1, Ordering::Relaxed);

        if rng.gen::<f64>() < faults.loss_rate {
            self.inner.lost.fetch_add(1, Ordering::Relaxed);
            trace!("sim: lost {} bytes {} -> {}", bytes.len(), from, to);
            return;
        }

        let datagram = (bytes.to_vec(), from);

        if rng.gen::<f64>() < faults.reorder_rate {
            let mut held = self.inner.held.lock();
            if held.is_none() {
                self.inner.reordered.fetch_add(1, Ordering::Relaxed);
                *held = Some((to, datagram));
                return;
            }
        }

        if rng.gen::<f64>() < faults.duplicate_rate {
            self.inner.duplicated.fetch_add(1, Ordering::Relaxed);
            self.deliver(to, datagram.clone());
        }
        self.deliver(to, datagram);

        // 붙잡아 둔 것은 방금 보낸 것 뒤에 도착
        let released = self.inner.held.lock().take();
        if let Some((held_to, held_datagram)) = released {
            self.deliver(held_to, held_datagram);
        }
    }
}

/// [`Network`]에 연결된 전송 계층
pub struct MemoryTransport {
    addr: SocketAddr,
    network: Network,
    inbox: Receiver<Datagram>,
    shutdown_rx: Receiver<()>,
    /// drop되면 shutdown_rx가 끊어져 대기 중인 수신이 깨어남
    shutdown_tx: Mutex<Option<Sender<()>>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Transport for MemoryTransport {
    fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error());
        }
        self.network.route(self.addr, peer, buf);
        Ok(())
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error());
        }
        select! {
            recv(self.inbox) -> msg => match msg {
                Ok((data, from)) => {
                    let len = data.len().min(buf.len());
                    buf[..len].copy_from_slice(&data[..len]);
                    Ok((len, from))
                }
                Err(_) => Err(closed_error()),
            },
            recv(self.shutdown_rx) -> _ => Err(closed_error()),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.lock().take();
        self.network.unbind(self.addr);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}
