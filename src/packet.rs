//! GUDP 패킷 와이어 포맷
//!
//! 고정 8바이트 헤더 + 페이로드. 모든 정수는 big-endian.
//!
//! ```text
//!  0        1        2                 6        8
//! +--------+--------+-----------------+--------+------------ - -
//! |version |  type  |  seqno (i32)    | length | payload ...
//! +--------+--------+-----------------+--------+------------ - -
//! ```
//!
//! ACK/BSN/FIN은 페이로드가 없다.

use std::fmt;
use std::net::SocketAddr;

use bincode::Options;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Error, Result, HEADER_SIZE, PROTOCOL_VERSION};

/// 패킷 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// 애플리케이션 데이터
    Data = 0,

    /// 누적 확인 응답
    Ack = 1,

    /// 전송 시작 (begin sequence number)
    Bsn = 2,

    /// 전송 종료
    Fin = 3,
}

impl PacketType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PacketType::Data),
            1 => Ok(PacketType::Ack),
            2 => Ok(PacketType::Bsn),
            3 => Ok(PacketType::Fin),
            other => Err(Error::Decoding(format!("알 수 없는 패킷 타입: {}", other))),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Data => "DATA",
            PacketType::Ack => "ACK",
            PacketType::Bsn => "BSN",
            PacketType::Fin => "FIN",
        };
        f.write_str(name)
    }
}

/// 와이어 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct WireHeader {
    version: u8,
    kind: u8,
    seqno: i32,
    payload_len: u16,
}

/// big-endian, 고정 길이 정수
fn header_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
        .allow_trailing_bytes()
}

/// GUDP 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// 프로토콜 버전
    pub version: u8,

    /// 패킷 타입
    pub kind: PacketType,

    /// 시퀀스 번호 (ACK는 다음에 기대하는 번호)
    pub seqno: i32,

    /// 페이로드
    pub payload: Bytes,

    /// 송신 시 목적지, 수신 시 출발지
    pub peer: SocketAddr,
}

impl Packet {
    fn control(kind: PacketType, peer: SocketAddr, seqno: i32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            seqno,
            payload: Bytes::new(),
            peer,
        }
    }

    pub fn bsn(peer: SocketAddr, seqno: i32) -> Self {
        Self::control(PacketType::Bsn, peer, seqno)
    }

    pub fn ack(peer: SocketAddr, seqno: i32) -> Self {
        Self::control(PacketType::Ack, peer, seqno)
    }

    pub fn fin(peer: SocketAddr, seqno: i32) -> Self {
        Self::control(PacketType::Fin, peer, seqno)
    }

    pub fn data(peer: SocketAddr, seqno: i32, payload: Bytes) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind: PacketType::Data,
            seqno,
            payload,
            peer,
        }
    }

    /// 페이로드 길이
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// 바이트로 직렬화
    ///
    /// 페이로드가 `max_payload`를 넘으면 [`Error::Encoding`].
    pub fn encode(&self, max_payload: usize) -> Result<Vec<u8>> {
        let max = max_payload.min(u16::MAX as usize);
        if self.payload.len() > max {
            return Err(Error::Encoding {
                len: self.payload.len(),
                max,
            });
        }

        let header = WireHeader {
            version: self.version,
            kind: self.kind.as_u8(),
            seqno: self.seqno,
            payload_len: self.payload.len() as u16,
        };
        let header_bytes = header_options().serialize(&header)?;
        debug_assert_eq!(header_bytes.len(), HEADER_SIZE);

        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// 바이트에서 역직렬화
    pub fn decode(bytes: &[u8], src: SocketAddr) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Decoding(format!(
                "헤더 부족: {} bytes < {}",
                bytes.len(),
                HEADER_SIZE
            )));
        }

        let header: WireHeader = header_options().deserialize(&bytes[..HEADER_SIZE])?;
        if header.version != PROTOCOL_VERSION {
            return Err(Error::Decoding(format!(
                "지원하지 않는 버전: expected {}, got {}",
                PROTOCOL_VERSION, header.version
            )));
        }
        let kind = PacketType::try_from(header.kind)?;

        let body = &bytes[HEADER_SIZE..];
        if body.len() != header.payload_len as usize {
            return Err(Error::Decoding(format!(
                "길이 불일치: header={}, actual={}",
                header.payload_len,
                body.len()
            )));
        }
        if kind != PacketType::Data && !body.is_empty() {
            return Err(Error::Decoding(format!("{} 패킷에 페이로드 존재", kind)));
        }

        Ok(Self {
            version: header.version,
            kind,
            seqno: header.seqno,
            payload: Bytes::copy_from_slice(body),
            peer: src,
        })
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({} bytes) {}", self.kind, self.seqno, self.payload.len(), self.peer)
    }
}
