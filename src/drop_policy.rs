//! 테스트용 인위적 패킷 손실 정책
//!
//! 프로토콜 로직과 분리된 계측 코드. 정책은 런타임에 교체 가능하며
//! 판단 함수는 순수 함수로, 난수는 호출 측에서 뽑아 넘긴다.

use std::fmt;

use crate::packet::PacketType;

/// 손실 정책이 적용되는 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropRole {
    /// 송신 경로: 송신 endpoint로 돌아오는 ACK
    Sender,

    /// 수신 경로: 들어오는 BSN/DATA/FIN, 그리고 내보내는 ACK
    Receiver,
}

/// 손실 정책
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DropPolicy {
    /// 아무것도 버리지 않음
    Nothing,

    /// endpoint 당 첫 BSN
    FirstBsn,

    /// endpoint 당 첫 DATA
    FirstData,

    /// endpoint 당 첫 ACK
    FirstAck,

    /// endpoint 당 첫 FIN
    FirstFin,

    /// 확률 p (0.0 ~ 1.0)로 버림
    Random(f64),

    /// 전부 버림
    All,
}

impl Default for DropPolicy {
    fn default() -> Self {
        DropPolicy::Nothing
    }
}

impl DropPolicy {
    /// 이 정책이 `kind` 패킷을 첫 번째 한정으로 버리는지 여부
    pub fn targets_first(&self, kind: PacketType) -> bool {
        matches!(
            (self, kind),
            (DropPolicy::FirstBsn, PacketType::Bsn)
                | (DropPolicy::FirstData, PacketType::Data)
                | (DropPolicy::FirstAck, PacketType::Ack)
                | (DropPolicy::FirstFin, PacketType::Fin)
        )
    }

    /// 패킷을 버릴지 결정
    ///
    /// `first_dropped`는 이 endpoint가 같은 역할에서 이미 한 번 버렸는지,
    /// `roll`은 `[0.0, 1.0)` 구간의 난수.
    pub fn should_drop(&self, kind: PacketType, first_dropped: bool, roll: f64) -> bool {
        match self {
            DropPolicy::Nothing => false,
            DropPolicy::All => true,
            DropPolicy::Random(p) => roll < *p,
            _ => self.targets_first(kind) && !first_dropped,
        }
    }
}

impl fmt::Display for DropPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropPolicy::Nothing => write!(f, "NOTHING"),
            DropPolicy::FirstBsn => write!(f, "FIRST_BSN"),
            DropPolicy::FirstData => write!(f, "FIRST_DATA"),
            DropPolicy::FirstAck => write!(f, "FIRST_ACK"),
            DropPolicy::FirstFin => write!(f, "FIRST_FIN"),
            DropPolicy::Random(p) => write!(f, "RANDOM({:.2})", p),
            DropPolicy::All => write!(f, "ALL"),
        }
    }
}

impl std::str::FromStr for DropPolicy {
    type Err = String;

    /// `nothing`, `first-bsn`, `random:0.2`, `all` 형식
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase().replace('_', "-");
        match lower.as_str() {
            "nothing" | "none" => Ok(DropPolicy::Nothing),
            "first-bsn" => Ok(DropPolicy::FirstBsn),
            "first-data" => Ok(DropPolicy::FirstData),
            "first-ack" => Ok(DropPolicy::FirstAck),
            "first-fin" => Ok(DropPolicy::FirstFin),
            "all" => Ok(DropPolicy::All),
            other => match other.strip_prefix("random") {
                Some("") => Ok(DropPolicy::Random(0.2)),
                Some(rest) => rest
                    .trim_start_matches(':')
                    .parse::<f64>()
                    .map(DropPolicy::Random)
                    .map_err(|e| format!("잘못된 확률: {}", e)),
                None => Err(format!("알 수 없는 손실 정책: {}", s)),
            },
        }
    }
}

/// 송신/수신 역할별 정책 한 쌍
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DropPolicies {
    pub sender: DropPolicy,
    pub receiver: DropPolicy,
}

impl DropPolicies {
    pub fn get(&self, role: DropRole) -> DropPolicy {
        match role {
            DropRole::Sender => self.sender,
            DropRole::Receiver => self.receiver,
        }
    }

    pub fn set(&mut self, role: DropRole, policy: DropPolicy) {
        match role {
            DropRole::Sender => self.sender = policy,
            DropRole::Receiver => self.receiver = policy,
        }
    }
}
