use std::collections::HashSet;

use crate::config::MeshSection;
use crate::errors::{NodeError, NodeResult};
use crate::p2p::messages::SuppressReason;
use crate::util::now_ms;

/// A session accepts nothing but challenge traffic until the peer proves
/// key ownership.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChallengeStatus {
    Issued,
    Verified,
}

/// Per-minute rate and error budget of one connection. The window resets
/// lazily on the first charge after it expires.
#[derive(Debug)]
struct RateCounters {
    window_start: u64,
    bytes: u64,
    bad_msgs: u64,
    bad_msgsigs: u64,
    dup_msgs: u64,
}

impl RateCounters {
    fn new() -> Self {
        Self {
            window_start: now_ms(),
            bytes: 0,
            bad_msgs: 0,
            bad_msgsigs: 0,
            dup_msgs: 0,
        }
    }

    fn roll(&mut self) {
        let now = now_ms();
        if now.saturating_sub(self.window_start) >= 60_000 {
            self.window_start = now;
            self.bytes = 0;
            self.bad_msgs = 0;
            self.bad_msgsigs = 0;
            self.dup_msgs = 0;
        }
    }
}

/// Protocol state of one peer connection, owned by its recv worker.
pub struct PeerSession {
    pub id: u64,
    pub host: String,
    pub is_inbound: bool,
    pub status: ChallengeStatus,
    /// Verified peer identity; set by the challenge response.
    pub pubkey: Option<Vec<u8>>,
    pub is_full_history: bool,
    /// The 16 random bytes we sent and expect signed back.
    pub issued_challenge: Vec<u8>,
    /// Message classes the peer asked us not to forward.
    pub suppressions: HashSet<SuppressReason>,
    pub need_msg_forwarding: bool,
    pub available_capacity: i16,
    counters: RateCounters,
}

impl PeerSession {
    pub fn new(id: u64, host: String, is_inbound: bool, issued_challenge: Vec<u8>) -> Self {
        Self {
            id,
            host,
            is_inbound,
            status: ChallengeStatus::Issued,
            pubkey: None,
            is_full_history: false,
            issued_challenge,
            suppressions: HashSet::new(),
            need_msg_forwarding: true,
            available_capacity: -1,
            counters: RateCounters::new(),
        }
    }

    pub fn is_verified(&self) -> bool {
        self.status == ChallengeStatus::Verified
    }

    pub fn display_name(&self) -> String {
        match &self.pubkey {
            Some(pubkey) => hex::encode(&pubkey[1..5.min(pubkey.len())]),
            None => self.host.clone(),
        }
    }

    /// Charges the received frame against the per-message and per-minute
    /// byte budgets. Zero limits are unlimited.
    pub fn charge_bytes(&mut self, frame_len: usize, mesh: &MeshSection) -> NodeResult<()> {
        if mesh.max_bytes_per_msg > 0 && frame_len as u64 > mesh.max_bytes_per_msg {
            return Err(NodeError::QuotaExceeded(format!(
                "message of {frame_len} bytes exceeds per-message budget"
            )));
        }
        self.counters.roll();
        self.counters.bytes += frame_len as u64;
        if mesh.max_bytes_per_min > 0 && self.counters.bytes > mesh.max_bytes_per_min {
            return Err(NodeError::QuotaExceeded(
                "per-minute byte budget exhausted".into(),
            ));
        }
        Ok(())
    }

    pub fn charge_bad_msg(&mut self, mesh: &MeshSection) -> NodeResult<()> {
        self.counters.roll();
        self.counters.bad_msgs += 1;
        if mesh.max_bad_msgs_per_min > 0 && self.counters.bad_msgs > mesh.max_bad_msgs_per_min {
            return Err(NodeError::QuotaExceeded(
                "bad message budget exhausted".into(),
            ));
        }
        Ok(())
    }

    pub fn charge_bad_msgsig(&mut self, mesh: &MeshSection) -> NodeResult<()> {
        self.counters.roll();
        self.counters.bad_msgsigs += 1;
        if mesh.max_bad_msgsigs_per_min > 0
            && self.counters.bad_msgsigs > mesh.max_bad_msgsigs_per_min
        {
            return Err(NodeError::QuotaExceeded(
                "bad signature budget exhausted".into(),
            ));
        }
        Ok(())
    }

    pub fn charge_dup_msg(&mut self, mesh: &MeshSection) -> NodeResult<()> {
        self.counters.roll();
        self.counters.dup_msgs += 1;
        if mesh.max_dup_msgs_per_min > 0 && self.counters.dup_msgs > mesh.max_dup_msgs_per_min {
            return Err(NodeError::QuotaExceeded(
                "duplicate message budget exhausted".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HpConfig;
    use crate::crypto;

    fn mesh(max_bytes_per_msg: u64, max_bad_msgs_per_min: u64) -> MeshSection {
        let keypair = crypto::generate_keypair();
        let mut cfg = HpConfig::default_with_keys(
            hex::encode(crypto::pubkey_bytes(&keypair.public)),
            hex::encode(keypair.secret.to_bytes()),
        );
        cfg.mesh.max_bytes_per_msg = max_bytes_per_msg;
        cfg.mesh.max_bad_msgs_per_min = max_bad_msgs_per_min;
        cfg.mesh
    }

    #[test]
    fn oversized_message_is_rejected() {
        let mesh = mesh(128, 0);
        let mut session = PeerSession::new(1, "peer".into(), true, vec![0u8; 16]);
        session.charge_bytes(128, &mesh).expect("within budget");
        assert!(matches!(
            session.charge_bytes(129, &mesh),
            Err(NodeError::QuotaExceeded(_))
        ));
    }

    #[test]
    fn bad_message_budget_closes_session() {
        let mesh = mesh(0, 2);
        let mut session = PeerSession::new(1, "peer".into(), true, vec![0u8; 16]);
        session.charge_bad_msg(&mesh).expect("first");
        session.charge_bad_msg(&mesh).expect("second");
        assert!(session.charge_bad_msg(&mesh).is_err());
    }

    #[test]
    fn zero_limits_are_unlimited() {
        let mesh = mesh(0, 0);
        let mut session = PeerSession::new(1, "peer".into(), true, vec![0u8; 16]);
        for _ in 0..1_000 {
            session.charge_bytes(1 << 20, &mesh).expect("unlimited");
            session.charge_bad_msg(&mesh).expect("unlimited");
        }
    }

    #[test]
    fn session_starts_unverified() {
        let session = PeerSession::new(7, "peer".into(), false, vec![1u8; 16]);
        assert!(!session.is_verified());
        assert_eq!(session.display_name(), "peer");
    }
}
