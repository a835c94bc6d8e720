use ed25519_dalek::Keypair;
use serde::{Deserialize, Serialize};

use crate::cafs::ChildHashNode;
use crate::crypto;
use crate::errors::{NodeError, NodeResult};
use crate::hash::{H32, SequenceHash};
use crate::util::now_ms;

pub const PROTOCOL_VERSION: u16 = 1;
/// Peer challenges are this many random bytes.
pub const CHALLENGE_LEN: usize = 16;
/// Messages larger than this bypass the too-old check.
pub const MAX_SIZE_FOR_TIME_CHECK: usize = 1024 * 1024;
/// Hard cap applied to inbound frames before any per-peer quota.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Container for every peer-to-peer message. Receivers drop envelopes
/// older than `3 * roundtime` unless the payload is large.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u16,
    pub created_on: u64,
    pub content: PeerMessage,
}

impl Envelope {
    pub fn new(content: PeerMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            created_on: now_ms(),
            content,
        }
    }

    pub fn is_too_old(&self, frame_len: usize, roundtime: u32) -> bool {
        frame_len <= MAX_SIZE_FOR_TIME_CHECK
            && self.created_on + 3 * (roundtime as u64) < now_ms()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    PeerChallenge(PeerChallenge),
    PeerChallengeResponse(PeerChallengeResponse),
    Proposal(Proposal),
    NonUnlProposal(NonUnlProposal),
    Npl(NplMessage),
    HpfsRequest(HpfsRequest),
    HpfsResponse(HpfsResponse),
    HpfsLogRequest(HpfsLogRequest),
    HpfsLogResponse(HpfsLogResponse),
    PeerListRequest,
    PeerListResponse(Vec<PeerProperties>),
    PeerCapacityAnnouncement(PeerCapacityAnnouncement),
    PeerRequirementAnnouncement(PeerRequirementAnnouncement),
    Suppress(Suppress),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerChallenge {
    pub contract_id: String,
    pub time_config: u32,
    pub is_full_history: bool,
    pub challenge: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerChallengeResponse {
    pub challenge: Vec<u8>,
    pub sig: Vec<u8>,
    pub pubkey: Vec<u8>,
}

/// Stage proposal emitted once per stage by every validator.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub pubkey: Vec<u8>,
    pub sig: Vec<u8>,
    pub stage: u8,
    pub time: u64,
    pub time_config: u32,
    pub node_nonce: H32,
    pub group_nonce: H32,
    pub users: Vec<Vec<u8>>,
    pub input_ordered_hashes: Vec<Vec<u8>>,
    pub output_hash: H32,
    pub output_sig: Vec<u8>,
    pub state_hash: H32,
    pub patch_hash: H32,
    pub last_primary_shard_id: SequenceHash,
    pub last_raw_shard_id: SequenceHash,
}

impl Proposal {
    /// Digest over the consensus-significant fields, in wire order. The
    /// node nonce is deliberately left out so re-randomizing it cannot
    /// change what the signature covers.
    pub fn canonical_hash(&self) -> H32 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[self.stage]);
        hasher.update(&self.time.to_le_bytes());
        hasher.update(&self.time_config.to_le_bytes());
        hasher.update(self.group_nonce.as_bytes());
        for user in &self.users {
            hasher.update(user);
        }
        for input in &self.input_ordered_hashes {
            hasher.update(input);
        }
        hasher.update(self.output_hash.as_bytes());
        hasher.update(&self.output_sig);
        hasher.update(self.state_hash.as_bytes());
        hasher.update(self.patch_hash.as_bytes());
        for shard_id in [&self.last_primary_shard_id, &self.last_raw_shard_id] {
            hasher.update(&shard_id.seq_no.to_le_bytes());
            hasher.update(shard_id.hash.as_bytes());
        }
        H32(*hasher.finalize().as_bytes())
    }

    /// Normalizes the set-valued fields to sorted ascending raw bytes.
    pub fn normalize(&mut self) {
        self.users.sort();
        self.users.dedup();
        self.input_ordered_hashes.sort();
        self.input_ordered_hashes.dedup();
    }

    pub fn sign(&mut self, keypair: &Keypair) {
        self.normalize();
        self.sig = crypto::sign(self.canonical_hash().as_bytes(), keypair);
    }

    /// Verifies the signature against the canonical field hash and
    /// returns that hash.
    pub fn verify(&self) -> NodeResult<H32> {
        let hash = self.canonical_hash();
        crypto::verify(hash.as_bytes(), &self.sig, &self.pubkey)?;
        Ok(hash)
    }
}

/// User input as submitted over the user protocol; opaque to the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputProtocol {
    Json,
    Bson,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmittedUserInput {
    pub input_container: Vec<u8>,
    pub sig: Vec<u8>,
    pub protocol: InputProtocol,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserInputGroup {
    pub pubkey: Vec<u8>,
    pub inputs: Vec<SubmittedUserInput>,
}

/// Inputs relayed by a non-UNL node for inclusion in the round.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NonUnlProposal {
    pub user_inputs: Vec<UserInputGroup>,
}

/// Node-to-node message emitted by the contract during execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NplMessage {
    pub pubkey: Vec<u8>,
    pub lcl_id: SequenceHash,
    pub data: Vec<u8>,
    pub sig: Vec<u8>,
}

impl NplMessage {
    pub fn canonical_hash(&self) -> H32 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.data);
        hasher.update(&self.lcl_id.seq_no.to_le_bytes());
        hasher.update(self.lcl_id.hash.as_bytes());
        H32(*hasher.finalize().as_bytes())
    }

    pub fn sign(&mut self, keypair: &Keypair) {
        self.sig = crypto::sign(self.canonical_hash().as_bytes(), keypair);
    }

    pub fn verify(&self) -> NodeResult<()> {
        crypto::verify(self.canonical_hash().as_bytes(), &self.sig, &self.pubkey)
    }
}

/// Hint a requester attaches so the server can pre-filter its reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum HpfsRequestHint {
    None,
    FsEntries(Vec<ChildHashNode>),
    FileHashMap(Vec<H32>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HpfsRequest {
    pub mount_id: u32,
    pub parent_path: String,
    pub is_file: bool,
    /// Requested block id for file content, -1 for a hash-map request.
    pub block_id: i32,
    pub expected_hash: H32,
    pub hint: HpfsRequestHint,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum HpfsResponseContent {
    FsEntries(Vec<ChildHashNode>),
    FileHashMap {
        hash_map: Vec<H32>,
        file_length: u64,
        responded_block_ids: Vec<u32>,
    },
    Block {
        block_id: u32,
        data: Vec<u8>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HpfsResponse {
    pub mount_id: u32,
    pub path: String,
    pub expected_hash: H32,
    pub content: HpfsResponseContent,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HpfsLogRequest {
    pub target_seq_no: u64,
    pub min_record_id: SequenceHash,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HpfsLogResponse {
    pub min_record_id: SequenceHash,
    pub log_record_bytes: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerProperties {
    pub host: String,
    pub port: u16,
    pub available_capacity: i16,
    pub timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerCapacityAnnouncement {
    pub available_capacity: i16,
    pub timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerRequirementAnnouncement {
    pub need_consensus_msg_forwarding: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SuppressReason {
    MsgForwarding,
}

/// Lets a peer declare it does not wish to receive a message class.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Suppress {
    pub pubkey: Vec<u8>,
    pub reason: SuppressReason,
}

/// Frames an envelope as `u32-le length || bincode payload`.
pub fn encode_frame(envelope: &Envelope) -> NodeResult<Vec<u8>> {
    let body = bincode::serialize(envelope)?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Pops one complete frame off the front of `buf`, if present. Returns the
/// decoded envelope together with the frame length consumed.
pub fn try_decode_frame(buf: &mut Vec<u8>) -> NodeResult<Option<(Envelope, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(NodeError::MessageMalformed(format!(
            "invalid frame length {len}"
        )));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let envelope: Envelope = bincode::deserialize(&buf[4..4 + len])
        .map_err(|err| NodeError::MessageMalformed(format!("undecodable frame: {err}")))?;
    buf.drain(0..4 + len);
    Ok(Some((envelope, 4 + len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_keypair, pubkey_bytes};
    use crate::hash::hash_bytes;

    fn sample_proposal(keypair: &Keypair) -> Proposal {
        let mut proposal = Proposal {
            pubkey: pubkey_bytes(&keypair.public),
            stage: 2,
            time: 1_000,
            time_config: 1_000,
            node_nonce: hash_bytes(b"nonce"),
            group_nonce: hash_bytes(b"group"),
            users: vec![b"user-b".to_vec(), b"user-a".to_vec()],
            input_ordered_hashes: vec![b"input-2".to_vec(), b"input-1".to_vec()],
            state_hash: hash_bytes(b"state"),
            patch_hash: hash_bytes(b"patch"),
            ..Proposal::default()
        };
        proposal.sign(keypair);
        proposal
    }

    #[test]
    fn proposal_sign_verify_round_trip() {
        let keypair = generate_keypair();
        let proposal = sample_proposal(&keypair);
        proposal.verify().expect("verify");
    }

    #[test]
    fn tampered_proposal_fails_verification() {
        let keypair = generate_keypair();
        let mut proposal = sample_proposal(&keypair);
        proposal.state_hash = hash_bytes(b"other state");
        assert!(proposal.verify().is_err());
    }

    #[test]
    fn node_nonce_is_outside_the_signed_hash() {
        let keypair = generate_keypair();
        let mut proposal = sample_proposal(&keypair);
        proposal.node_nonce = hash_bytes(b"rerolled");
        proposal.verify().expect("nonce change must not break the signature");
    }

    #[test]
    fn normalization_sorts_set_fields() {
        let keypair = generate_keypair();
        let proposal = sample_proposal(&keypair);
        assert_eq!(proposal.users, vec![b"user-a".to_vec(), b"user-b".to_vec()]);
        assert_eq!(
            proposal.input_ordered_hashes,
            vec![b"input-1".to_vec(), b"input-2".to_vec()]
        );
    }

    #[test]
    fn frame_round_trips_through_buffer() {
        let keypair = generate_keypair();
        let envelope = Envelope::new(PeerMessage::Proposal(sample_proposal(&keypair)));
        let frame = encode_frame(&envelope).expect("encode");

        let mut buf = frame[..3].to_vec();
        assert!(try_decode_frame(&mut buf).expect("partial").is_none());
        buf = frame.clone();
        buf.extend_from_slice(&frame);
        let (first, consumed) = try_decode_frame(&mut buf).expect("decode").expect("frame");
        assert_eq!(first, envelope);
        assert_eq!(consumed, frame.len());
        let (second, _) = try_decode_frame(&mut buf).expect("decode").expect("frame");
        assert_eq!(second, envelope);
        assert!(buf.is_empty());
    }

    #[test]
    fn zero_length_frame_is_malformed() {
        let mut buf = 0u32.to_le_bytes().to_vec();
        assert!(try_decode_frame(&mut buf).is_err());
    }

    #[test]
    fn npl_sign_verify_round_trip() {
        let keypair = generate_keypair();
        let mut msg = NplMessage {
            pubkey: pubkey_bytes(&keypair.public),
            lcl_id: SequenceHash::new(7, hash_bytes(b"lcl")),
            data: b"contract chatter".to_vec(),
            sig: Vec::new(),
        };
        msg.sign(&keypair);
        msg.verify().expect("verify");
        msg.data.push(0);
        assert!(msg.verify().is_err());
    }

    #[test]
    fn large_envelopes_bypass_age_check() {
        let mut envelope = Envelope::new(PeerMessage::PeerListRequest);
        envelope.created_on = 0;
        assert!(envelope.is_too_old(1024, 1_000));
        assert!(!envelope.is_too_old(MAX_SIZE_FOR_TIME_CHECK + 1, 1_000));
    }
}
