use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use ed25519_dalek::Keypair;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::{HpConfig, MeshSection, PeerAddr};
use crate::crypto;
use crate::errors::{NodeError, NodeResult};
use crate::hash::H32;
use crate::p2p::messages::{
    encode_frame, try_decode_frame, Envelope, PeerChallenge, PeerChallengeResponse, PeerMessage,
    PeerProperties, Proposal, CHALLENGE_LEN,
};
use crate::p2p::session::{ChallengeStatus, PeerSession};
use crate::p2p::{CollectedMsgs, SessionId};
use crate::unl::UnlRegistry;
use crate::util::now_ms;

const ACCEPT_IDLE_MS: u64 = 20;
const READ_TIMEOUT_MS: u64 = 50;
const CONNECT_RETRY_MS: u64 = 3_000;
/// Bound on the forward-dedup set before it is cleared wholesale.
const SEEN_PROPOSAL_CAP: usize = 4_096;

struct PeerHandle {
    sender: mpsc::Sender<Vec<u8>>,
    host: String,
    is_inbound: bool,
    outbound_addr: Option<PeerAddr>,
    verified: bool,
    pubkey: Option<Vec<u8>>,
    is_full_history: bool,
    suppressed_forwarding: bool,
    need_msg_forwarding: bool,
}

struct NetworkInner {
    mesh: MeshSection,
    contract_id: String,
    is_full_history: bool,
    keypair: Keypair,
    pubkey: Vec<u8>,
    unl: Arc<UnlRegistry>,
    collected: Arc<CollectedMsgs>,
    peers: Mutex<HashMap<SessionId, PeerHandle>>,
    known_peers: Mutex<BTreeSet<PeerAddr>>,
    seen_proposals: Mutex<HashSet<(Vec<u8>, u8, H32)>>,
    effective_time_config: AtomicU32,
    next_session_id: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

/// Framed, signed peer protocol server: challenge-response admission,
/// per-peer quotas, proposal forwarding and peer-list gossip.
#[derive(Clone)]
pub struct PeerNetwork {
    inner: Arc<NetworkInner>,
}

impl PeerNetwork {
    pub fn start(
        cfg: &HpConfig,
        keypair: Keypair,
        unl: Arc<UnlRegistry>,
        collected: Arc<CollectedMsgs>,
        shutdown: Arc<AtomicBool>,
    ) -> NodeResult<Self> {
        let pubkey = cfg.node_pubkey_bin()?;
        let inner = Arc::new(NetworkInner {
            mesh: cfg.mesh.clone(),
            contract_id: cfg.contract.id.clone(),
            is_full_history: cfg.node.history == crate::config::HistoryMode::Full,
            keypair,
            pubkey,
            unl,
            collected,
            peers: Mutex::new(HashMap::new()),
            known_peers: Mutex::new(cfg.mesh.known_peers.clone()),
            seen_proposals: Mutex::new(HashSet::new()),
            effective_time_config: AtomicU32::new(cfg.contract.consensus.roundtime),
            next_session_id: AtomicU64::new(1),
            shutdown,
        });

        if cfg.mesh.listen {
            let listener = TcpListener::bind(("0.0.0.0", cfg.mesh.port))?;
            listener.set_nonblocking(true)?;
            let accept_inner = inner.clone();
            thread::spawn(move || accept_inner.accept_loop(listener));
        }

        let connect_inner = inner.clone();
        thread::spawn(move || connect_inner.connect_loop());

        if cfg.mesh.peer_discovery.enabled {
            let discovery_inner = inner.clone();
            let interval = cfg.mesh.peer_discovery.interval as u64;
            thread::spawn(move || discovery_inner.discovery_loop(interval));
        }

        info!(port = cfg.mesh.port, "peer network started");
        Ok(Self { inner })
    }

    /// Sends a message to every challenge-verified peer.
    pub fn broadcast(&self, msg: &PeerMessage) {
        let Ok(frame) = encode_frame(&Envelope::new(msg.clone())) else {
            return;
        };
        let peers = self.inner.peers.lock();
        for handle in peers.values() {
            if handle.verified && !handle.suppressed_forwarding {
                let _ = handle.sender.send(frame.clone());
            }
        }
    }

    /// Sends to one random verified peer. Returns the chosen peer's display
    /// name when a candidate existed.
    pub fn send_to_random_peer(
        &self,
        msg: &PeerMessage,
        require_full_history: bool,
    ) -> Option<String> {
        let Ok(frame) = encode_frame(&Envelope::new(msg.clone())) else {
            return None;
        };
        let peers = self.inner.peers.lock();
        let candidates: Vec<&PeerHandle> = peers
            .values()
            .filter(|handle| handle.verified && (!require_full_history || handle.is_full_history))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let pick = rand::thread_rng().gen_range(0, candidates.len());
        let handle = candidates[pick];
        let _ = handle.sender.send(frame);
        Some(
            handle
                .pubkey
                .as_ref()
                .map(|pk| hex::encode(&pk[1..5]))
                .unwrap_or_else(|| handle.host.clone()),
        )
    }

    pub fn send_to_session(&self, session_id: SessionId, msg: &PeerMessage) -> bool {
        let Ok(frame) = encode_frame(&Envelope::new(msg.clone())) else {
            return false;
        };
        let peers = self.inner.peers.lock();
        match peers.get(&session_id) {
            Some(handle) => handle.sender.send(frame).is_ok(),
            None => false,
        }
    }

    /// Updates the roundtime admission gate after a patch change.
    pub fn update_time_config(&self, roundtime: u32) {
        self.inner
            .effective_time_config
            .store(roundtime, Ordering::Relaxed);
    }

    pub fn connected_count(&self) -> usize {
        self.inner.peers.lock().len()
    }

    pub fn known_peers_snapshot(&self) -> BTreeSet<PeerAddr> {
        self.inner.known_peers.lock().clone()
    }
}

impl NetworkInner {
    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match listener.accept() {
                Ok((stream, addr)) => {
                    let host = addr.ip().to_string();
                    if let Err(err) = self.admit_inbound(&host) {
                        debug!(%host, %err, "rejecting inbound peer");
                        continue;
                    }
                    let inner = self.clone();
                    thread::spawn(move || inner.run_session(stream, host, true, None));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(ACCEPT_IDLE_MS));
                }
                Err(err) => {
                    warn!(?err, "peer listener failed");
                    break;
                }
            }
        }
    }

    fn admit_inbound(&self, host: &str) -> NodeResult<()> {
        let peers = self.peers.lock();
        if self.mesh.max_connections > 0 && peers.len() >= self.mesh.max_connections as usize {
            return Err(NodeError::QuotaExceeded("max_connections reached".into()));
        }
        if self.mesh.max_in_connections_per_host > 0 {
            let from_host = peers
                .values()
                .filter(|handle| handle.is_inbound && handle.host == host)
                .count();
            if from_host >= self.mesh.max_in_connections_per_host as usize {
                return Err(NodeError::QuotaExceeded(
                    "max_in_connections_per_host reached".into(),
                ));
            }
        }
        Ok(())
    }

    fn connect_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let targets: Vec<PeerAddr> = {
                let known = self.known_peers.lock();
                let peers = self.peers.lock();
                let connected: HashSet<PeerAddr> = peers
                    .values()
                    .filter_map(|handle| handle.outbound_addr.clone())
                    .collect();
                let outbound = connected.len();
                let budget = if self.mesh.max_known_connections > 0 {
                    (self.mesh.max_known_connections as usize).saturating_sub(outbound)
                } else {
                    usize::MAX
                };
                known
                    .iter()
                    .filter(|addr| !connected.contains(addr))
                    .take(budget)
                    .cloned()
                    .collect()
            };
            for addr in targets {
                let inner = self.clone();
                thread::spawn(move || {
                    match TcpStream::connect((addr.host.as_str(), addr.port)) {
                        Ok(stream) => {
                            let host = addr.host.clone();
                            inner.run_session(stream, host, false, Some(addr));
                        }
                        Err(err) => debug!(%addr, %err, "peer connect failed"),
                    }
                });
            }
            thread::sleep(Duration::from_millis(CONNECT_RETRY_MS));
        }
    }

    fn discovery_loop(self: Arc<Self>, interval_ms: u64) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            thread::sleep(Duration::from_millis(interval_ms.max(1_000)));
            let network = PeerNetwork {
                inner: self.clone(),
            };
            network.send_to_random_peer(&PeerMessage::PeerListRequest, false);
        }
    }

    /// Owns one connection: registers the handle, spawns the send worker,
    /// then reads and handles frames until the peer misbehaves or goes away.
    fn run_session(
        self: Arc<Self>,
        stream: TcpStream,
        host: String,
        is_inbound: bool,
        outbound_addr: Option<PeerAddr>,
    ) {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
        let write_stream = match stream.try_clone() {
            Ok(clone) => clone,
            Err(err) => {
                warn!(%host, ?err, "failed to split peer stream");
                return;
            }
        };

        let (sender, receiver) = mpsc::channel::<Vec<u8>>();
        self.peers.lock().insert(
            id,
            PeerHandle {
                sender,
                host: host.clone(),
                is_inbound,
                outbound_addr,
                verified: false,
                pubkey: None,
                is_full_history: false,
                suppressed_forwarding: false,
                need_msg_forwarding: true,
            },
        );

        let send_shutdown = self.shutdown.clone();
        thread::spawn(move || send_worker(write_stream, receiver, send_shutdown));

        let challenge = crypto::random_bytes(CHALLENGE_LEN);
        let mut session = PeerSession::new(id, host, is_inbound, challenge.clone());
        self.send_to(id, &PeerMessage::PeerChallenge(PeerChallenge {
            contract_id: self.contract_id.clone(),
            time_config: self.effective_time_config.load(Ordering::Relaxed),
            is_full_history: self.is_full_history,
            challenge,
        }));

        if let Err(err) = self.recv_loop(stream, &mut session) {
            debug!(peer = %session.display_name(), %err, "closing peer session");
        }
        self.peers.lock().remove(&id);
    }

    fn recv_loop(&self, mut stream: TcpStream, session: &mut PeerSession) -> NodeResult<()> {
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 16 * 1024];
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(NodeError::Shutdown);
            }
            match stream.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(err) => return Err(NodeError::Io(err)),
            }
            loop {
                match try_decode_frame(&mut buf) {
                    Ok(Some((envelope, frame_len))) => {
                        self.handle_envelope(session, envelope, frame_len)?;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        session.charge_bad_msg(&self.mesh)?;
                        return Err(err);
                    }
                }
            }
        }
    }

    fn handle_envelope(
        &self,
        session: &mut PeerSession,
        envelope: Envelope,
        frame_len: usize,
    ) -> NodeResult<()> {
        session.charge_bytes(frame_len, &self.mesh)?;

        if !session.is_verified() {
            return match envelope.content {
                PeerMessage::PeerChallenge(challenge) => {
                    self.answer_challenge(session, challenge)
                }
                PeerMessage::PeerChallengeResponse(response) => {
                    self.verify_challenge_response(session, response)
                }
                _ => Err(NodeError::ChallengeFailed(
                    "message before challenge verification".into(),
                )),
            };
        }

        let roundtime = self.effective_time_config.load(Ordering::Relaxed);
        if envelope.is_too_old(frame_len, roundtime) {
            debug!(peer = %session.display_name(), "dropping stale peer message");
            return Ok(());
        }

        match envelope.content {
            PeerMessage::PeerChallenge(challenge) => self.answer_challenge(session, challenge),
            PeerMessage::PeerChallengeResponse(_) => Ok(()),
            PeerMessage::Proposal(proposal) => self.handle_proposal(session, proposal),
            PeerMessage::NonUnlProposal(nup) => {
                self.collected.nonunl_proposals.lock().push(nup);
                Ok(())
            }
            PeerMessage::Npl(npl) => {
                if !self.unl.exists(&npl.pubkey) {
                    debug!(peer = %session.display_name(), "npl message pubkey not in unl");
                    return session.charge_bad_msg(&self.mesh);
                }
                if npl.verify().is_err() {
                    return session.charge_bad_msgsig(&self.mesh);
                }
                self.forward(&PeerMessage::Npl(npl.clone()), session.id);
                self.collected.npl_messages.lock().push(npl);
                Ok(())
            }
            PeerMessage::HpfsRequest(request) => {
                self.collected.hpfs_requests.lock().push((session.id, request));
                Ok(())
            }
            PeerMessage::HpfsResponse(response) => {
                self.collected.hpfs_responses.lock().push(response);
                Ok(())
            }
            PeerMessage::HpfsLogRequest(request) => {
                self.collected
                    .hpfs_log_requests
                    .lock()
                    .push((session.id, request));
                Ok(())
            }
            PeerMessage::HpfsLogResponse(response) => {
                self.collected.hpfs_log_responses.lock().push(response);
                Ok(())
            }
            PeerMessage::PeerListRequest => {
                let list = self.peer_list();
                self.send_to(session.id, &PeerMessage::PeerListResponse(list));
                Ok(())
            }
            PeerMessage::PeerListResponse(peers) => {
                let mut known = self.known_peers.lock();
                for peer in peers {
                    if !peer.host.is_empty() {
                        known.insert(PeerAddr {
                            host: peer.host,
                            port: peer.port,
                        });
                    }
                }
                Ok(())
            }
            PeerMessage::PeerCapacityAnnouncement(announcement) => {
                session.available_capacity = announcement.available_capacity;
                debug!(
                    peer = %session.display_name(),
                    capacity = session.available_capacity,
                    "peer announced capacity"
                );
                Ok(())
            }
            PeerMessage::PeerRequirementAnnouncement(announcement) => {
                if let Some(handle) = self.peers.lock().get_mut(&session.id) {
                    handle.need_msg_forwarding = announcement.need_consensus_msg_forwarding;
                }
                Ok(())
            }
            PeerMessage::Suppress(suppress) => {
                session.suppressions.insert(suppress.reason);
                if let Some(handle) = self.peers.lock().get_mut(&session.id) {
                    handle.suppressed_forwarding = true;
                }
                Ok(())
            }
        }
    }

    /// The remote challenged us: check compatibility and sign its bytes.
    fn answer_challenge(
        &self,
        session: &mut PeerSession,
        challenge: PeerChallenge,
    ) -> NodeResult<()> {
        if challenge.contract_id != self.contract_id {
            return Err(NodeError::ChallengeFailed("contract id mismatch".into()));
        }
        let roundtime = self.effective_time_config.load(Ordering::Relaxed);
        if challenge.time_config != roundtime {
            return Err(NodeError::ChallengeFailed(format!(
                "time config mismatch: {} != {roundtime}",
                challenge.time_config
            )));
        }
        if self.is_full_history && !challenge.is_full_history {
            return Err(NodeError::ChallengeFailed(
                "full-history peer required".into(),
            ));
        }
        session.is_full_history = challenge.is_full_history;
        if let Some(handle) = self.peers.lock().get_mut(&session.id) {
            handle.is_full_history = challenge.is_full_history;
        }
        let sig = crypto::sign(&challenge.challenge, &self.keypair);
        self.send_to(
            session.id,
            &PeerMessage::PeerChallengeResponse(PeerChallengeResponse {
                challenge: challenge.challenge,
                sig,
                pubkey: self.pubkey.clone(),
            }),
        );
        Ok(())
    }

    /// The remote answered our challenge: verify and admit the session.
    fn verify_challenge_response(
        &self,
        session: &mut PeerSession,
        response: PeerChallengeResponse,
    ) -> NodeResult<()> {
        if response.challenge != session.issued_challenge {
            return Err(NodeError::ChallengeFailed("challenge bytes mismatch".into()));
        }
        crypto::verify(&response.challenge, &response.sig, &response.pubkey)
            .map_err(|_| NodeError::ChallengeFailed("challenge signature invalid".into()))?;
        if response.pubkey == self.pubkey {
            return Err(NodeError::ChallengeFailed("connected to self".into()));
        }
        session.status = ChallengeStatus::Verified;
        session.pubkey = Some(response.pubkey.clone());
        if let Some(handle) = self.peers.lock().get_mut(&session.id) {
            handle.verified = true;
            handle.pubkey = Some(response.pubkey);
        }
        debug!(peer = %session.display_name(), "peer challenge verified");
        Ok(())
    }

    fn handle_proposal(&self, session: &mut PeerSession, proposal: Proposal) -> NodeResult<()> {
        if !self.unl.exists(&proposal.pubkey) {
            debug!(peer = %session.display_name(), "proposal pubkey not in unl");
            return session.charge_bad_msg(&self.mesh);
        }
        let hash = match proposal.verify() {
            Ok(hash) => hash,
            Err(_) => return session.charge_bad_msgsig(&self.mesh),
        };
        let key = (proposal.pubkey.clone(), proposal.stage, hash);
        {
            let mut seen = self.seen_proposals.lock();
            if seen.len() > SEEN_PROPOSAL_CAP {
                seen.clear();
            }
            if !seen.insert(key) {
                return session.charge_dup_msg(&self.mesh);
            }
        }
        self.forward(&PeerMessage::Proposal(proposal.clone()), session.id);
        self.collected.proposals.lock().push(proposal);
        Ok(())
    }

    /// Re-broadcasts a not-yet-seen message to the other peers.
    fn forward(&self, msg: &PeerMessage, source: SessionId) {
        if !self.mesh.msg_forwarding {
            return;
        }
        let Ok(frame) = encode_frame(&Envelope::new(msg.clone())) else {
            return;
        };
        let peers = self.peers.lock();
        for (id, handle) in peers.iter() {
            if *id == source
                || !handle.verified
                || handle.suppressed_forwarding
                || !handle.need_msg_forwarding
            {
                continue;
            }
            let _ = handle.sender.send(frame.clone());
        }
    }

    fn send_to(&self, session_id: SessionId, msg: &PeerMessage) {
        let Ok(frame) = encode_frame(&Envelope::new(msg.clone())) else {
            return;
        };
        if let Some(handle) = self.peers.lock().get(&session_id) {
            let _ = handle.sender.send(frame);
        }
    }

    fn peer_list(&self) -> Vec<PeerProperties> {
        let timestamp = now_ms();
        self.known_peers
            .lock()
            .iter()
            .map(|addr| PeerProperties {
                host: addr.host.clone(),
                port: addr.port,
                available_capacity: -1,
                timestamp,
            })
            .collect()
    }
}

fn send_worker(
    mut stream: TcpStream,
    receiver: mpsc::Receiver<Vec<u8>>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(frame) => {
                if stream.write_all(&frame).is_err() {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}
