use std::collections::HashMap;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crypto;
use crate::errors::{NodeError, NodeResult};
use crate::hash::{hash_bytes, H32};
use crate::ledger::store::LedgerStore;
use crate::ledger::LedgerRecord;
use crate::p2p::messages::SubmittedUserInput;
use crate::util::now_ms;

const ACCEPT_IDLE_MS: u64 = 20;
const READ_TIMEOUT_MS: u64 = 50;
const MAX_USER_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Messages a connected user may send.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum UserMessage {
    /// Announces the user's public key; must precede everything else.
    Connect { pubkey: Vec<u8> },
    /// A signed input for the next round.
    Input(SubmittedUserInput),
    /// Read-only ledger query.
    Query { id: u64, request: LedgerQueryRequest },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LedgerQueryRequest {
    BySeqNo {
        seq_no: u64,
        inputs: bool,
        outputs: bool,
    },
    InputByHash {
        hash: H32,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LedgerQueryResult {
    pub ledger: Option<LedgerRecord>,
    pub users: Vec<Vec<u8>>,
    pub inputs: Vec<(H32, Vec<u8>)>,
    pub outputs: Vec<Vec<u8>>,
}

/// Terse tagged errors surfaced to users.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserErrorTag {
    BadSig,
    RateLimited,
    NotFound,
    Internal,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum UserReply {
    Connected,
    InputAccepted { hash: H32 },
    Error { tag: UserErrorTag },
    QueryResult { id: u64, result: LedgerQueryResult },
    /// Contract outputs for this user, streamed at round commit.
    Output { seq_no: u64, outputs: Vec<Vec<u8>> },
}

struct UserHandle {
    sender: mpsc::Sender<Vec<u8>>,
    pubkey: Option<Vec<u8>>,
}

struct UserInner {
    tls: Option<Arc<ServerConfig>>,
    max_bytes_per_msg: u64,
    concurrent_read_requests: u64,
    ledger: Arc<LedgerStore>,
    sessions: Mutex<HashMap<u64, UserHandle>>,
    input_pool: Mutex<Vec<(Vec<u8>, SubmittedUserInput)>>,
    next_session_id: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

/// TLS user endpoint: accepts signed inputs into the round pool, serves
/// read-only ledger queries and streams outputs back at commit.
#[derive(Clone)]
pub struct UserServer {
    inner: Arc<UserInner>,
}

impl UserServer {
    pub fn start(
        port: u16,
        listen: bool,
        max_bytes_per_msg: u64,
        concurrent_read_requests: u64,
        tls_key_file: &Path,
        tls_cert_file: &Path,
        ledger: Arc<LedgerStore>,
        shutdown: Arc<AtomicBool>,
    ) -> NodeResult<Self> {
        let tls = if listen {
            Some(Arc::new(load_tls_config(tls_key_file, tls_cert_file)?))
        } else {
            None
        };
        let inner = Arc::new(UserInner {
            tls,
            max_bytes_per_msg,
            concurrent_read_requests,
            ledger,
            sessions: Mutex::new(HashMap::new()),
            input_pool: Mutex::new(Vec::new()),
            next_session_id: AtomicU64::new(1),
            shutdown,
        });
        if listen {
            let listener = TcpListener::bind(("0.0.0.0", port))?;
            listener.set_nonblocking(true)?;
            let accept_inner = inner.clone();
            thread::spawn(move || accept_inner.accept_loop(listener));
            info!(port, "user listener started");
        }
        Ok(Self { inner })
    }

    /// Queues a verified input into the round pool. Sessions use this after
    /// signature checks; embedders may inject inputs directly.
    pub fn queue_input(&self, pubkey: Vec<u8>, input: SubmittedUserInput) {
        self.inner.input_pool.lock().push((pubkey, input));
    }

    /// Drains the inputs queued since the last round, keyed by submitter.
    pub fn take_inputs(&self) -> Vec<(Vec<u8>, SubmittedUserInput)> {
        std::mem::take(&mut *self.inner.input_pool.lock())
    }

    /// Re-queues inputs that did not reach consensus this round.
    pub fn requeue_inputs(&self, inputs: Vec<(Vec<u8>, SubmittedUserInput)>) {
        self.inner.input_pool.lock().extend(inputs);
    }

    /// Streams a committed round's outputs to the sessions of each user.
    pub fn send_outputs(&self, seq_no: u64, outputs: &HashMap<Vec<u8>, Vec<Vec<u8>>>) {
        let sessions = self.inner.sessions.lock();
        for handle in sessions.values() {
            let Some(pubkey) = &handle.pubkey else {
                continue;
            };
            if let Some(user_outputs) = outputs.get(pubkey) {
                if let Ok(frame) = encode_reply(&UserReply::Output {
                    seq_no,
                    outputs: user_outputs.clone(),
                }) {
                    let _ = handle.sender.send(frame);
                }
            }
        }
    }

    pub fn connected_users(&self) -> Vec<Vec<u8>> {
        self.inner
            .sessions
            .lock()
            .values()
            .filter_map(|handle| handle.pubkey.clone())
            .collect()
    }
}

impl UserInner {
    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match listener.accept() {
                Ok((stream, addr)) => {
                    let inner = self.clone();
                    thread::spawn(move || {
                        if let Err(err) = inner.run_session(stream) {
                            debug!(%addr, %err, "user session closed");
                        }
                    });
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(ACCEPT_IDLE_MS));
                }
                Err(err) => {
                    warn!(?err, "user listener failed");
                    break;
                }
            }
        }
    }

    fn run_session(self: Arc<Self>, stream: TcpStream) -> NodeResult<()> {
        stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)))?;
        let tls = self
            .tls
            .clone()
            .ok_or_else(|| NodeError::ConfigInvalid("user listener has no tls config".into()))?;
        let conn = ServerConnection::new(tls)
            .map_err(|err| NodeError::ConfigInvalid(format!("tls setup failed: {err}")))?;
        let mut tls_stream = StreamOwned::new(conn, stream);

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel::<Vec<u8>>();
        self.sessions.lock().insert(
            id,
            UserHandle {
                sender,
                pubkey: None,
            },
        );

        let result = self.session_loop(id, &mut tls_stream, receiver);
        self.sessions.lock().remove(&id);
        result
    }

    /// Single worker per user connection: interleaves reads of user
    /// messages with writes of queued replies/outputs.
    fn session_loop(
        &self,
        id: u64,
        stream: &mut StreamOwned<ServerConnection, TcpStream>,
        receiver: mpsc::Receiver<Vec<u8>>,
    ) -> NodeResult<()> {
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 16 * 1024];
        let mut pubkey: Option<Vec<u8>> = None;
        let mut reads_in_flight = 0u64;
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(NodeError::Shutdown);
            }
            while let Ok(frame) = receiver.try_recv() {
                stream.write_all(&frame)?;
            }
            match stream.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(err) => return Err(NodeError::Io(err)),
            }
            while let Some((message, frame_len)) = decode_user_frame(&mut buf)? {
                if self.max_bytes_per_msg > 0 && frame_len as u64 > self.max_bytes_per_msg {
                    send_reply(stream, &UserReply::Error { tag: UserErrorTag::RateLimited })?;
                    return Err(NodeError::QuotaExceeded("user message too large".into()));
                }
                self.handle_message(id, stream, &mut pubkey, &mut reads_in_flight, message)?;
            }
        }
    }

    fn handle_message(
        &self,
        id: u64,
        stream: &mut StreamOwned<ServerConnection, TcpStream>,
        pubkey: &mut Option<Vec<u8>>,
        reads_in_flight: &mut u64,
        message: UserMessage,
    ) -> NodeResult<()> {
        match message {
            UserMessage::Connect { pubkey: key } => {
                if crypto::public_key_from_bin(&key).is_err() {
                    send_reply(stream, &UserReply::Error { tag: UserErrorTag::BadSig })?;
                    return Err(NodeError::SignatureInvalid("user pubkey invalid".into()));
                }
                *pubkey = Some(key.clone());
                if let Some(handle) = self.sessions.lock().get_mut(&id) {
                    handle.pubkey = Some(key);
                }
                send_reply(stream, &UserReply::Connected)
            }
            UserMessage::Input(input) => {
                let Some(user_key) = pubkey.as_ref() else {
                    send_reply(stream, &UserReply::Error { tag: UserErrorTag::Internal })?;
                    return Err(NodeError::MessageMalformed("input before connect".into()));
                };
                if crypto::verify(&input.input_container, &input.sig, user_key).is_err() {
                    debug!("rejecting user input with bad signature");
                    return send_reply(stream, &UserReply::Error { tag: UserErrorTag::BadSig });
                }
                let hash = hash_bytes(&input.input_container);
                self.input_pool.lock().push((user_key.clone(), input));
                send_reply(stream, &UserReply::InputAccepted { hash })
            }
            UserMessage::Query { id: query_id, request } => {
                let Some(user_key) = pubkey.as_ref().cloned() else {
                    return send_reply(stream, &UserReply::Error { tag: UserErrorTag::Internal });
                };
                if self.concurrent_read_requests > 0
                    && *reads_in_flight >= self.concurrent_read_requests
                {
                    return send_reply(stream, &UserReply::Error { tag: UserErrorTag::RateLimited });
                }
                *reads_in_flight += 1;
                let outcome = self.execute_query(&user_key, request);
                *reads_in_flight -= 1;
                match outcome {
                    Ok(Some(result)) => {
                        send_reply(stream, &UserReply::QueryResult { id: query_id, result })
                    }
                    Ok(None) => send_reply(stream, &UserReply::Error { tag: UserErrorTag::NotFound }),
                    Err(err) => {
                        warn!(%err, "user ledger query failed");
                        send_reply(stream, &UserReply::Error { tag: UserErrorTag::Internal })
                    }
                }
            }
        }
    }

    /// Runs a read-only query, filtered to the calling user's own
    /// inputs/outputs.
    fn execute_query(
        &self,
        user_key: &[u8],
        request: LedgerQueryRequest,
    ) -> NodeResult<Option<LedgerQueryResult>> {
        match request {
            LedgerQueryRequest::BySeqNo {
                seq_no,
                inputs,
                outputs,
            } => {
                let Some(ledger) = self.ledger.get_ledger_by_seq_no(seq_no)? else {
                    return Ok(None);
                };
                let mut result = LedgerQueryResult {
                    users: self.ledger.get_users_by_seq_no(seq_no)?,
                    ledger: Some(ledger),
                    ..LedgerQueryResult::default()
                };
                if inputs {
                    for input in self
                        .ledger
                        .get_user_inputs_by_seq_no(seq_no, Some(user_key))?
                    {
                        let payload = self.ledger.read_input_payload(&input)?;
                        result.inputs.push((input.hash, payload));
                    }
                }
                if outputs {
                    for output in self
                        .ledger
                        .get_user_outputs_by_seq_no(seq_no, Some(user_key))?
                    {
                        result
                            .outputs
                            .extend(self.ledger.read_output_payloads(&output)?);
                    }
                }
                Ok(Some(result))
            }
            LedgerQueryRequest::InputByHash { hash } => {
                let Some((input, ledger)) = self.ledger.get_user_input_by_hash(&hash)? else {
                    return Ok(None);
                };
                if input.pubkey != user_key {
                    return Ok(None);
                }
                let payload = self.ledger.read_input_payload(&input)?;
                Ok(Some(LedgerQueryResult {
                    ledger,
                    inputs: vec![(input.hash, payload)],
                    ..LedgerQueryResult::default()
                }))
            }
        }
    }
}

fn load_tls_config(key_file: &Path, cert_file: &Path) -> NodeResult<ServerConfig> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(std::fs::File::open(cert_file)?))
        .map_err(|err| NodeError::ConfigInvalid(format!("invalid tls certificate: {err}")))?
        .into_iter()
        .map(rustls::Certificate)
        .collect::<Vec<_>>();
    if certs.is_empty() {
        return Err(NodeError::ConfigInvalid(format!(
            "no certificates found in {}",
            cert_file.display()
        )));
    }
    let mut reader = BufReader::new(std::fs::File::open(key_file)?);
    let key = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|err| NodeError::ConfigInvalid(format!("invalid tls key: {err}")))?
        .into_iter()
        .next()
        .map(rustls::PrivateKey)
        .or_else(|| {
            let mut reader = BufReader::new(std::fs::File::open(key_file).ok()?);
            rustls_pemfile::rsa_private_keys(&mut reader)
                .ok()?
                .into_iter()
                .next()
                .map(rustls::PrivateKey)
        })
        .ok_or_else(|| {
            NodeError::ConfigInvalid(format!("no private key found in {}", key_file.display()))
        })?;
    ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| NodeError::ConfigInvalid(format!("tls configuration rejected: {err}")))
}

fn encode_reply(reply: &UserReply) -> NodeResult<Vec<u8>> {
    let body = bincode::serialize(reply)?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn send_reply(
    stream: &mut StreamOwned<ServerConnection, TcpStream>,
    reply: &UserReply,
) -> NodeResult<()> {
    let frame = encode_reply(reply)?;
    stream.write_all(&frame)?;
    Ok(())
}

fn decode_user_frame(buf: &mut Vec<u8>) -> NodeResult<Option<(UserMessage, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len == 0 || len > MAX_USER_FRAME_LEN {
        return Err(NodeError::MessageMalformed(format!(
            "invalid user frame length {len}"
        )));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let message: UserMessage = bincode::deserialize(&buf[4..4 + len])
        .map_err(|err| NodeError::MessageMalformed(format!("undecodable user frame: {err}")))?;
    buf.drain(0..4 + len);
    Ok(Some((message, 4 + len)))
}

/// Stamp applied to queued inputs so replays across rounds are detectable.
pub fn input_nonce() -> u64 {
    now_ms()
}
