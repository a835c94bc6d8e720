pub mod messages;
pub mod server;
pub mod session;

use parking_lot::Mutex;

use crate::p2p::messages::{
    HpfsLogRequest, HpfsLogResponse, HpfsRequest, HpfsResponse, NonUnlProposal, NplMessage,
    Proposal,
};

/// Identifies one live peer connection for reply routing.
pub type SessionId = u64;

/// Queues the I/O workers fill and the engine/sync workers drain. Each
/// queue has a single consumer; transfer is an O(1) swap under the lock.
#[derive(Default)]
pub struct CollectedMsgs {
    pub proposals: Mutex<Vec<Proposal>>,
    pub nonunl_proposals: Mutex<Vec<NonUnlProposal>>,
    pub npl_messages: Mutex<Vec<NplMessage>>,
    pub hpfs_requests: Mutex<Vec<(SessionId, HpfsRequest)>>,
    pub hpfs_responses: Mutex<Vec<HpfsResponse>>,
    pub hpfs_log_requests: Mutex<Vec<(SessionId, HpfsLogRequest)>>,
    pub hpfs_log_responses: Mutex<Vec<HpfsLogResponse>>,
}

impl CollectedMsgs {
    pub fn drain_proposals(&self) -> Vec<Proposal> {
        std::mem::take(&mut *self.proposals.lock())
    }

    pub fn drain_nonunl_proposals(&self) -> Vec<NonUnlProposal> {
        std::mem::take(&mut *self.nonunl_proposals.lock())
    }

    pub fn drain_npl_messages(&self) -> Vec<NplMessage> {
        std::mem::take(&mut *self.npl_messages.lock())
    }

    pub fn drain_hpfs_requests(&self) -> Vec<(SessionId, HpfsRequest)> {
        std::mem::take(&mut *self.hpfs_requests.lock())
    }

    pub fn drain_hpfs_responses(&self) -> Vec<HpfsResponse> {
        std::mem::take(&mut *self.hpfs_responses.lock())
    }

    pub fn drain_hpfs_log_requests(&self) -> Vec<(SessionId, HpfsLogRequest)> {
        std::mem::take(&mut *self.hpfs_log_requests.lock())
    }

    pub fn drain_hpfs_log_responses(&self) -> Vec<HpfsLogResponse> {
        std::mem::take(&mut *self.hpfs_log_responses.lock())
    }
}
