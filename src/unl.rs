use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use tracing::info;

use crate::p2p::messages::Proposal;

/// Rounds a peer may stay silent before its declared roundtime stops
/// counting towards the majority vote.
const STAT_WINDOW_ROUNDS: u64 = 4;

#[derive(Clone, Copy, Debug, Default)]
pub struct PeerStat {
    pub last_seen_round: u64,
    pub observed_proposals: u64,
    pub last_time_config: u32,
}

/// The set of peers this node trusts for consensus, plus rolling per-peer
/// statistics fed from accepted proposals.
pub struct UnlRegistry {
    members: RwLock<BTreeSet<Vec<u8>>>,
    stats: RwLock<HashMap<Vec<u8>, PeerStat>>,
    threshold: u32,
}

impl UnlRegistry {
    pub fn new(members: BTreeSet<Vec<u8>>, threshold: u32) -> Self {
        Self {
            members: RwLock::new(members),
            stats: RwLock::new(HashMap::new()),
            threshold,
        }
    }

    pub fn exists(&self, pubkey: &[u8]) -> bool {
        self.members.read().contains(pubkey)
    }

    pub fn count(&self) -> usize {
        self.members.read().len()
    }

    pub fn get(&self) -> BTreeSet<Vec<u8>> {
        self.members.read().clone()
    }

    /// Replaces the member set after a patch-file change. Stats of removed
    /// peers are dropped.
    pub fn update_from_patch(&self, members: BTreeSet<Vec<u8>>) {
        let mut current = self.members.write();
        if *current == members {
            return;
        }
        info!(count = members.len(), "unl updated from patch");
        self.stats
            .write()
            .retain(|pubkey, _| members.contains(pubkey));
        *current = members;
    }

    /// Records which trusted peers spoke this round and what roundtime they
    /// declared.
    pub fn update_stats(&self, proposals: &[Proposal], round: u64) {
        let members = self.members.read();
        let mut stats = self.stats.write();
        for proposal in proposals {
            if !members.contains(&proposal.pubkey) {
                continue;
            }
            let stat = stats.entry(proposal.pubkey.clone()).or_default();
            stat.last_seen_round = round;
            stat.observed_proposals += 1;
            stat.last_time_config = proposal.time_config;
        }
    }

    /// Fraction of recent rounds a peer has been heard from.
    pub fn reliability(&self, pubkey: &[u8], current_round: u64) -> f64 {
        let stats = self.stats.read();
        match stats.get(pubkey) {
            Some(stat) if current_round > 0 => {
                (stat.observed_proposals as f64 / current_round as f64).min(1.0)
            }
            _ => 0.0,
        }
    }

    /// The roundtime supported by a threshold share of recently seen UNL
    /// peers, or the node's own configured value when no majority exists.
    pub fn get_majority_time_config(&self, own_time_config: u32, current_round: u64) -> u32 {
        let members = self.members.read();
        let stats = self.stats.read();
        let mut counts: HashMap<u32, usize> = HashMap::new();
        for member in members.iter() {
            if let Some(stat) = stats.get(member) {
                if stat.last_seen_round + STAT_WINDOW_ROUNDS >= current_round
                    && stat.last_time_config > 0
                {
                    *counts.entry(stat.last_time_config).or_default() += 1;
                }
            }
        }
        let required = (members.len() as u64 * self.threshold as u64).div_ceil(100) as usize;
        counts
            .into_iter()
            .filter(|(_, count)| *count >= required.max(1))
            .max_by_key(|(_, count)| *count)
            .map(|(time_config, _)| time_config)
            .unwrap_or(own_time_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(tag: u8) -> Vec<u8> {
        vec![tag; 33]
    }

    fn proposal_from(pubkey: Vec<u8>, time_config: u32) -> Proposal {
        Proposal {
            pubkey,
            time_config,
            ..Proposal::default()
        }
    }

    fn registry(members: &[Vec<u8>]) -> UnlRegistry {
        UnlRegistry::new(members.iter().cloned().collect(), 80)
    }

    #[test]
    fn membership_checks() {
        let registry = registry(&[member(1), member(2)]);
        assert_eq!(registry.count(), 2);
        assert!(registry.exists(&member(1)));
        assert!(!registry.exists(&member(9)));
    }

    #[test]
    fn patch_update_replaces_members_and_prunes_stats() {
        let registry = registry(&[member(1), member(2)]);
        registry.update_stats(&[proposal_from(member(1), 1_000)], 1);
        registry.update_from_patch([member(2), member(3)].into_iter().collect());
        assert!(!registry.exists(&member(1)));
        assert!(registry.exists(&member(3)));
        assert_eq!(registry.reliability(&member(1), 1), 0.0);
    }

    #[test]
    fn majority_time_config_needs_threshold_share() {
        let registry = registry(&[member(1), member(2), member(3)]);
        // Only one of three peers declares 2000ms: below the 80% threshold.
        registry.update_stats(&[proposal_from(member(1), 2_000)], 1);
        assert_eq!(registry.get_majority_time_config(1_000, 1), 1_000);

        registry.update_stats(
            &[
                proposal_from(member(1), 2_000),
                proposal_from(member(2), 2_000),
                proposal_from(member(3), 2_000),
            ],
            2,
        );
        assert_eq!(registry.get_majority_time_config(1_000, 2), 2_000);
    }

    #[test]
    fn stale_peers_fall_out_of_the_vote() {
        let registry = registry(&[member(1)]);
        registry.update_stats(&[proposal_from(member(1), 2_000)], 1);
        assert_eq!(registry.get_majority_time_config(1_000, 2), 2_000);
        assert_eq!(
            registry.get_majority_time_config(1_000, 1 + STAT_WINDOW_ROUNDS + 1),
            1_000
        );
    }

    #[test]
    fn untrusted_proposals_are_ignored_in_stats() {
        let registry = registry(&[member(1)]);
        registry.update_stats(&[proposal_from(member(9), 2_000)], 1);
        assert_eq!(registry.reliability(&member(9), 1), 0.0);
        assert_eq!(registry.get_majority_time_config(1_000, 1), 1_000);
    }
}
