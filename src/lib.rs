//! Core crate of the crucible smart-contract execution node.
//!
//! A cluster of these nodes agrees, round by round, on a totally ordered
//! batch of user inputs, the contract outputs returned for them, and the
//! post-execution state of a content-addressed filesystem. The `consensus`
//! module drives the multi-stage round machine, `cafs` supplies the
//! content-addressed filesystem (mounts, block sync and the full-history
//! write log), `ledger` persists the hash-chained round records in SQLite
//! shards, and `p2p`/`usr` carry the peer and user protocols.
//!
//! Applications typically bootstrap through [`config::HpConfig`] and
//! operate the node via [`node::Node`].

pub mod buffer;
pub mod cafs;
pub mod config;
pub mod consensus;
pub mod contract;
pub mod crypto;
pub mod errors;
pub mod hash;
pub mod ledger;
pub mod node;
pub mod p2p;
pub mod unl;
pub mod usr;
pub mod util;
