//! Shared protocol types.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both the replica engine and the client coordinator, and several of
//! them travel on the wire or into the record buckets as JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Stable replica identity: the `host:port` a replica is reachable at.
///
/// Identities double as the sort key for deterministic leader ordering, so
/// they must be comparable byte-for-byte across the whole cluster.
pub type ReplicaId = String;

/// Monotonic view number. Strictly increases on every transition that leaves
/// the NORMAL state.
pub type ViewId = u64;

/// Execution mode for an operation request.
///
/// Inconsistent operations may execute in different orders at each replica;
/// the application protocol reconciles afterwards. Consensus operations let
/// the client-side `decide` pick a single result that is then finalized at
/// every replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum OpMode {
    Inconsistent,
    Consensus,
}

impl From<OpMode> for u8 {
    fn from(mode: OpMode) -> u8 {
        match mode {
            OpMode::Inconsistent => 0,
            OpMode::Consensus => 1,
        }
    }
}

impl TryFrom<u8> for OpMode {
    type Error = String;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(OpMode::Inconsistent),
            1 => Ok(OpMode::Consensus),
            other => Err(format!("unknown operation mode {other}")),
        }
    }
}

/// A compare-and-set write: `proposed` replaces the stored value only if the
/// stored value still equals `previous`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasWrite {
    pub previous: String,
    pub proposed: String,
}

/// One transactional operation: reads, blind writes, and CAS writes.
///
/// Invariants: `write_set` keys never appear in `read_set`; every
/// `write_cset` key does, and its `previous` is the value the client observed
/// in the preceding read.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "readSet", default, skip_serializing_if = "Vec::is_empty")]
    pub read_set: Vec<String>,
    #[serde(rename = "writeSet", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub write_set: BTreeMap<String, String>,
    #[serde(rename = "writeCSet", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub write_cset: BTreeMap<String, CasWrite>,
}

impl Operation {
    /// Build an operation from a read set and a map of intended writes,
    /// reclassifying each write whose key was also read as a CAS write.
    pub fn from_sets(read_set: Vec<String>, writes: BTreeMap<String, CasWrite>) -> Self {
        let mut write_set = BTreeMap::new();
        let mut write_cset = BTreeMap::new();
        for (key, cas) in writes {
            if read_set.iter().any(|read| read == &key) {
                write_cset.insert(key, cas);
            } else {
                write_set.insert(key, cas.proposed);
            }
        }
        Self {
            read_set,
            write_set,
            write_cset,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read_set.is_empty() && self.write_set.is_empty() && self.write_cset.is_empty()
    }

    /// All writes this operation performs when it succeeds, CAS included.
    pub fn effective_writes(&self) -> impl Iterator<Item = (&String, &String)> {
        self.write_set
            .iter()
            .chain(self.write_cset.iter().map(|(k, cas)| (k, &cas.proposed)))
    }
}

/// Ordered membership set for a view. Size is `N = 2f + 1` where `f` is the
/// tolerated failure count.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    members: Vec<ReplicaId>,
}

impl Membership {
    pub fn new(mut members: Vec<ReplicaId>) -> Self {
        members.sort();
        members.dedup();
        Self { members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.iter().any(|member| member == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplicaId> {
        self.members.iter()
    }

    pub fn to_vec(&self) -> Vec<ReplicaId> {
        self.members.clone()
    }

    /// Failures tolerated by this membership (`f` in `N = 2f + 1`).
    pub fn tolerated_failures(&self) -> usize {
        self.members.len().saturating_sub(1) / 2
    }

    /// Classic (majority) quorum: `⌊N/2⌋ + 1`.
    pub fn classic_quorum(&self) -> usize {
        classic_quorum(self.members.len())
    }

    /// Fast quorum: `⌈3f/2⌉ + 1`, enough to skip `decide()` for consensus
    /// operations.
    pub fn fast_quorum(&self) -> usize {
        fast_quorum(self.members.len())
    }
}

/// Classic (majority) quorum for a cluster of `n` replicas.
pub fn classic_quorum(n: usize) -> usize {
    n / 2 + 1
}

/// Fast quorum for a cluster of `n` replicas: `⌈3f/2⌉ + 1` with
/// `f = ⌊(n−1)/2⌋`.
pub fn fast_quorum(n: usize) -> usize {
    let f = n.saturating_sub(1) / 2;
    (3 * f).div_ceil(2) + 1
}

/// Quorum-level failures surfaced by the client coordinator.
#[derive(Debug, thiserror::Error)]
pub enum QuorumError {
    #[error(
        "insufficient quorum: {received} matching responses, {required} required \
         (latest view {latest_view})"
    )]
    InsufficientQuorum {
        received: usize,
        required: usize,
        latest_view: ViewId,
    },
    #[error("responses were for a stale view (latest view {latest_view})")]
    StaleView { latest_view: ViewId },
}

impl QuorumError {
    /// The highest view observed while the request failed, so the caller can
    /// catch up before retrying.
    pub fn latest_view(&self) -> ViewId {
        match self {
            QuorumError::InsufficientQuorum { latest_view, .. } => *latest_view,
            QuorumError::StaleView { latest_view } => *latest_view,
        }
    }
}
