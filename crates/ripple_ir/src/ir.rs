//! Inconsistent-replication protocol core.
//!
//! Replicas running this protocol agree on the *outcome* of transactions
//! without agreeing on the order of individual operations. This crate holds
//! the transport-agnostic pieces: membership and quorum arithmetic, the view
//! lifecycle, and the per-transaction record table that view changes merge
//! into a master record.

pub mod record;
pub mod types;
pub mod view;

pub use record::{OpResult, Record, RecordEntry, RecordPhase};
pub use types::{CasWrite, Membership, OpMode, Operation, QuorumError, ReplicaId, ViewId};
pub use view::{next_leader, View, ViewState};
