//! Client-side quorum coordinator.
//!
//! Fans operation and view-change requests out to every replica connection,
//! collects replies into a bounded channel under a deadline, and decides the
//! outcome: matching-view classic quorum for inconsistent operations, fast
//! quorum (falling back to `decide()` at classic quorum) for consensus
//! operations. Stale-view responses are discarded, and the highest view
//! observed is tracked so callers can catch up.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ripple_ir::record::{OpResult, Record};
use ripple_ir::types::{self, CasWrite, OpMode, Operation, QuorumError, ReplicaId, ViewId};

use crate::conn::{ConnHandler, MessageHandler, TransportError};
use crate::message::{
    Message, OperationRequest, OperationResponse, ViewChangeRequest, ViewChangeResponse,
};

/// Outcome of a view-change fan-out: the records collected from matching
/// responders plus the highest view anyone reported.
pub struct ViewChangeOutcome {
    pub latest_view: ViewId,
    pub records: Vec<Record>,
}

/// Coordinates one client's requests against a set of replica connections.
pub struct Coordinator {
    connections: Vec<Arc<ConnHandler>>,
    client_id: String,
    cluster_size: usize,
    timeout: Duration,
    current_view_id: AtomicU64,
}

impl Coordinator {
    /// Build a coordinator over already-established connections. The quorum
    /// denominator is the cluster size, which may exceed the connection
    /// count when some members are unreachable.
    pub fn new(
        connections: Vec<Arc<ConnHandler>>,
        client_id: String,
        cluster_size: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            connections,
            client_id,
            cluster_size,
            timeout,
            current_view_id: AtomicU64::new(0),
        }
    }

    /// Dial every replica in `cluster` and build a coordinator.
    pub async fn connect(
        cluster: &[ReplicaId],
        handler: MessageHandler,
        request_timeout: Duration,
        batch_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self, TransportError> {
        let mut connections = Vec::with_capacity(cluster.len());
        for server in cluster {
            let stream = TcpStream::connect(server.as_str()).await?;
            let addr = stream.peer_addr()?;
            connections.push(ConnHandler::spawn(
                stream,
                addr,
                handler.clone(),
                request_timeout,
                cancel,
            ));
        }
        let cluster_size = cluster.len();
        Ok(Self::new(
            connections,
            Uuid::new_v4().to_string(),
            cluster_size,
            batch_timeout,
        ))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The highest view this coordinator has observed.
    pub fn current_view_id(&self) -> ViewId {
        self.current_view_id.load(Ordering::Relaxed)
    }

    /// Package reads and writes into an inconsistent operation and run it to
    /// a matching-view classic quorum.
    pub async fn send_operation(
        &self,
        read_set: Vec<String>,
        writes: BTreeMap<String, CasWrite>,
    ) -> Result<OperationResponse, QuorumError> {
        let op = Operation::from_sets(read_set, writes);
        let request = OperationRequest {
            mode: OpMode::Inconsistent,
            client_id: self.client_id.clone(),
            transaction_id: Uuid::new_v4().to_string(),
            propose: Some(op),
            finalize: None,
        };
        let responses = self
            .fan_out_operations(Message::OperationRequest(request))
            .await;
        let quorum = types::classic_quorum(self.cluster_size);
        let (view_id, matching) = self.matching_view_responses(responses)?;
        if matching.len() < quorum {
            return Err(QuorumError::InsufficientQuorum {
                received: matching.len(),
                required: quorum,
                latest_view: view_id,
            });
        }
        // Any matching-quorum reply wins for inconsistent operations.
        Ok(matching.into_iter().next().expect("quorum is nonzero"))
    }

    /// Run a consensus operation: fast quorum of matching results decides
    /// immediately; otherwise a classic quorum of candidates goes through
    /// `decide()`. The decision is then finalized at the replicas.
    pub async fn send_consensus_operation(
        &self,
        read_set: Vec<String>,
        writes: BTreeMap<String, CasWrite>,
    ) -> Result<OperationResponse, QuorumError> {
        let op = Operation::from_sets(read_set, writes);
        let transaction_id = Uuid::new_v4().to_string();
        let request = OperationRequest {
            mode: OpMode::Consensus,
            client_id: self.client_id.clone(),
            transaction_id: transaction_id.clone(),
            propose: Some(op.clone()),
            finalize: None,
        };
        let responses = self
            .fan_out_operations(Message::OperationRequest(request))
            .await;

        let classic = types::classic_quorum(self.cluster_size);
        let fast = types::fast_quorum(self.cluster_size);
        let (view_id, candidates) = self.matching_view_responses(responses)?;
        if candidates.len() < classic {
            return Err(QuorumError::InsufficientQuorum {
                received: candidates.len(),
                required: classic,
                latest_view: view_id,
            });
        }

        let (decision, agreeing) = modal_result(&candidates);
        let decision = if agreeing >= fast {
            // Fast path: a super-quorum already agrees on the result.
            decision
        } else {
            decide(&candidates)
        };

        // Persist the decision: an aborted operation finalizes with no writes.
        let finalize_op = if decision.success {
            op
        } else {
            Operation {
                read_set: op.read_set.clone(),
                ..Operation::default()
            }
        };
        let finalize = OperationRequest {
            mode: OpMode::Consensus,
            client_id: self.client_id.clone(),
            transaction_id,
            propose: None,
            finalize: Some(finalize_op),
        };
        let message = Message::OperationRequest(finalize);
        for conn in &self.connections {
            let conn = conn.clone();
            let message = message.clone();
            tokio::spawn(async move {
                if let Err(err) = conn.send_untracked(None, message).await {
                    tracing::debug!(peer = %conn.peer_addr(), error = %err, "finalize send failed");
                }
            });
        }

        Ok(OperationResponse {
            success: decision.success,
            view_id,
            read_values: decision.read_values,
        })
    }

    /// Fan a view-change request to every peer. Succeeds once
    /// `classic_quorum − 1` responders (self excluded) match `target_view`,
    /// returning their records for the master-record merge.
    pub async fn send_view_change_request(
        &self,
        target_view: ViewId,
        members: Vec<ReplicaId>,
    ) -> Result<ViewChangeOutcome, QuorumError> {
        let required = types::classic_quorum(self.cluster_size).saturating_sub(1);
        let request = Message::ViewChangeRequest(ViewChangeRequest {
            view_id: target_view,
            members,
        });

        let mut rx = self.fan_out(request);
        let deadline = Instant::now() + self.timeout;
        let mut latest_view = target_view;
        let mut matching: Vec<ViewChangeResponse> = Vec::new();

        while matching.len() < required {
            let Some(message) = recv_until(&mut rx, deadline).await else {
                break;
            };
            match message {
                Ok(Message::ViewChangeResponse(resp)) => {
                    latest_view = latest_view.max(resp.view_id);
                    if resp.view_id == target_view {
                        matching.push(resp);
                    }
                }
                Ok(other) => {
                    tracing::warn!(?other, "unexpected reply to view change request");
                }
                // Failed peers count toward the denominator, not the batch.
                Err(err) => {
                    tracing::debug!(error = %err, "peer failed during view change");
                }
            }
        }

        if matching.len() < required {
            return Err(QuorumError::InsufficientQuorum {
                received: matching.len(),
                required,
                latest_view,
            });
        }
        self.observe_view(latest_view);
        Ok(ViewChangeOutcome {
            latest_view,
            records: matching
                .into_iter()
                .map(|resp| Record::from_entries(resp.record))
                .collect(),
        })
    }

    /// Spawn one send task per connection and return the collection channel.
    fn fan_out(&self, message: Message) -> mpsc::Receiver<Result<Message, TransportError>> {
        let (tx, rx) = mpsc::channel(self.connections.len().max(1));
        for conn in &self.connections {
            let conn = conn.clone();
            let message = message.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = conn.send_request(message).await;
                // Receiver may already have decided and gone away.
                let _ = tx.send(result).await;
            });
        }
        rx
    }

    /// Fan out an operation request and collect responses until the deadline
    /// or until every connection has answered.
    async fn fan_out_operations(&self, message: Message) -> Vec<OperationResponse> {
        let mut rx = self.fan_out(message);
        let deadline = Instant::now() + self.timeout;
        let mut responses = Vec::with_capacity(self.connections.len());
        while responses.len() < self.connections.len() {
            let Some(message) = recv_until(&mut rx, deadline).await else {
                break;
            };
            match message {
                Ok(Message::OperationResponse(resp)) => responses.push(resp),
                Ok(other) => tracing::warn!(?other, "unexpected reply to operation request"),
                Err(err) => tracing::debug!(error = %err, "peer failed during operation"),
            }
        }
        responses
    }

    /// Keep only responses for the highest observed view, which becomes the
    /// caller's new view hint. Responses older than the current hint mean
    /// the whole batch was stale.
    fn matching_view_responses(
        &self,
        responses: Vec<OperationResponse>,
    ) -> Result<(ViewId, Vec<OperationResponse>), QuorumError> {
        let hint = self.current_view_id();
        let target = responses.iter().map(|r| r.view_id).max().unwrap_or(hint);
        if target < hint {
            return Err(QuorumError::StaleView {
                latest_view: target,
            });
        }
        self.observe_view(target);
        let matching = responses
            .into_iter()
            .filter(|resp| resp.view_id == target)
            .collect();
        Ok((target, matching))
    }

    fn observe_view(&self, view_id: ViewId) {
        self.current_view_id.fetch_max(view_id, Ordering::Relaxed);
    }
}

/// Receive from `rx` with an absolute deadline. `None` means the deadline
/// passed or every sender is gone.
async fn recv_until<T>(rx: &mut mpsc::Receiver<T>, deadline: Instant) -> Option<T> {
    match tokio::time::timeout_at(deadline, rx.recv()).await {
        Ok(item) => item,
        Err(_) => None,
    }
}

/// Count candidate results by their serialized form. The map key is the
/// serialization, so iteration order doubles as the deterministic tie-break.
fn tally(candidates: &[OperationResponse]) -> BTreeMap<String, (OpResult, usize)> {
    let mut counts: BTreeMap<String, (OpResult, usize)> = BTreeMap::new();
    for candidate in candidates {
        let result = OpResult {
            success: candidate.success,
            read_values: candidate.read_values.clone(),
        };
        let key = serde_json::to_string(&result).unwrap_or_default();
        let entry = counts.entry(key).or_insert((result, 0));
        entry.1 += 1;
    }
    counts
}

/// The most common result among the candidates and how many agree with it.
fn modal_result(candidates: &[OperationResponse]) -> (OpResult, usize) {
    let mut best: Option<(OpResult, usize)> = None;
    for (result, count) in tally(candidates).into_values() {
        // Ascending key order means a tie keeps the smaller serialization.
        if best.as_ref().is_none_or(|(_, best_count)| count > *best_count) {
            best = Some((result, count));
        }
    }
    best.unwrap_or_default()
}

/// Pick a single result from conflicting candidates: majority wins, ties go
/// to the lexicographically smallest serialized form so every client decides
/// identically.
fn decide(candidates: &[OperationResponse]) -> OpResult {
    modal_result(candidates).0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(success: bool, view_id: ViewId, pairs: &[(&str, &str)]) -> OperationResponse {
        OperationResponse {
            success,
            view_id,
            read_values: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn decide_picks_the_majority_result() {
        let candidates = vec![
            response(true, 1, &[("a", "1")]),
            response(true, 1, &[("a", "1")]),
            response(false, 1, &[]),
        ];
        let decision = decide(&candidates);
        assert!(decision.success);
        assert_eq!(decision.read_values["a"], "1");
    }

    #[test]
    fn decide_breaks_ties_deterministically() {
        let forward = vec![
            response(true, 1, &[("a", "1")]),
            response(true, 1, &[("a", "2")]),
        ];
        let reversed: Vec<_> = forward.iter().rev().cloned().collect();
        assert_eq!(decide(&forward), decide(&reversed));
    }

    #[test]
    fn modal_result_counts_agreement() {
        let candidates = vec![
            response(true, 1, &[("a", "1")]),
            response(true, 1, &[("a", "1")]),
            response(true, 1, &[("a", "2")]),
        ];
        let (result, agreeing) = modal_result(&candidates);
        assert_eq!(agreeing, 2);
        assert_eq!(result.read_values["a"], "1");
    }

    #[test]
    fn stale_batches_are_rejected_with_the_latest_view() {
        let coordinator = Coordinator::new(Vec::new(), "c".into(), 3, Duration::from_secs(1));
        coordinator.observe_view(4);

        let stale = vec![response(true, 3, &[]), response(true, 3, &[])];
        match coordinator.matching_view_responses(stale) {
            Err(QuorumError::StaleView { latest_view }) => assert_eq!(latest_view, 3),
            other => panic!("expected StaleView, got {other:?}"),
        }
    }

    #[test]
    fn responses_for_older_views_are_discarded() {
        let coordinator = Coordinator::new(Vec::new(), "c".into(), 3, Duration::from_secs(1));
        coordinator.observe_view(4);

        let mixed = vec![
            response(true, 3, &[]),
            response(true, 4, &[("a", "1")]),
            response(true, 4, &[("a", "1")]),
        ];
        let (view_id, matching) = coordinator.matching_view_responses(mixed).unwrap();
        assert_eq!(view_id, 4);
        assert_eq!(matching.len(), 2);
        assert_eq!(coordinator.current_view_id(), 4);
    }

    #[test]
    fn the_view_hint_follows_the_highest_observed_view() {
        let coordinator = Coordinator::new(Vec::new(), "c".into(), 3, Duration::from_secs(1));
        let responses = vec![response(true, 2, &[]), response(true, 5, &[])];
        let (view_id, matching) = coordinator.matching_view_responses(responses).unwrap();
        assert_eq!(view_id, 5);
        assert_eq!(matching.len(), 1);
        assert_eq!(coordinator.current_view_id(), 5);
    }
}
