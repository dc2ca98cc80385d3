//! The IR replica engine: view, membership, peer tracking, and message
//! handling, plus the protocol loop that drives view changes.
//!
//! The view and the peer table live under one readers/writer lock. Handlers
//! take snapshots under the lock and perform all I/O outside it; the only
//! writers are peer add/remove, view-change acceptance, and view
//! installation.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use ripple_ir::record::{OpResult, Record, RecordEntry};
use ripple_ir::types::{Membership, OpMode, Operation, ReplicaId, ViewId};
use ripple_ir::view::{next_leader, View};

use crate::client::Coordinator;
use crate::conn::{ConnHandler, MessageHandler};
use crate::faults::Knobs;
use crate::message::{
    Hello, HelloKind, HelloResponse, MasterRecord, Message, OperationRequest, OperationResponse,
    ViewChangeRequest, ViewChangeResponse,
};
use crate::storage::{BucketStore, StorageError};

/// Per-peer tracking: the live connection plus the last view it reported.
/// Not identical to the membership set; unclassified peers may appear here
/// and unreachable members may be missing.
struct PeerTracker {
    conn: Arc<ConnHandler>,
    view_id: ViewId,
}

struct EngineState {
    view: View,
    peers: HashMap<ReplicaId, PeerTracker>,
}

/// Row reported by the `peers` operator command.
pub struct PeerStatus {
    pub id: ReplicaId,
    pub addr: SocketAddr,
    pub view_id: ViewId,
    pub reachable: bool,
}

pub struct ReplicationEngine {
    self_id: ReplicaId,
    knobs: Arc<Knobs>,
    store: Arc<BucketStore>,
    state: RwLock<EngineState>,
    request_timeout: Duration,
    cancel: CancellationToken,
}

impl ReplicationEngine {
    pub fn new(
        self_id: ReplicaId,
        members: Vec<ReplicaId>,
        store: Arc<BucketStore>,
        knobs: Arc<Knobs>,
        request_timeout: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let members = Membership::new(members);
        tracing::info!(
            self_id = %self_id,
            members = members.len(),
            "initialized replication engine"
        );
        Arc::new(Self {
            self_id,
            knobs,
            store,
            state: RwLock::new(EngineState {
                view: View::initial(members),
                peers: HashMap::new(),
            }),
            request_timeout,
            cancel,
        })
    }

    /// Dial the configured members and start the protocol loop.
    pub async fn start(self: &Arc<Self>) {
        self.connect_to_members().await;
        let engine = self.clone();
        tokio::spawn(async move {
            engine.protocol_loop().await;
        });
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn current_view_id(&self) -> ViewId {
        self.state.read().unwrap().view.view_id
    }

    pub fn view_snapshot(&self) -> View {
        self.state.read().unwrap().view.clone()
    }

    /// The hello reply every handshake gets: the current view snapshot.
    pub fn hello_response(&self) -> HelloResponse {
        let state = self.state.read().unwrap();
        HelloResponse {
            view_id: state.view.view_id,
            members: state.view.members.to_vec(),
            leader: state.view.leader.clone(),
        }
    }

    pub fn peers_snapshot(&self) -> Vec<PeerStatus> {
        let timeout = self.knobs.timeout();
        let state = self.state.read().unwrap();
        let mut peers: Vec<PeerStatus> = state
            .peers
            .iter()
            .map(|(id, peer)| PeerStatus {
                id: id.clone(),
                addr: peer.conn.peer_addr(),
                view_id: peer.view_id,
                reachable: peer.conn.last_message_age() <= timeout,
            })
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Track (or replace) a peer connection under its declared identity.
    pub fn add_peer(self: &Arc<Self>, id: ReplicaId, conn: Arc<ConnHandler>, view_id: ViewId) {
        let previous = {
            let mut state = self.state.write().unwrap();
            state.peers.insert(id.clone(), PeerTracker { conn: conn.clone(), view_id })
        };
        // Close a replaced connection outside the lock; its shutdown hook
        // no longer matches the tracked connection, so the new entry stays.
        if let Some(previous) = previous {
            previous.conn.close();
        }
        self.install_peer_shutdown_hook(&id, &conn);
        // The connection may have died before the hook was in place.
        if conn.is_terminated() {
            self.remove_peer_conn(&id, &conn);
        }
        tracing::info!(peer = %id, "tracking peer");
    }

    /// Drop a peer, but only if `conn` is still the tracked connection.
    fn remove_peer_conn(&self, id: &str, conn: &Arc<ConnHandler>) {
        let mut state = self.state.write().unwrap();
        let matches = state
            .peers
            .get(id)
            .is_some_and(|peer| Arc::ptr_eq(&peer.conn, conn));
        if matches {
            state.peers.remove(id);
            tracing::info!(peer = %id, remaining = state.peers.len(), "removed peer");
        }
    }

    fn note_peer_view(&self, id: &str, view_id: ViewId) {
        let mut state = self.state.write().unwrap();
        if let Some(peer) = state.peers.get_mut(id) {
            peer.view_id = view_id;
        }
    }

    /// The shutdown hook captures only the peer's identity and a weak
    /// connection handle; removal resolves them through the table under the
    /// state lock, so no owning cycle exists between peer and connection.
    fn install_peer_shutdown_hook(self: &Arc<Self>, id: &str, conn: &Arc<ConnHandler>) {
        let engine = Arc::downgrade(self);
        let conn_ref = Arc::downgrade(conn);
        let id = id.to_string();
        conn.set_shutdown_hook(move || {
            if let (Some(engine), Some(conn)) = (engine.upgrade(), conn_ref.upgrade()) {
                engine.remove_peer_conn(&id, &conn);
            }
        });
    }

    /// Handler installed on connections classified as replica peers.
    pub fn peer_handler(self: &Arc<Self>, peer: ReplicaId) -> MessageHandler {
        let engine = Arc::downgrade(self);
        Arc::new(move |conn, request_id, message| {
            let engine = engine.clone();
            let peer = peer.clone();
            Box::pin(async move {
                if let Some(engine) = engine.upgrade() {
                    engine
                        .handle_peer_message(&peer, conn, request_id, message)
                        .await;
                }
            })
        })
    }

    pub async fn handle_peer_message(
        self: &Arc<Self>,
        peer: &str,
        conn: Arc<ConnHandler>,
        request_id: Option<String>,
        message: Message,
    ) {
        if self.knobs.take_drop_replica() {
            tracing::trace!(peer = %peer, "dropping replica message");
            return;
        }
        let latency = self.knobs.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match message {
            Message::Ping(n) => {
                if self.knobs.take_drop_ping() {
                    tracing::trace!(peer = %peer, "dropping ping");
                    return;
                }
                if let Err(err) = conn.send_untracked(request_id, Message::Pong(n)).await {
                    tracing::warn!(peer = %peer, error = %err, "failed to send pong");
                }
            }
            Message::Hello(hello) => {
                let response = self.hello_response();
                let local_view = response.view_id;
                if let Err(err) = conn
                    .send_untracked(request_id, Message::HelloResponse(response))
                    .await
                {
                    tracing::warn!(peer = %peer, error = %err, "failed to send hello response");
                    conn.close();
                    return;
                }
                if hello.kind == HelloKind::Server {
                    self.note_peer_view(peer, hello.view_id);
                    if hello.view_id > local_view {
                        // The peer is ahead of us; ask it to bring us up to
                        // date by presenting our (stale) view.
                        let engine = self.clone();
                        tokio::spawn(async move {
                            engine.catch_up(conn).await;
                        });
                    } else if hello.view_id < local_view {
                        self.push_master_record(&conn).await;
                    }
                }
            }
            Message::OperationRequest(request) => {
                let response = self.handle_operation(&request);
                if let Err(err) = conn
                    .send_untracked(request_id, Message::OperationResponse(response))
                    .await
                {
                    tracing::warn!(peer = %peer, error = %err, "failed to send operation response");
                }
            }
            Message::ViewChangeRequest(request) => {
                let response = self.handle_view_change(&request);
                if let Err(err) = conn
                    .send_untracked(request_id, Message::ViewChangeResponse(response))
                    .await
                {
                    tracing::warn!(peer = %peer, error = %err, "failed to send view change response");
                }
            }
            Message::MasterRecord(record) => self.apply_master_record(record),
            // Pings are tracked requests, so pongs land in pending slots.
            Message::Pong(_) => {
                tracing::warn!(peer = %peer, "unsolicited pong");
            }
            other => {
                tracing::warn!(peer = %peer, ?other, "unhandled peer message");
            }
        }
    }

    /// Execute a client operation and keep the record in step with it.
    /// Inconsistent operations finalize as soon as they execute; consensus
    /// operations stay tentative until the coordinator's decision arrives.
    pub fn handle_operation(&self, request: &OperationRequest) -> OperationResponse {
        let view_id = self.current_view_id();
        let mut response = OperationResponse {
            success: true,
            view_id,
            read_values: BTreeMap::new(),
        };

        if let Some(op) = &request.propose {
            // The entry goes in TENTATIVE before the operation executes.
            let mut entry = RecordEntry::tentative(op.clone(), None);
            if let Err(err) = self.store.save_record_entry(&request.transaction_id, &entry) {
                tracing::warn!(
                    transaction = %request.transaction_id,
                    error = %err,
                    "failed to persist tentative record entry"
                );
            }

            let local = match self.execute_op(&request.client_id, op) {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!(
                        transaction = %request.transaction_id,
                        error = %err,
                        "operation execution failed"
                    );
                    response.success = false;
                    return response;
                }
            };

            entry.local_result = Some(local.clone());
            if request.mode == OpMode::Inconsistent {
                entry.phase = ripple_ir::record::RecordPhase::Finalized;
            }
            if let Err(err) = self.store.save_record_entry(&request.transaction_id, &entry) {
                tracing::warn!(
                    transaction = %request.transaction_id,
                    error = %err,
                    "failed to persist record entry"
                );
            }

            response.success = local.success;
            response.read_values = local.read_values;
        }

        if let Some(finalize) = &request.finalize {
            if let Err(err) = self.finalize_op(&request.transaction_id, finalize) {
                tracing::warn!(
                    transaction = %request.transaction_id,
                    error = %err,
                    "failed to finalize operation"
                );
                response.success = false;
            }
        }

        response
    }

    /// Run one operation inside a storage transaction: reads populate the
    /// read values, CAS writes validate against them, and all writes commit
    /// together. A CAS mismatch rolls back and reports `success = false`.
    fn execute_op(&self, client_id: &str, op: &Operation) -> Result<OpResult, StorageError> {
        let tx = self.store.begin(client_id);
        let result = (|| {
            let mut read_values = BTreeMap::new();
            for key in &op.read_set {
                read_values.insert(key.clone(), self.store.get(&tx, key)?);
            }

            for (key, cas) in &op.write_cset {
                let current = match read_values.get(key) {
                    Some(value) => value.clone(),
                    None => self.store.get(&tx, key)?,
                };
                if current != cas.previous {
                    self.store.rollback(&tx)?;
                    return Ok(OpResult {
                        success: false,
                        read_values,
                    });
                }
            }

            for (key, value) in &op.write_set {
                self.store.put(&tx, key, value)?;
            }
            for (key, cas) in &op.write_cset {
                self.store.put(&tx, key, &cas.proposed)?;
            }
            self.store.commit(&tx)?;
            Ok(OpResult {
                success: true,
                read_values,
            })
        })();
        if result.is_err() {
            let _ = self.store.rollback(&tx);
        }
        result
    }

    /// Apply a coordinator's consensus decision. An empty finalize op is an
    /// abort; anything else applies its writes unconditionally.
    fn finalize_op(&self, transaction_id: &str, finalize: &Operation) -> Result<(), StorageError> {
        let success = !(finalize.write_set.is_empty() && finalize.write_cset.is_empty());
        if success {
            self.store.apply_writes(finalize.effective_writes())?;
        }
        let mut entry = self
            .store
            .load_record_entry(transaction_id)?
            .unwrap_or_else(|| RecordEntry::tentative(finalize.clone(), None));
        entry.phase = ripple_ir::record::RecordPhase::Finalized;
        entry.consensus_result = Some(OpResult {
            success,
            read_values: BTreeMap::new(),
        });
        self.store.save_record_entry(transaction_id, &entry)
    }

    /// Accept a view-change proposal if it moves the view forward. The reply
    /// carries our record so the new leader can merge it.
    pub fn handle_view_change(&self, request: &ViewChangeRequest) -> ViewChangeResponse {
        let (accepted, view_id, members) = {
            let mut state = self.state.write().unwrap();
            if request.view_id > state.view.view_id {
                let proposed = Membership::new(request.members.clone());
                state.view = state.view.begin_change(request.view_id, proposed);
                tracing::info!(
                    view_id = request.view_id,
                    "accepted view change proposal"
                );
                (true, state.view.view_id, state.view.members.to_vec())
            } else {
                (false, state.view.view_id, state.view.members.to_vec())
            }
        };

        let record = if accepted {
            match self.store.load_record() {
                Ok(record) => record.into_entries(),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to load record for view change");
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        ViewChangeResponse {
            view_id,
            members,
            record,
        }
    }

    /// Synchronize from a leader's master record and install its view.
    pub fn apply_master_record(&self, master: MasterRecord) {
        {
            let state = self.state.read().unwrap();
            if master.view_id < state.view.view_id {
                tracing::debug!(
                    view_id = master.view_id,
                    local = state.view.view_id,
                    "ignoring stale master record"
                );
                return;
            }
        }

        let record = Record::from_entries(master.entries);
        if let Err(err) = self.sync_from_master(&record) {
            tracing::warn!(error = %err, "failed to sync from master record");
            return;
        }
        if let Err(err) = self.store.save_master_record(master.view_id, &record) {
            tracing::warn!(error = %err, "failed to persist master record");
        }

        let mut state = self.state.write().unwrap();
        if master.view_id >= state.view.view_id {
            state.view = View::installed(
                master.view_id,
                master.leader.clone(),
                Membership::new(master.members),
            );
            tracing::info!(
                view_id = master.view_id,
                leader = %master.leader,
                "installed view from master record"
            );
        }
    }

    /// Apply every finalized master entry we have not finalized ourselves,
    /// then adopt the master record as our own.
    fn sync_from_master(&self, master: &Record) -> Result<(), StorageError> {
        let local = self.store.load_record()?;
        let mut writes: Vec<(String, String)> = Vec::new();
        for (txn_id, entry) in master.iter() {
            if !entry.is_finalized() {
                continue;
            }
            if local.get(txn_id).is_some_and(|own| own.is_finalized()) {
                continue;
            }
            let succeeded = entry
                .effective_result()
                .map(|result| result.success)
                .unwrap_or(true);
            if succeeded {
                for (key, value) in entry.op.effective_writes() {
                    writes.push((key.clone(), value.clone()));
                }
            }
        }
        self.store.apply_writes(writes.iter().map(|(k, v)| (k, v)))?;
        self.store.replace_record(master)
    }

    /// Present our view to a peer that is ahead; its handler pushes back a
    /// master record which completes the catch-up.
    async fn catch_up(self: Arc<Self>, conn: Arc<ConnHandler>) {
        let hello = self.local_hello();
        match conn.send_request(Message::Hello(hello)).await {
            Ok(Message::HelloResponse(response)) => {
                tracing::debug!(view_id = response.view_id, "requested catch-up");
            }
            Ok(other) => tracing::warn!(?other, "unexpected catch-up reply"),
            Err(err) => tracing::warn!(error = %err, "catch-up request failed"),
        }
    }

    /// Send our stored master record to a peer that reported an older view.
    async fn push_master_record(&self, conn: &Arc<ConnHandler>) {
        let stored = match self.store.load_master_record() {
            Ok(Some(stored)) => stored,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(error = %err, "failed to load master record");
                return;
            }
        };
        let (view_id, record) = stored;
        let (leader, members) = {
            let state = self.state.read().unwrap();
            (state.view.leader.clone(), state.view.members.to_vec())
        };
        let message = Message::MasterRecord(MasterRecord {
            view_id,
            leader,
            members,
            entries: record.into_entries(),
        });
        if let Err(err) = conn.send_untracked(None, message).await {
            tracing::debug!(error = %err, "failed to push master record");
        }
    }

    fn local_hello(&self) -> Hello {
        let state = self.state.read().unwrap();
        Hello {
            kind: HelloKind::Server,
            id: self.self_id.clone(),
            members: state.view.members.to_vec(),
            view_id: state.view.view_id,
            leader: state.view.leader.clone(),
        }
    }

    /// Dial every configured member and run the hello handshake.
    async fn connect_to_members(self: &Arc<Self>) {
        let members = {
            let state = self.state.read().unwrap();
            state.view.members.to_vec()
        };
        for member in members {
            if member == self.self_id {
                continue;
            }
            match TcpStream::connect(member.as_str()).await {
                Ok(stream) => {
                    let Ok(addr) = stream.peer_addr() else {
                        continue;
                    };
                    let conn = ConnHandler::spawn(
                        stream,
                        addr,
                        self.peer_handler(member.clone()),
                        self.request_timeout,
                        &self.cancel,
                    );
                    tracing::info!(peer = %member, "connected to peer");
                    self.add_peer(member.clone(), conn.clone(), 0);
                    let engine = self.clone();
                    tokio::spawn(async move {
                        engine.peer_init(member, conn).await;
                    });
                }
                Err(err) => {
                    tracing::warn!(peer = %member, error = %err, "failed to connect to peer");
                }
            }
        }
    }

    /// Introduce ourselves on a fresh outbound peer connection.
    async fn peer_init(self: Arc<Self>, member: ReplicaId, conn: Arc<ConnHandler>) {
        let hello = self.local_hello();
        match conn.send_request(Message::Hello(hello)).await {
            Ok(Message::HelloResponse(response)) => {
                self.note_peer_view(&member, response.view_id);
                if response.view_id > self.current_view_id() {
                    tracing::info!(
                        peer = %member,
                        view_id = response.view_id,
                        "peer reports a newer view"
                    );
                    // Our hello already carried the stale view; the peer
                    // pushes its master record in response.
                }
            }
            Ok(other) => {
                tracing::warn!(peer = %member, ?other, "unexpected hello reply");
                conn.close();
            }
            Err(err) => {
                tracing::warn!(peer = %member, error = %err, "hello handshake failed");
                conn.close();
            }
        }
    }

    /// Evaluate `viewChangeNeeded` every period and propose when we are the
    /// deterministic next leader.
    async fn protocol_loop(self: Arc<Self>) {
        loop {
            let period = self.knobs.view_change_period();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {
                    if self.view_change_needed() && self.should_be_next_leader() {
                        self.propose_view_change().await;
                    }
                }
            }
        }
        tracing::debug!("protocol loop stopped");
    }

    /// A view change is needed once the view has aged past the period and
    /// membership differs from the reachable peer set. The peer table never
    /// contains this replica while the membership does, so with N > 1 the
    /// delta condition holds and every expired period proposes.
    fn view_change_needed(&self) -> bool {
        let period = self.knobs.view_change_period();
        let timeout = self.knobs.timeout();
        let state = self.state.read().unwrap();
        if state.view.since.elapsed() < period {
            return false;
        }
        let reachable: Vec<&ReplicaId> = state
            .peers
            .iter()
            .filter(|(_, peer)| peer.conn.last_message_age() <= timeout)
            .map(|(id, _)| id)
            .collect();
        let peers_are_members = state
            .view
            .members
            .iter()
            .all(|member| reachable.iter().any(|id| *id == member));
        let members_are_peers = reachable
            .iter()
            .all(|id| state.view.members.contains(id));
        !(peers_are_members && members_are_peers)
    }

    /// Deterministic, stateless election: the smallest id among ourselves
    /// and the reachable members proposes the next view.
    fn should_be_next_leader(&self) -> bool {
        let timeout = self.knobs.timeout();
        let state = self.state.read().unwrap();
        let reachable: Vec<&str> = state
            .view
            .members
            .iter()
            .filter(|member| {
                state
                    .peers
                    .get(*member)
                    .is_some_and(|peer| peer.conn.last_message_age() <= timeout)
            })
            .map(|member| member.as_str())
            .collect();
        next_leader(&self.self_id, reachable) == self.self_id
    }

    /// Advance the view, fan the proposal out as a client, and on quorum
    /// merge the collected records into a master record, synchronize the
    /// peers, and install the new view with ourselves as leader.
    async fn propose_view_change(self: &Arc<Self>) {
        let (target_view, proposed, cluster_size, peer_conns) = {
            let mut state = self.state.write().unwrap();
            let timeout = self.knobs.timeout();
            let mut live: Vec<ReplicaId> = state
                .peers
                .iter()
                .filter(|(_, peer)| peer.conn.last_message_age() <= timeout)
                .map(|(id, _)| id.clone())
                .collect();
            live.push(self.self_id.clone());
            let proposed = Membership::new(live);
            let cluster_size = state.view.members.len();
            let target_view = state.view.view_id + 1;
            state.view = state.view.begin_change(target_view, proposed.clone());
            let conns: Vec<Arc<ConnHandler>> =
                state.peers.values().map(|peer| peer.conn.clone()).collect();
            (target_view, proposed, cluster_size, conns)
        };

        tracing::info!(
            view_id = target_view,
            members = proposed.len(),
            "proposing view change"
        );
        let coordinator = Coordinator::new(
            peer_conns.clone(),
            self.self_id.clone(),
            cluster_size,
            self.knobs.timeout(),
        );
        let outcome = match coordinator
            .send_view_change_request(target_view, proposed.to_vec())
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(view_id = target_view, error = %err, "view change failed");
                return;
            }
        };
        if outcome.latest_view > target_view {
            tracing::warn!(
                view_id = target_view,
                latest = outcome.latest_view,
                "cluster is ahead; abandoning proposal"
            );
            return;
        }

        // Merge: our own record first, then everything the quorum returned.
        let mut records = Vec::with_capacity(outcome.records.len() + 1);
        match self.store.load_record() {
            Ok(own) => records.push(own),
            Err(err) => tracing::warn!(error = %err, "failed to load own record for merge"),
        }
        records.extend(outcome.records);
        let master = Record::merge(records);

        if let Err(err) = self.sync_from_master(&master) {
            tracing::warn!(error = %err, "failed to apply master record locally");
            return;
        }
        if let Err(err) = self.store.save_master_record(target_view, &master) {
            tracing::warn!(error = %err, "failed to persist master record");
        }

        let notification = Message::MasterRecord(MasterRecord {
            view_id: target_view,
            leader: self.self_id.clone(),
            members: proposed.to_vec(),
            entries: master.into_entries(),
        });
        for conn in peer_conns {
            let notification = notification.clone();
            tokio::spawn(async move {
                if let Err(err) = conn.send_untracked(None, notification).await {
                    tracing::debug!(peer = %conn.peer_addr(), error = %err, "sync notification failed");
                }
            });
        }

        let mut state = self.state.write().unwrap();
        state.view = View::installed(target_view, self.self_id.clone(), proposed);
        tracing::info!(view_id = target_view, "view change complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_ir::record::RecordPhase;
    use ripple_ir::types::CasWrite;

    fn test_engine(members: &[&str]) -> (tempfile::TempDir, Arc<ReplicationEngine>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BucketStore::open(dir.path()).unwrap());
        let knobs = Arc::new(Knobs::new(
            Duration::from_secs(5),
            Duration::from_secs(1),
        ));
        let engine = ReplicationEngine::new(
            "127.0.0.1:7001".to_string(),
            members.iter().map(|m| m.to_string()).collect(),
            store,
            knobs,
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        (dir, engine)
    }

    fn put_request(transaction_id: &str, key: &str, value: &str) -> OperationRequest {
        OperationRequest {
            mode: OpMode::Inconsistent,
            client_id: "client-1".into(),
            transaction_id: transaction_id.into(),
            propose: Some(Operation {
                read_set: Vec::new(),
                write_set: BTreeMap::from([(key.to_string(), value.to_string())]),
                write_cset: BTreeMap::new(),
            }),
            finalize: None,
        }
    }

    #[test]
    fn inconsistent_writes_execute_and_finalize() {
        let (_dir, engine) = test_engine(&["127.0.0.1:7001"]);

        let response = engine.handle_operation(&put_request("txn-1", "a", "1"));
        assert!(response.success);
        assert_eq!(response.view_id, 0);

        let record = engine.store.load_record().unwrap();
        let entry = record.get("txn-1").unwrap();
        assert_eq!(entry.phase, RecordPhase::Finalized);
        assert!(entry.local_result.as_ref().unwrap().success);
        assert_eq!(engine.store.read_committed("a").unwrap(), "1");
    }

    #[test]
    fn reads_return_the_committed_values() {
        let (_dir, engine) = test_engine(&["127.0.0.1:7001"]);
        engine.handle_operation(&put_request("txn-1", "a", "1"));

        let request = OperationRequest {
            mode: OpMode::Inconsistent,
            client_id: "client-1".into(),
            transaction_id: "txn-2".into(),
            propose: Some(Operation {
                read_set: vec!["a".into(), "missing".into()],
                write_set: BTreeMap::new(),
                write_cset: BTreeMap::new(),
            }),
            finalize: None,
        };
        let response = engine.handle_operation(&request);
        assert!(response.success);
        assert_eq!(response.read_values["a"], "1");
        assert_eq!(response.read_values["missing"], "");
    }

    #[test]
    fn conflicting_cas_writes_surface_as_failure() {
        let (_dir, engine) = test_engine(&["127.0.0.1:7001"]);

        let cas = |txn: &str, previous: &str, proposed: &str| OperationRequest {
            mode: OpMode::Inconsistent,
            client_id: "client-1".into(),
            transaction_id: txn.into(),
            propose: Some(Operation {
                read_set: vec!["k".into()],
                write_set: BTreeMap::new(),
                write_cset: BTreeMap::from([(
                    "k".to_string(),
                    CasWrite {
                        previous: previous.to_string(),
                        proposed: proposed.to_string(),
                    },
                )]),
            }),
            finalize: None,
        };

        // Both clients observed the empty value; the first CAS wins.
        let first = engine.handle_operation(&cas("txn-1", "", "x"));
        assert!(first.success);
        let second = engine.handle_operation(&cas("txn-2", "", "y"));
        assert!(!second.success);
        assert_eq!(engine.store.read_committed("k").unwrap(), "x");
    }

    #[test]
    fn consensus_operations_stay_tentative_until_finalized() {
        let (_dir, engine) = test_engine(&["127.0.0.1:7001"]);

        let mut request = put_request("txn-1", "a", "1");
        request.mode = OpMode::Consensus;
        let response = engine.handle_operation(&request);
        assert!(response.success);

        let record = engine.store.load_record().unwrap();
        assert_eq!(record.get("txn-1").unwrap().phase, RecordPhase::Tentative);

        let finalize = OperationRequest {
            mode: OpMode::Consensus,
            client_id: "client-1".into(),
            transaction_id: "txn-1".into(),
            propose: None,
            finalize: request.propose.clone(),
        };
        let response = engine.handle_operation(&finalize);
        assert!(response.success);

        let record = engine.store.load_record().unwrap();
        let entry = record.get("txn-1").unwrap();
        assert_eq!(entry.phase, RecordPhase::Finalized);
        assert!(entry.consensus_result.as_ref().unwrap().success);
    }

    #[test]
    fn view_changes_only_move_forward() {
        let (_dir, engine) = test_engine(&["127.0.0.1:7001", "127.0.0.1:7002"]);

        let accepted = engine.handle_view_change(&ViewChangeRequest {
            view_id: 3,
            members: vec!["127.0.0.1:7001".into(), "127.0.0.1:7002".into()],
        });
        assert_eq!(accepted.view_id, 3);
        assert_eq!(engine.current_view_id(), 3);
        assert_eq!(engine.view_snapshot().state.label(), "VIEW-CHANGING");

        // An older or equal proposal is rejected with our current view.
        let rejected = engine.handle_view_change(&ViewChangeRequest {
            view_id: 2,
            members: Vec::new(),
        });
        assert_eq!(rejected.view_id, 3);
        assert_eq!(engine.current_view_id(), 3);
    }

    #[test]
    fn master_records_install_the_new_view_and_apply_writes() {
        let (_dir, engine) = test_engine(&["127.0.0.1:7001", "127.0.0.1:7002"]);

        let mut record = Record::default();
        record.add_tentative(
            "txn-1",
            Operation {
                read_set: Vec::new(),
                write_set: BTreeMap::from([("a".to_string(), "1".to_string())]),
                write_cset: BTreeMap::new(),
            },
            None,
        );
        record.finalize("txn-1", None).unwrap();

        engine.apply_master_record(MasterRecord {
            view_id: 2,
            leader: "127.0.0.1:7002".into(),
            members: vec!["127.0.0.1:7001".into(), "127.0.0.1:7002".into()],
            entries: record.clone().into_entries(),
        });

        let view = engine.view_snapshot();
        assert_eq!(view.view_id, 2);
        assert!(view.is_normal());
        assert_eq!(view.leader, "127.0.0.1:7002");
        assert_eq!(engine.store.read_committed("a").unwrap(), "1");
        assert_eq!(engine.store.load_record().unwrap(), record);

        // A stale master record is ignored.
        engine.apply_master_record(MasterRecord {
            view_id: 1,
            leader: "127.0.0.1:7001".into(),
            members: Vec::new(),
            entries: BTreeMap::new(),
        });
        assert_eq!(engine.current_view_id(), 2);
    }

    #[test]
    fn lone_replica_is_its_own_next_leader() {
        let (_dir, engine) = test_engine(&["127.0.0.1:7001", "127.0.0.1:7002"]);
        // No reachable peers: we sort alone and elect ourselves.
        assert!(engine.should_be_next_leader());
    }
}
