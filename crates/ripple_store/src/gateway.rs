//! Inbound connection handling.
//!
//! Connections are anonymous until their first frame. The provisional
//! handler serves clients directly; a `Hello{type=SERVER}` upgrades the
//! connection to a replica peer by registering it in the engine's peer table
//! and hot-swapping the handler, then re-dispatches the hello so the normal
//! reply path runs. Every inbound connection is also pinged once a second to
//! keep reachability fresh.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::conn::{ConnHandler, MessageHandler};
use crate::faults::Knobs;
use crate::message::{HelloKind, Message};
use crate::replica::ReplicationEngine;

const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Accept loop: every connection gets a classifier handler and a ping loop.
pub async fn run_listener(
    listener: TcpListener,
    engine: Arc<ReplicationEngine>,
    knobs: Arc<Knobs>,
    request_timeout: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (socket, addr) = accepted?;
                tracing::debug!(peer = %addr, "accepted connection");
                let conn = ConnHandler::spawn(
                    socket,
                    addr,
                    classifier_handler(&engine, &knobs),
                    request_timeout,
                    &cancel,
                );
                tokio::spawn(ping_loop(conn, cancel.clone()));
            }
        }
    }
}

/// Synchronous pings keep `last_message_time` fresh on both ends; a peer
/// that stops answering gets its connection torn down.
async fn ping_loop(conn: Arc<ConnHandler>, cancel: CancellationToken) {
    while !conn.is_terminated() {
        if let Err(err) = conn.send_request(Message::Ping(1)).await {
            tracing::debug!(peer = %conn.peer_addr(), error = %err, "ping failed");
            conn.close();
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(PING_INTERVAL) => {}
        }
    }
}

/// The provisional handler for not-yet-classified connections.
fn classifier_handler(engine: &Arc<ReplicationEngine>, knobs: &Arc<Knobs>) -> MessageHandler {
    let engine: Weak<ReplicationEngine> = Arc::downgrade(engine);
    let knobs = knobs.clone();
    Arc::new(move |conn, request_id, message| {
        let engine = engine.clone();
        let knobs = knobs.clone();
        Box::pin(async move {
            let Some(engine) = engine.upgrade() else {
                conn.close();
                return;
            };
            match message {
                Message::Ping(n) => {
                    if let Err(err) = conn.send_untracked(request_id, Message::Pong(n)).await {
                        tracing::warn!(peer = %conn.peer_addr(), error = %err, "failed to send pong");
                    }
                }
                // Pings are synchronous; a pong outside a pending slot is
                // a protocol violation.
                Message::Pong(_) => {
                    tracing::warn!(peer = %conn.peer_addr(), "unsolicited pong");
                }
                Message::Hello(hello) if hello.kind == HelloKind::Server => {
                    // Upgrade: track the peer under the identity it declared
                    // and rebind this connection to the replica handler.
                    let member_id = hello.id.clone();
                    engine.add_peer(member_id.clone(), conn.clone(), hello.view_id);
                    conn.set_handler(engine.peer_handler(member_id.clone()));
                    // Re-dispatch so the normal hello reply path runs.
                    engine
                        .handle_peer_message(&member_id, conn, request_id, Message::Hello(hello))
                        .await;
                }
                Message::Hello(_) => {
                    let response = engine.hello_response();
                    if let Err(err) = conn
                        .send_untracked(request_id, Message::HelloResponse(response))
                        .await
                    {
                        tracing::warn!(peer = %conn.peer_addr(), error = %err, "failed to send hello response");
                    }
                }
                Message::OperationRequest(request) => {
                    if knobs.take_drop_client() {
                        tracing::trace!(peer = %conn.peer_addr(), "dropping client request");
                        return;
                    }
                    let latency = knobs.latency();
                    if !latency.is_zero() {
                        tokio::time::sleep(latency).await;
                    }
                    let response = engine.handle_operation(&request);
                    if let Err(err) = conn
                        .send_untracked(request_id, Message::OperationResponse(response))
                        .await
                    {
                        tracing::warn!(peer = %conn.peer_addr(), error = %err, "failed to send operation response");
                    }
                }
                Message::ViewChangeRequest(request) => {
                    let response = engine.handle_view_change(&request);
                    if let Err(err) = conn
                        .send_untracked(request_id, Message::ViewChangeResponse(response))
                        .await
                    {
                        tracing::warn!(peer = %conn.peer_addr(), error = %err, "failed to send view change response");
                    }
                }
                Message::MasterRecord(record) => engine.apply_master_record(record),
                other => {
                    tracing::warn!(peer = %conn.peer_addr(), ?other, "unhandled request");
                }
            }
        })
    })
}
