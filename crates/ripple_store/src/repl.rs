//! Interactive stdin surfaces: the operator REPL on replicas and the
//! transactional REPL on clients.
//!
//! Knob mutations are sent as [`KnobCommand`] messages to the owning task;
//! the REPL itself only reads engine snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ripple_ir::types::CasWrite;

use crate::client::Coordinator;
use crate::faults::{KnobCommand, Knobs};
use crate::replica::ReplicationEngine;

/// Client-side transaction cache: reads observed and writes buffered until
/// commit compiles them into one CAS operation.
#[derive(Default)]
struct TxCache {
    read_set: BTreeMap<String, String>,
    write_set: BTreeMap<String, String>,
}

/// Operator REPL running on a replica.
pub async fn server_repl(
    engine: Arc<ReplicationEngine>,
    knobs: Arc<Knobs>,
    knob_tx: mpsc::Sender<KnobCommand>,
    cancel: CancellationToken,
) {
    println!("Operator console ready. Type 'help' for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    eprintln!("error reading input: {err}");
                    break;
                }
            },
        };
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            continue;
        };
        let args: Vec<&str> = parts.collect();
        match command.to_ascii_lowercase().as_str() {
            "latency" | "l" => {
                if let Some(ms) = parse_u64_arg(&args, "latency <ms>") {
                    let _ = knob_tx
                        .send(KnobCommand::SetLatency(Duration::from_millis(ms)))
                        .await;
                }
            }
            "view_change_period" => {
                if let Some(secs) = parse_u64_arg(&args, "view_change_period <s>") {
                    let _ = knob_tx
                        .send(KnobCommand::SetViewChangePeriod(Duration::from_secs(secs)))
                        .await;
                }
            }
            "timeout" => {
                if let Some(ms) = parse_u64_arg(&args, "timeout <ms>") {
                    let _ = knob_tx
                        .send(KnobCommand::SetTimeout(Duration::from_millis(ms)))
                        .await;
                }
            }
            "drop_ping" | "d" => {
                if let Some(n) = parse_u64_arg(&args, "drop_ping <n>") {
                    let _ = knob_tx.send(KnobCommand::AddDropPing(n as i64)).await;
                }
            }
            "drop_replica" | "r" => {
                if let Some(n) = parse_u64_arg(&args, "drop_replica <n>") {
                    let _ = knob_tx.send(KnobCommand::AddDropReplica(n as i64)).await;
                }
            }
            "drop_client" | "c" => {
                if let Some(n) = parse_u64_arg(&args, "drop_client <n>") {
                    let _ = knob_tx.send(KnobCommand::AddDropClient(n as i64)).await;
                }
            }
            "peers" => {
                for peer in engine.peers_snapshot() {
                    println!(
                        "{} addr={} view={} reachable={}",
                        peer.id, peer.addr, peer.view_id, peer.reachable
                    );
                }
            }
            "members" => {
                let view = engine.view_snapshot();
                for member in view.members.iter() {
                    println!("{member}");
                }
            }
            "status" => {
                let view = engine.view_snapshot();
                let snapshot = knobs.snapshot();
                println!(
                    "self={} view={} state={} leader={} members={} since={:?}",
                    engine.self_id(),
                    view.view_id,
                    view.state.label(),
                    if view.leader.is_empty() { "-" } else { &view.leader },
                    view.members.len(),
                    view.since.elapsed(),
                );
                println!(
                    "latency={:?} timeout={:?} view_change_period={:?} \
                     drop_ping={} drop_replica={} drop_client={}",
                    snapshot.latency,
                    snapshot.timeout,
                    snapshot.view_change_period,
                    snapshot.drop_ping,
                    snapshot.drop_replica,
                    snapshot.drop_client,
                );
            }
            "help" | "h" => {
                println!("Available commands:");
                println!("  latency, l <ms>: delay handling of incoming requests");
                println!("  view_change_period <s>: set the view change period");
                println!("  timeout <ms>: set the peer reachability/batch timeout");
                println!("  drop_ping, d <n>: drop the next n pings");
                println!("  drop_replica, r <n>: drop the next n replica messages");
                println!("  drop_client, c <n>: drop the next n client requests");
                println!("  peers: show the tracked peer table");
                println!("  members: show the current view membership");
                println!("  status: show view and knob state");
                println!("  exit, quit: stop the replica");
            }
            "exit" | "quit" => {
                println!("Shutting down.");
                cancel.cancel();
                break;
            }
            other => {
                println!("Unknown command '{other}'. Type 'help' for more information.");
            }
        }
    }
}

/// Interactive transactional client.
pub async fn client_repl(coordinator: Arc<Coordinator>, cancel: CancellationToken) {
    println!("Interactive client, type 'help' for a list of commands.");
    let mut transaction: Option<TxCache> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    eprintln!("error reading input: {err}");
                    break;
                }
            },
        };
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            continue;
        };
        let args: Vec<String> = parts.map(str::to_string).collect();
        match command.to_ascii_lowercase().as_str() {
            "start" | "s" | "begin" | "b" => {
                if transaction.is_some() {
                    println!("Abandoning previous transaction");
                }
                transaction = Some(TxCache::default());
            }
            "read" | "r" | "get" | "g" => {
                if args.is_empty() {
                    println!("Usage: read/r/get/g <key>...");
                    continue;
                }
                match coordinator.send_operation(args.clone(), BTreeMap::new()).await {
                    Ok(response) => {
                        for (key, value) in &response.read_values {
                            if let Some(tx) = transaction.as_mut() {
                                tx.read_set.insert(key.clone(), value.clone());
                            }
                            println!("{key}={value}");
                        }
                    }
                    Err(err) => println!("read failed: {err}"),
                }
            }
            "write" | "w" | "put" | "p" => {
                if args.len() < 2 {
                    println!("Usage: write/w/put/p <key> <value>");
                    continue;
                }
                let (key, value) = (args[0].clone(), args[1].clone());
                if let Some(tx) = transaction.as_mut() {
                    tx.write_set.insert(key, value);
                } else {
                    // No active transaction: standalone blind write.
                    let writes = BTreeMap::from([(
                        key,
                        CasWrite {
                            previous: String::new(),
                            proposed: value,
                        },
                    )]);
                    match coordinator.send_operation(Vec::new(), writes).await {
                        Ok(response) => println!("ok={}", response.success),
                        Err(err) => println!("write failed: {err}"),
                    }
                }
            }
            "commit" | "c" => {
                let Some(tx) = transaction.take() else {
                    continue;
                };
                // Reads become CAS guards for the keys they cover.
                let read_set: Vec<String> = tx.read_set.keys().cloned().collect();
                let writes: BTreeMap<String, CasWrite> = tx
                    .write_set
                    .into_iter()
                    .map(|(key, proposed)| {
                        let previous = tx.read_set.get(&key).cloned().unwrap_or_default();
                        (key, CasWrite { previous, proposed })
                    })
                    .collect();
                match coordinator.send_operation(read_set, writes).await {
                    Ok(response) => println!("committed={}", response.success),
                    Err(err) => println!("commit failed: {err}"),
                }
            }
            "cancel" | "end" | "e" | "rollback" => {
                transaction = None;
            }
            "help" | "h" => {
                println!("Available commands:");
                println!("  start/s/begin/b: start a new transaction");
                println!("  read/r/get/g <key>...: read keys");
                println!("  write/w/put/p <key> <value>: write a key/value pair");
                println!("  commit/c: commit the current transaction");
                println!("  cancel/end/e/rollback: discard the current transaction");
                println!("  exit: quit");
            }
            "exit" | "quit" => {
                cancel.cancel();
                break;
            }
            other => {
                println!("Unknown command '{other}'. Type 'help' for more information.");
            }
        }
    }
}

fn parse_u64_arg(args: &[&str], usage: &str) -> Option<u64> {
    let Some(raw) = args.first() else {
        println!("Usage: {usage}");
        return None;
    };
    match raw.parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            println!("Invalid value '{raw}'. Please enter a non-negative integer.");
            None
        }
    }
}
