// ripple-store node binary entry point.
//
// Wires together the storage engine, the replication engine, the TCP
// listener, the fault-injection knobs, and the operator REPLs. Also hosts
// the embedded-node surface used by integration tests.

use std::io::IsTerminal;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub mod client;
pub mod conn;
pub mod faults;
pub mod gateway;
pub mod message;
pub mod repl;
pub mod replica;
pub mod storage;

use client::Coordinator;
use conn::MessageHandler;
use faults::{KnobCommand, Knobs};
use message::Message;
use replica::ReplicationEngine;
use storage::BucketStore;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "ripple-store")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run a replica connected to a cluster.
    Serve(ServeArgs),
    /// Run the interactive client against a cluster.
    Client(ClientArgs),
}

/// CLI options for running a replica.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Comma-separated cluster members, e.g. `127.0.0.1:7001,127.0.0.1:7002`.
    #[arg(long, short = 'c')]
    cluster: String,

    /// Port to listen on (0 picks an ephemeral port).
    #[arg(long, short = 'p', default_value_t = 0)]
    port: u16,

    /// Storage directory. Defaults to a fresh `<uuid>.db` directory.
    #[arg(long, short = 'f')]
    filepath: Option<PathBuf>,

    /// View change period (ms).
    #[arg(long, env = "RIPPLE_VIEW_CHANGE_PERIOD_MS", default_value_t = 1_000)]
    view_change_period_ms: u64,

    /// Peer reachability and batch quorum timeout (ms).
    #[arg(long, env = "RIPPLE_TIMEOUT_MS", default_value_t = 5_000)]
    timeout_ms: u64,

    /// Single-request timeout (ms).
    #[arg(long, env = "RIPPLE_REQUEST_TIMEOUT_MS", default_value_t = 5_000)]
    request_timeout_ms: u64,

    /// Disable the operator REPL on stdin (embedded and test nodes).
    #[arg(long)]
    no_repl: bool,
}

/// CLI options for running a client.
#[derive(Parser, Debug)]
pub struct ClientArgs {
    /// Comma-separated cluster members, e.g. `127.0.0.1:7001,127.0.0.1:7002`.
    #[arg(long, short = 'c')]
    cluster: String,

    /// Batch quorum timeout (ms).
    #[arg(long, env = "RIPPLE_TIMEOUT_MS", default_value_t = 5_000)]
    timeout_ms: u64,

    /// Single-request timeout (ms).
    #[arg(long, env = "RIPPLE_REQUEST_TIMEOUT_MS", default_value_t = 5_000)]
    request_timeout_ms: u64,
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Serve(args) => run_node(args).await,
        Command::Client(args) => run_client(args).await,
    }
}

/// A replica running inside this process.
pub struct EmbeddedNode {
    self_id: String,
    addr: SocketAddr,
    knob_tx: mpsc::Sender<KnobCommand>,
    cancel: CancellationToken,
    engine: Arc<ReplicationEngine>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl EmbeddedNode {
    /// The replica's membership identity (`host:port`).
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Loopback address clients can dial.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Operator knob channel, the programmatic equivalent of the REPL.
    pub fn knob_tx(&self) -> mpsc::Sender<KnobCommand> {
        self.knob_tx.clone()
    }

    pub fn engine(&self) -> Arc<ReplicationEngine> {
        self.engine.clone()
    }

    /// Resolves when the node stops on its own (REPL exit, fatal error).
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.cancel.cancel();
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(anyhow::anyhow!("node task join failed: {err}")),
        }
    }
}

/// Bind, wire up, and start a replica; returns once it is accepting
/// connections.
pub async fn spawn_embedded_node(args: ServeArgs) -> anyhow::Result<EmbeddedNode> {
    let members = parse_members(&args.cluster);
    anyhow::ensure!(!members.is_empty(), "cluster membership must not be empty");

    let data_path = args
        .filepath
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("{}.db", Uuid::new_v4())));
    let store = Arc::new(BucketStore::open(&data_path).context("open storage")?);

    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, args.port))
        .await
        .context("bind listener")?;
    let local = listener.local_addr().context("resolve listen address")?;
    let host = normalise_ip(local.ip())?;
    let self_id = format!("{host}:{}", local.port());
    let addr = SocketAddr::from(([127, 0, 0, 1], local.port()));

    let cancel = CancellationToken::new();
    let knobs = Arc::new(Knobs::new(
        Duration::from_millis(args.timeout_ms),
        Duration::from_millis(args.view_change_period_ms),
    ));
    let (knob_tx, knob_rx) = mpsc::channel(16);
    faults::spawn_knob_task(knobs.clone(), knob_rx, cancel.clone());

    let request_timeout = Duration::from_millis(args.request_timeout_ms);
    let engine = ReplicationEngine::new(
        self_id.clone(),
        members,
        store,
        knobs.clone(),
        request_timeout,
        cancel.clone(),
    );
    engine.start().await;
    tracing::info!(self_id = %self_id, "listening");

    if !args.no_repl {
        tokio::spawn(repl::server_repl(
            engine.clone(),
            knobs.clone(),
            knob_tx.clone(),
            cancel.clone(),
        ));
    }

    let task = tokio::spawn(gateway::run_listener(
        listener,
        engine.clone(),
        knobs,
        request_timeout,
        cancel.clone(),
    ));

    Ok(EmbeddedNode {
        self_id,
        addr,
        knob_tx,
        cancel,
        engine,
        task,
    })
}

/// Run a replica until ctrl-c.
pub async fn run_node(args: ServeArgs) -> anyhow::Result<()> {
    run_node_with_shutdown(args, tokio::signal::ctrl_c()).await
}

/// Run a replica until `shutdown` resolves or the node stops itself.
pub async fn run_node_with_shutdown<F>(args: ServeArgs, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = Result<(), std::io::Error>> + Send,
{
    let node = spawn_embedded_node(args).await?;
    tokio::select! {
        _ = shutdown => {}
        _ = node.cancelled() => {}
    }
    node.shutdown().await
}

/// Connect to the cluster and run the interactive client.
pub async fn run_client(args: ClientArgs) -> anyhow::Result<()> {
    let servers = parse_members(&args.cluster);
    anyhow::ensure!(!servers.is_empty(), "client requires at least one server");

    let cancel = CancellationToken::new();
    let coordinator = Coordinator::connect(
        &servers,
        client_handler(),
        Duration::from_millis(args.request_timeout_ms),
        Duration::from_millis(args.timeout_ms),
        &cancel,
    )
    .await
    .context("connect to cluster")?;
    tracing::debug!(client_id = %coordinator.client_id(), servers = servers.len(), "connected");

    repl::client_repl(Arc::new(coordinator), cancel.clone()).await;
    cancel.cancel();
    Ok(())
}

/// Clients answer pings and nothing else; every other frame they see is a
/// response matched to a pending request.
pub fn client_handler() -> MessageHandler {
    Arc::new(|conn, request_id, message| {
        Box::pin(async move {
            match message {
                Message::Ping(n) => {
                    if let Err(err) = conn.send_untracked(request_id, Message::Pong(n)).await {
                        tracing::warn!(error = %err, "failed to send pong");
                    }
                }
                other => {
                    tracing::warn!(?other, "client ignoring unexpected request");
                }
            }
        })
    })
}

/// Split a comma-separated cluster list into member identities.
fn parse_members(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|member| !member.is_empty())
        .map(str::to_string)
        .collect()
}

/// Binding to a loopback/unspecified address multi-homes the socket, but
/// membership identities must be a single comparable address.
fn normalise_ip(ip: IpAddr) -> anyhow::Result<String> {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_loopback() || v4.is_multicast() || v4.is_unspecified() {
                Ok("127.0.0.1".to_string())
            } else {
                Ok(v4.to_string())
            }
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_multicast() || v6.is_unspecified() {
                Ok("127.0.0.1".to_string())
            } else {
                anyhow::bail!("IPv6 listen address {v6} is not supported")
            }
        }
    }
}
