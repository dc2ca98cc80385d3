//! Runtime knobs: protocol timing plus fault-injection drop counters.
//!
//! Drop counters use a single compare-and-decrement-if-positive step, so two
//! tasks can never observe a transiently negative counter. Mutations arrive
//! as [`KnobCommand`] messages applied by one owning task; every other task
//! only ever reads.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Shared runtime properties. Reads are lock-free; writes go through the
/// knob task spawned by [`spawn_knob_task`].
pub struct Knobs {
    latency_ms: AtomicU64,
    timeout_ms: AtomicU64,
    view_change_period_ms: AtomicU64,
    drop_ping: AtomicI64,
    drop_replica: AtomicI64,
    drop_client: AtomicI64,
}

impl Knobs {
    pub fn new(timeout: Duration, view_change_period: Duration) -> Self {
        Self {
            latency_ms: AtomicU64::new(0),
            timeout_ms: AtomicU64::new(timeout.as_millis() as u64),
            view_change_period_ms: AtomicU64::new(view_change_period.as_millis() as u64),
            drop_ping: AtomicI64::new(0),
            drop_replica: AtomicI64::new(0),
            drop_client: AtomicI64::new(0),
        }
    }

    /// Artificial delay applied before handling an incoming request.
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms.load(Ordering::Relaxed))
    }

    /// Peer-reachability and batch-quorum timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    /// How long a view may age before the protocol loop evaluates a change.
    /// A zero period is a configuration bug, not a protocol condition.
    pub fn view_change_period(&self) -> Duration {
        let ms = self.view_change_period_ms.load(Ordering::Relaxed);
        if ms == 0 {
            panic!("view change period must be nonzero");
        }
        Duration::from_millis(ms)
    }

    /// True if the next ping should be dropped.
    pub fn take_drop_ping(&self) -> bool {
        take(&self.drop_ping)
    }

    /// True if the next replica-to-replica message should be dropped.
    pub fn take_drop_replica(&self) -> bool {
        take(&self.drop_replica)
    }

    /// True if the next client request should be dropped.
    pub fn take_drop_client(&self) -> bool {
        take(&self.drop_client)
    }

    pub fn snapshot(&self) -> KnobsSnapshot {
        KnobsSnapshot {
            latency: self.latency(),
            timeout: self.timeout(),
            view_change_period: Duration::from_millis(
                self.view_change_period_ms.load(Ordering::Relaxed),
            ),
            drop_ping: self.drop_ping.load(Ordering::Relaxed),
            drop_replica: self.drop_replica.load(Ordering::Relaxed),
            drop_client: self.drop_client.load(Ordering::Relaxed),
        }
    }

    fn apply(&self, command: KnobCommand) {
        match command {
            KnobCommand::SetLatency(value) => self
                .latency_ms
                .store(value.as_millis() as u64, Ordering::Relaxed),
            KnobCommand::SetTimeout(value) => self
                .timeout_ms
                .store(value.as_millis() as u64, Ordering::Relaxed),
            KnobCommand::SetViewChangePeriod(value) => self
                .view_change_period_ms
                .store(value.as_millis() as u64, Ordering::Relaxed),
            KnobCommand::AddDropPing(n) => {
                self.drop_ping.fetch_add(n, Ordering::AcqRel);
            }
            KnobCommand::AddDropReplica(n) => {
                self.drop_replica.fetch_add(n, Ordering::AcqRel);
            }
            KnobCommand::AddDropClient(n) => {
                self.drop_client.fetch_add(n, Ordering::AcqRel);
            }
        }
    }
}

/// Decrement `counter` only while it is positive. The whole step is one
/// atomic update, so the counter never goes negative.
fn take(counter: &AtomicI64) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
            (value > 0).then(|| value - 1)
        })
        .is_ok()
}

/// Point-in-time view of the knobs for the `status` command.
#[derive(Clone, Copy, Debug)]
pub struct KnobsSnapshot {
    pub latency: Duration,
    pub timeout: Duration,
    pub view_change_period: Duration,
    pub drop_ping: i64,
    pub drop_replica: i64,
    pub drop_client: i64,
}

/// Operator commands that mutate the knobs.
#[derive(Clone, Copy, Debug)]
pub enum KnobCommand {
    SetLatency(Duration),
    SetTimeout(Duration),
    SetViewChangePeriod(Duration),
    AddDropPing(i64),
    AddDropReplica(i64),
    AddDropClient(i64),
}

/// Spawn the single task that owns knob mutations.
pub fn spawn_knob_task(
    knobs: Arc<Knobs>,
    mut commands: mpsc::Receiver<KnobCommand>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    tracing::debug!(?command, "applying knob command");
                    knobs.apply(command);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_counters_never_go_negative() {
        let knobs = Knobs::new(Duration::from_secs(5), Duration::from_secs(1));
        assert!(!knobs.take_drop_ping());

        knobs.apply(KnobCommand::AddDropPing(2));
        assert!(knobs.take_drop_ping());
        assert!(knobs.take_drop_ping());
        assert!(!knobs.take_drop_ping());
        assert_eq!(knobs.snapshot().drop_ping, 0);
    }

    #[test]
    fn concurrent_takes_consume_exactly_the_budget() {
        let knobs = Arc::new(Knobs::new(Duration::from_secs(5), Duration::from_secs(1)));
        knobs.apply(KnobCommand::AddDropReplica(50));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let knobs = knobs.clone();
            handles.push(std::thread::spawn(move || {
                let mut taken = 0i64;
                for _ in 0..20 {
                    if knobs.take_drop_replica() {
                        taken += 1;
                    }
                }
                taken
            }));
        }
        let total: i64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 50);
        assert_eq!(knobs.snapshot().drop_replica, 0);
    }

    #[test]
    #[should_panic(expected = "view change period must be nonzero")]
    fn zero_view_change_period_is_fatal() {
        let knobs = Knobs::new(Duration::from_secs(5), Duration::from_millis(0));
        let _ = knobs.view_change_period();
    }

    #[tokio::test]
    async fn knob_task_applies_commands() {
        let knobs = Arc::new(Knobs::new(Duration::from_secs(5), Duration::from_secs(1)));
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        spawn_knob_task(knobs.clone(), rx, cancel.clone());

        tx.send(KnobCommand::SetLatency(Duration::from_millis(25)))
            .await
            .unwrap();
        tx.send(KnobCommand::SetTimeout(Duration::from_millis(750)))
            .await
            .unwrap();

        // The owning task applies commands asynchronously; poll briefly.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let snapshot = knobs.snapshot();
            if snapshot.latency == Duration::from_millis(25)
                && snapshot.timeout == Duration::from_millis(750)
            {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "knobs never updated");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
    }
}
