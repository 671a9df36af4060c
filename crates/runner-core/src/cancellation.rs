//! Cancellation Core: converges three independent stop sources -- an
//! external kill message, TTL expiry, and runner shutdown -- onto the
//! single idempotent action of terminating the task's current subprocess,
//! and records *why* so the handler can classify the task afterward.
//!
//! A single coordinator task drains a command queue of {kill, interrupt,
//! ttl-expired, done}, the shape the spec's design notes ask for; the
//! `mpsc` channel feeding one consumer and the `CancellationToken` fanned
//! out to the System Monitor and Observer Manager mirror the reference's
//! `orchestrator/mod.rs`, which uses the same two primitives to fan
//! cancellation out to its own worker pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::executer::Executer;

const QUEUE_CAPACITY: usize = 8;

/// One entry in the coordinator's stop-source queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Kill,
    Interrupt,
    TtlExpired,
    Done,
}

/// Flags the handler reads once `executer.run()` returns, to classify the
/// task's final status. At most one is ever set: both branches only flip
/// their flag when `Executer::terminate` reports it was the call that
/// actually stopped something, and that call is itself compare-exchange
/// gated, so the first stop source to land wins.
#[derive(Default)]
pub struct CancellationFlags {
    task_killed: AtomicBool,
    ttl_exceeded: AtomicBool,
}

impl CancellationFlags {
    pub fn task_killed(&self) -> bool {
        self.task_killed.load(Ordering::SeqCst)
    }

    pub fn ttl_exceeded(&self) -> bool {
        self.ttl_exceeded.load(Ordering::SeqCst)
    }
}

/// Owns the coordinator task and, if the request carried a TTL, the
/// one-shot timer that expires it. Dropped via [`CancellationCore::finish`]
/// once the handler's executer has returned.
pub struct CancellationCore {
    tx: mpsc::Sender<StopSignal>,
    flags: Arc<CancellationFlags>,
    stop_token: CancellationToken,
    coordinator: JoinHandle<()>,
    ttl_timer: Option<JoinHandle<()>>,
}

impl CancellationCore {
    /// Spawn the coordinator consuming its own queue, and -- if `ttl` is
    /// set -- a one-shot timer that pushes `TtlExpired` when it fires.
    pub fn spawn(executer: Arc<Executer>, ttl: Option<Duration>) -> Self {
        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
        let flags = Arc::new(CancellationFlags::default());
        let stop_token = CancellationToken::new();

        let coordinator = {
            let flags = flags.clone();
            let stop_token = stop_token.clone();
            tokio::spawn(async move {
                while let Some(signal) = rx.recv().await {
                    match signal {
                        StopSignal::Kill => {
                            if executer.terminate().await.unwrap_or(false) {
                                flags.task_killed.store(true, Ordering::SeqCst);
                            }
                        }
                        StopSignal::Interrupt => {
                            if let Err(err) = executer.terminate().await {
                                tracing::warn!(%err, "interrupt failed to terminate subprocess");
                            }
                        }
                        StopSignal::TtlExpired => {
                            if executer.terminate().await.unwrap_or(false) {
                                flags.ttl_exceeded.store(true, Ordering::SeqCst);
                            }
                        }
                        StopSignal::Done => break,
                    }
                }
                stop_token.cancel();
            })
        };

        let ttl_timer = ttl.map(|duration| {
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                let _ = tx.send(StopSignal::TtlExpired).await;
            })
        });

        Self {
            tx,
            flags,
            stop_token,
            coordinator,
            ttl_timer,
        }
    }

    /// Sender any stop source (the Message Listener's forwarding task, a
    /// signal handler) can push onto.
    pub fn sender(&self) -> mpsc::Sender<StopSignal> {
        self.tx.clone()
    }

    /// Future the System Monitor and Observer Manager select against to
    /// end their periodic loops once the coordinator has drained to done.
    pub fn stop_signal(&self) -> impl std::future::Future<Output = ()> + 'static {
        let token = self.stop_token.clone();
        async move { token.cancelled().await }
    }

    pub fn flags(&self) -> Arc<CancellationFlags> {
        self.flags.clone()
    }

    /// Drain the coordinator to `done` and wait for it to exit, aborting
    /// the TTL timer first if it hasn't already fired.
    pub async fn finish(self) {
        if let Some(ttl_timer) = self.ttl_timer {
            ttl_timer.abort();
        }
        let _ = self.tx.send(StopSignal::Done).await;
        let _ = self.coordinator.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::arbitrary::ArbitraryCommandsBuilder;
    use crate::executer::{ExecuterConfig, ExecuterObserver};
    use crate::events::EventBody;
    use crate::mpi::MpiClusterConfig;

    struct NullObserver;
    impl ExecuterObserver for NullObserver {
        fn on_event(&self, _body: EventBody) {}
        fn on_command_changed(&self, _argv: &str) {}
    }

    fn executer() -> Arc<Executer> {
        let working_dir = tempfile::tempdir().unwrap().keep();
        std::fs::create_dir_all(working_dir.join("sim_dir")).unwrap();
        let config = ExecuterConfig {
            working_dir,
            container_image: std::path::PathBuf::from("/images/test.sif"),
            mpi_config: MpiClusterConfig::disabled(),
            extra_params: serde_json::json!({"sim_dir": "sim_dir", "commands": []}),
            local_mode: true,
            on_gpu: false,
        };
        Arc::new(
            Executer::new(config, Arc::new(ArbitraryCommandsBuilder), Arc::new(NullObserver)).unwrap(),
        )
    }

    #[tokio::test]
    async fn kill_signal_sets_task_killed_flag() {
        let core = CancellationCore::spawn(executer(), None);
        core.sender().send(StopSignal::Kill).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(core.flags().task_killed());
        assert!(!core.flags().ttl_exceeded());
        core.finish().await;
    }

    #[tokio::test]
    async fn ttl_expiry_sets_ttl_exceeded_flag_not_task_killed() {
        let core = CancellationCore::spawn(executer(), Some(Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(core.flags().ttl_exceeded());
        assert!(!core.flags().task_killed());
        core.finish().await;
    }

    #[tokio::test]
    async fn interrupt_sets_neither_flag() {
        let core = CancellationCore::spawn(executer(), None);
        core.sender().send(StopSignal::Interrupt).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!core.flags().task_killed());
        assert!(!core.flags().ttl_exceeded());
        core.finish().await;
    }

    #[tokio::test]
    async fn finish_cancels_the_stop_token() {
        let core = CancellationCore::spawn(executer(), None);
        let stop = core.stop_signal();
        core.finish().await;
        stop.await;
    }
}
