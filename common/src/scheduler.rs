//! Bounded-concurrency execution of transfer tasks

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::Error;
use crate::progress::Progress;
use crate::report::{TransferResult, TransferTask};
use crate::retry::{self, RetryPolicy};
use crate::session::SessionManager;
use crate::transfer;

pub struct Scheduler {
    sessions: Arc<SessionManager>,
    policy: RetryPolicy,
    settings: transfer::Settings,
    cancel: CancellationToken,
    progress: &'static Progress,
}

impl Scheduler {
    pub fn new(
        sessions: Arc<SessionManager>,
        policy: RetryPolicy,
        settings: transfer::Settings,
        cancel: CancellationToken,
        progress: &'static Progress,
    ) -> Self {
        Self {
            sessions,
            policy,
            settings,
            cancel,
            progress,
        }
    }

    /// Runs every task, at most `concurrency_limit` at a time.
    ///
    /// A task first waits for its server's turn (one transfer per server) and only then for a
    /// global slot, so slots are never held by tasks queued behind a busy server.
    ///
    /// Returns exactly one result per task, in completion order. A failing task never affects its
    /// siblings; once cancellation is requested tasks that have not started are reported as
    /// cancelled.
    #[instrument(skip_all, fields(tasks = tasks.len(), limit = concurrency_limit))]
    pub async fn run(
        &self,
        tasks: Vec<TransferTask>,
        concurrency_limit: usize,
    ) -> Vec<TransferResult> {
        let total = tasks.len();
        let bytes: u64 = tasks.iter().map(|task| task.file.size).sum();
        self.progress.add_tasks(total as u64, bytes);
        tracing::info!(
            "downloading {} file(s), {} in total, {} at a time",
            total,
            bytesize::ByteSize(bytes),
            concurrency_limit
        );
        let slots = Arc::new(throttle::Limiter::new(concurrency_limit.max(1)));
        let mut turns: HashMap<String, Arc<throttle::Limiter>> = HashMap::new();
        let mut join_set = tokio::task::JoinSet::new();
        // copies of running tasks, to report tasks whose worker died
        let mut running = HashMap::with_capacity(total);
        for task in tasks {
            let copy = task.clone();
            let slots = slots.clone();
            let turn = turns
                .entry(task.file.server.clone())
                .or_insert_with(|| Arc::new(throttle::Limiter::new(1)))
                .clone();
            let sessions = self.sessions.clone();
            let policy = self.policy;
            let settings = self.settings;
            let cancel = self.cancel.clone();
            let progress = self.progress;
            let handle = join_set.spawn(async move {
                let _turn = turn.acquire().await;
                let _slot = slots.acquire().await;
                if cancel.is_cancelled() {
                    progress.files_failed.inc();
                    return task.abandon(&Error::Cancelled);
                }
                let _active = progress.active.enter();
                retry::run(task, &sessions, &policy, &settings, &cancel, progress).await
            });
            running.insert(handle.id(), copy);
        }
        let mut results = Vec::with_capacity(total);
        while let Some(joined) = join_set.join_next_with_id().await {
            let result = match joined {
                Ok((id, result)) => {
                    running.remove(&id);
                    result
                }
                Err(err) => {
                    let Some(task) = running.remove(&err.id()) else {
                        tracing::error!("lost track of a failed transfer worker: {err}");
                        continue;
                    };
                    tracing::error!("transfer worker for '{}' failed: {err}", task.file.path);
                    self.progress.files_failed.inc();
                    task.abandon(&Error::Protocol(format!("transfer worker failed: {err}")))
                }
            };
            results.push(result);
            tracing::debug!("{}/{} transfers finished", results.len(), total);
        }
        tracing::info!(
            "transfers finished, peak concurrency {}",
            self.progress.active.peak()
        );
        results
    }
}
