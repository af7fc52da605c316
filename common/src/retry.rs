//! Retry with progressive backoff around single transfer attempts
//!
//! A recoverable failure (connect, protocol, timeout) discards the partial download, degrades the
//! server session so the next attempt starts on a fresh one, and waits `attempt * base_delay`
//! before trying again. Anything else ends the task right away.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::Error;
use crate::progress::Progress;
use crate::report::{TransferResult, TransferState, TransferTask};
use crate::session::SessionManager;
use crate::transfer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// Wait after the failure of the given 1-based attempt.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Runs one attempt on the blocking pool; returns the outcome and the bytes reported so far.
async fn attempt(
    sessions: &Arc<SessionManager>,
    task: &TransferTask,
    settings: transfer::Settings,
    cancel: &CancellationToken,
    progress: &'static Progress,
) -> (Result<u64, Error>, u64) {
    let mut lease = match sessions.lease(&task.file.server).await {
        Ok(lease) => lease,
        Err(err) => return (Err(err), 0),
    };
    let file = task.file.clone();
    let local_path = task.local_path.clone();
    let cancel = cancel.clone();
    let joined = tokio::task::spawn_blocking(move || {
        let mut reported = 0u64;
        let result = match lease.acquire() {
            Ok(session) => transfer::transfer(
                session,
                &file,
                &local_path,
                &settings,
                &cancel,
                &mut |done, _total| {
                    progress.add_bytes(done.saturating_sub(reported));
                    reported = done;
                },
            ),
            Err(err) => Err(err),
        };
        if let Some(err) = result.as_ref().err().filter(|err| err.is_recoverable()) {
            lease.mark_degraded(err);
        }
        (result, reported)
    })
    .await;
    match joined {
        Ok(outcome) => outcome,
        Err(err) => (
            Err(Error::Protocol(format!("transfer worker failed: {err}"))),
            0,
        ),
    }
}

/// Drives `task` to a terminal state.
#[instrument(skip_all, fields(server = %task.file.server, path = %task.file.path))]
pub async fn run(
    mut task: TransferTask,
    sessions: &Arc<SessionManager>,
    policy: &RetryPolicy,
    settings: &transfer::Settings,
    cancel: &CancellationToken,
    progress: &'static Progress,
) -> TransferResult {
    let started = Instant::now();
    task.state = TransferState::InProgress;
    let max_attempts = policy.max_attempts.max(1);
    loop {
        if cancel.is_cancelled() {
            task.state = TransferState::Failed((&Error::Cancelled).into());
            progress.files_failed.inc();
            break;
        }
        task.attempts += 1;
        let attempt_no = task.attempts;
        tracing::debug!(attempt = attempt_no, max_attempts, "starting attempt");
        let (result, reported) = attempt(sessions, &task, *settings, cancel, progress).await;
        match result {
            Ok(bytes) => {
                task.bytes = bytes;
                task.state = TransferState::Succeeded;
                progress.files_downloaded.inc();
                tracing::info!(
                    attempt = attempt_no,
                    max_attempts,
                    bytes,
                    "downloaded to {:?}",
                    task.local_path
                );
                break;
            }
            Err(err) => {
                progress.sub_bytes(reported);
                transfer::discard_partial(&task.local_path);
                let class = err.class();
                if err.is_recoverable() && attempt_no < max_attempts {
                    let delay = policy.delay_after(attempt_no);
                    progress.retries.inc();
                    tracing::warn!(
                        attempt = attempt_no,
                        max_attempts,
                        delay = %humantime::format_duration(delay),
                        class = %class,
                        "attempt failed, retrying: {err}"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => {
                            tracing::info!("cancelled during backoff");
                            task.state = TransferState::Failed((&Error::Cancelled).into());
                            progress.files_failed.inc();
                            break;
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                } else {
                    tracing::error!(
                        attempt = attempt_no,
                        max_attempts,
                        class = %class,
                        "giving up: {err}"
                    );
                    task.state = TransferState::Failed((&err).into());
                    progress.files_failed.inc();
                    break;
                }
            }
        }
    }
    task.into_result(started.elapsed())
}
