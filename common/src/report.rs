//! Transfer tasks, their results and the run report

use std::path::PathBuf;
use std::time::Duration;

use crate::discovery::RemoteFileRef;
use crate::error::{Error, ErrorClass};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReason {
    pub class: ErrorClass,
    pub message: String,
}

impl From<&Error> for FailureReason {
    fn from(err: &Error) -> Self {
        Self {
            class: err.class(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    InProgress,
    Succeeded,
    Failed(FailureReason),
}

impl TransferState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Succeeded | TransferState::Failed(_))
    }
}

/// One file to download, owned by exactly one worker at a time.
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub id: usize,
    pub file: RemoteFileRef,
    pub local_path: PathBuf,
    pub state: TransferState,
    pub bytes: u64,
    pub attempts: u32,
}

impl TransferTask {
    #[must_use]
    pub fn new(id: usize, file: RemoteFileRef, local_path: PathBuf) -> Self {
        Self {
            id,
            file,
            local_path,
            state: TransferState::Pending,
            bytes: 0,
            attempts: 0,
        }
    }

    /// Terminal record of the task; `state` must be terminal.
    #[must_use]
    pub fn into_result(self, elapsed: Duration) -> TransferResult {
        debug_assert!(self.state.is_terminal(), "task {} still {:?}", self.id, self.state);
        TransferResult {
            task_id: self.id,
            file: self.file,
            local_path: self.local_path,
            state: self.state,
            bytes: self.bytes,
            elapsed,
            attempts: self.attempts,
        }
    }

    /// Fails a task that never started, e.g. after cancellation.
    #[must_use]
    pub fn abandon(mut self, err: &Error) -> TransferResult {
        self.state = TransferState::Failed(err.into());
        self.into_result(Duration::ZERO)
    }
}

#[derive(Debug, Clone)]
pub struct TransferResult {
    pub task_id: usize,
    pub file: RemoteFileRef,
    pub local_path: PathBuf,
    pub state: TransferState,
    pub bytes: u64,
    pub elapsed: Duration,
    pub attempts: u32,
}

impl TransferResult {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.state == TransferState::Succeeded
    }

    #[must_use]
    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.state {
            TransferState::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Outcome of discovering one directory.
#[derive(Debug, Clone)]
pub struct DirectoryReport {
    pub server: String,
    pub directory: String,
    pub path: String,
    pub discovered: usize,
    pub selected: usize,
    pub error: Option<FailureReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RunStatus {
    Success,
    PartialFailure,
    Failure,
}

#[derive(Debug, Clone, Default)]
pub struct Report {
    pub directories: Vec<DirectoryReport>,
    pub results: Vec<TransferResult>,
    pub elapsed: Duration,
}

impl Report {
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|result| result.succeeded()).count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.results
            .iter()
            .filter(|result| result.succeeded())
            .map(|result| result.bytes)
            .sum()
    }

    /// `Success` when nothing failed, `Failure` when nothing succeeded despite failures.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        let directory_errors = self
            .directories
            .iter()
            .filter(|dir| dir.error.is_some())
            .count();
        let failures = self.failed() + directory_errors;
        if failures == 0 {
            RunStatus::Success
        } else if self.succeeded() == 0 {
            RunStatus::Failure
        } else {
            RunStatus::PartialFailure
        }
    }

    /// Per-file result table, one row per transfer.
    #[must_use]
    pub fn table(&self) -> String {
        let mut results: Vec<&TransferResult> = self.results.iter().collect();
        results.sort_by(|a, b| {
            (&a.file.server, &a.file.path).cmp(&(&b.file.server, &b.file.path))
        });
        let width = results
            .iter()
            .map(|result| result.file.server.len() + result.file.path.len() + 1)
            .max()
            .unwrap_or(0)
            .max(4);
        let mut table = format!(
            "{:<width$}  {:>8}  {:>10}  {:>8}  {}\n",
            "FILE", "STATUS", "SIZE", "ATTEMPTS", "DETAIL"
        );
        for result in results {
            let name = format!("{}:{}", result.file.server, result.file.path);
            let (status, detail) = match &result.state {
                TransferState::Succeeded => ("ok", result.local_path.display().to_string()),
                TransferState::Failed(reason) => ("FAILED", reason.to_string()),
                TransferState::Pending | TransferState::InProgress => ("?", String::new()),
            };
            table.push_str(&format!(
                "{:<width$}  {:>8}  {:>10}  {:>8}  {}\n",
                name,
                status,
                bytesize::ByteSize(result.bytes).to_string(),
                result.attempts,
                detail
            ));
        }
        let failed_directories = self
            .directories
            .iter()
            .filter_map(|dir| dir.error.as_ref().map(|reason| (dir, reason)));
        for (dir, reason) in failed_directories {
            table.push_str(&format!(
                "{:<width$}  {:>8}  {:>10}  {:>8}  {}\n",
                format!("{}:{}", dir.server, dir.path),
                "SKIPPED",
                "-",
                "-",
                reason
            ));
        }
        table
    }
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let discovered: usize = self.directories.iter().map(|dir| dir.discovered).sum();
        let directory_errors = self
            .directories
            .iter()
            .filter(|dir| dir.error.is_some())
            .count();
        let retries: u32 = self
            .results
            .iter()
            .map(|result| result.attempts.saturating_sub(1))
            .sum();
        let rate = self.bytes() as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON);
        write!(
            f,
            "status: {}\n\
            directories: {} ({} failed)\n\
            files discovered: {}\n\
            files selected: {}\n\
            files downloaded: {}\n\
            files failed: {}\n\
            retries: {}\n\
            bytes downloaded: {}\n\
            elapsed: {}\n\
            average rate: {}/s",
            self.status(),
            self.directories.len(),
            directory_errors,
            discovered,
            self.results.len(),
            self.succeeded(),
            self.failed(),
            retries,
            bytesize::ByteSize(self.bytes()),
            humantime::format_duration(Duration::from_millis(
                u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
            )),
            bytesize::ByteSize(rate as u64),
        )
    }
}
