//! End-to-end collection: discover, filter, plan destinations, download

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::{Config, DirectorySpec};
use crate::discovery::{self, RemoteFileRef};
use crate::error::Error;
use crate::filter::TimeWindow;
use crate::progress::Progress;
use crate::report::{DirectoryReport, Report, TransferTask};
use crate::scheduler::Scheduler;
use crate::session::SessionManager;
use crate::ssh::SshConnector;

const MAX_NAME_CHARS: usize = 200;

/// Makes a single path component safe on common filesystems.
#[must_use]
pub fn sanitize(name: &str) -> String {
    let replaced: String = name
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c => c,
        })
        .collect();
    let trimmed = replaced.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        return "file".to_string();
    }
    trimmed.chars().take(MAX_NAME_CHARS).collect()
}

fn with_suffix(path: &Path, n: usize) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{n}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{n}"),
    };
    path.with_file_name(name)
}

/// Turns discovered files into tasks with unique local destinations under `root`.
///
/// Files land in `root/<server>/<path relative to the directory root>`. A destination that
/// already exists on disk, or was planned for an earlier file, gets a numbered suffix
/// (`app_1.log`, `app_2.log`, ...).
#[must_use]
pub fn plan(files: Vec<RemoteFileRef>, root: &Path) -> Vec<TransferTask> {
    let mut taken = HashSet::new();
    files
        .into_iter()
        .enumerate()
        .map(|(id, file)| {
            let mut local = root.join(sanitize(&file.server));
            for component in file.relative.split('/').filter(|c| !c.is_empty()) {
                local.push(sanitize(component));
            }
            let mut candidate = local.clone();
            let mut n = 0;
            while taken.contains(&candidate) || candidate.exists() {
                n += 1;
                candidate = with_suffix(&local, n);
            }
            if n > 0 {
                tracing::debug!("{:?} exists, saving '{}' as {:?}", local, file.path, candidate);
            }
            taken.insert(candidate.clone());
            TransferTask::new(id, file, candidate)
        })
        .collect()
}

/// Result of discovering every configured directory.
#[derive(Debug, Default)]
pub struct Discovered {
    pub directories: Vec<DirectoryReport>,
    pub files: Vec<RemoteFileRef>,
}

async fn discover_server(
    sessions: Arc<SessionManager>,
    directories: Vec<(usize, DirectorySpec)>,
    window: TimeWindow,
    cancel: CancellationToken,
) -> Vec<(usize, DirectoryReport, Vec<RemoteFileRef>)> {
    let mut out = Vec::with_capacity(directories.len());
    for (idx, spec) in directories {
        let mut report = DirectoryReport {
            server: spec.server.clone(),
            directory: spec.name.clone(),
            path: spec.path.clone(),
            discovered: 0,
            selected: 0,
            error: None,
        };
        if cancel.is_cancelled() {
            report.error = Some((&Error::Cancelled).into());
            out.push((idx, report, Vec::new()));
            continue;
        }
        match discovery::discover(&sessions, &spec).await {
            Ok(files) => {
                report.discovered = files.len();
                let files = window.apply(files);
                report.selected = files.len();
                tracing::info!(
                    "'{}' on '{}': {} of {} file(s) within {}",
                    spec.name,
                    spec.server,
                    files.len(),
                    report.discovered,
                    window
                );
                out.push((idx, report, files));
            }
            Err(err) => {
                report.error = Some((&err).into());
                out.push((idx, report, Vec::new()));
            }
        }
    }
    out
}

/// Discovers all directories: servers in parallel, the directories of one server in turn.
#[instrument(skip_all, fields(directories = directories.len()))]
pub async fn discover_all(
    sessions: &Arc<SessionManager>,
    directories: &[DirectorySpec],
    window: &TimeWindow,
    cancel: &CancellationToken,
) -> Discovered {
    let mut by_server: BTreeMap<&str, Vec<(usize, DirectorySpec)>> = BTreeMap::new();
    for (idx, spec) in directories.iter().enumerate() {
        by_server
            .entry(spec.server.as_str())
            .or_default()
            .push((idx, spec.clone()));
    }
    let mut join_set = tokio::task::JoinSet::new();
    for specs in by_server.into_values() {
        join_set.spawn(discover_server(
            sessions.clone(),
            specs,
            *window,
            cancel.clone(),
        ));
    }
    let mut found = Vec::with_capacity(directories.len());
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(reports) => found.extend(reports),
            Err(err) => tracing::error!("discovery worker failed: {err}"),
        }
    }
    // report in configuration order
    found.sort_by_key(|(idx, _, _)| *idx);
    let mut discovered = Discovered::default();
    for (_, report, files) in found {
        discovered.directories.push(report);
        discovered.files.extend(files);
    }
    discovered
}

/// Runs a complete collection and reports on every directory and file.
#[instrument(skip_all)]
pub async fn collect(
    config: &Config,
    connector: Arc<dyn SshConnector>,
    window: TimeWindow,
    cancel: CancellationToken,
    progress: &'static Progress,
) -> Report {
    let started = Instant::now();
    let settings = &config.settings;
    let sessions = Arc::new(SessionManager::new(
        connector,
        settings.tuning(),
        &config.servers,
    ));
    let discovered = discover_all(&sessions, &config.directories, &window, &cancel).await;
    let tasks = plan(discovered.files, &settings.default_download_path);
    let scheduler = Scheduler::new(
        sessions.clone(),
        settings.retry(),
        settings.transfer(),
        cancel,
        progress,
    );
    let results = scheduler.run(tasks, settings.max_concurrent_transfers).await;
    sessions.disconnect_all().await;
    let report = Report {
        directories: discovered.directories,
        results,
        elapsed: started.elapsed(),
    };
    tracing::info!(
        "collection finished: {}, {} downloaded, {} failed",
        report.status(),
        report.succeeded(),
        report.failed()
    );
    report
}
