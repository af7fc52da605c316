//! Remote file discovery
//!
//! Lists the regular files of a [`DirectorySpec`] whose names match its glob, optionally
//! descending into subdirectories. Symlinks are resolved with `stat` and kept only when they
//! point at a regular file; symlinked directories are never descended.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::instrument;

use crate::config::DirectorySpec;
use crate::error::Error;
use crate::session::SessionManager;
use crate::ssh::{EntryKind, RemoteSession};

/// A discovered remote file. Never mutated after discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileRef {
    pub server: String,
    /// Name of the directory entry the file was found under.
    pub directory: String,
    pub path: String,
    /// Path relative to the directory root, `/`-separated.
    pub relative: String,
    pub size: u64,
    pub mtime: SystemTime,
}

/// Walks the directory; the error of the root listing is returned unwrapped.
fn walk(
    session: &mut dyn RemoteSession,
    server: &str,
    spec: &DirectorySpec,
) -> Result<Vec<RemoteFileRef>, Error> {
    let mut files = Vec::new();
    // (remote dir, relative prefix)
    let mut pending = vec![(spec.path.clone(), String::new())];
    while let Some((dir, prefix)) = pending.pop() {
        let entries = match session.read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if dir == spec.path => return Err(err),
            Err(err) => {
                tracing::warn!("skipping '{dir}' on '{server}': {err}");
                continue;
            }
        };
        for entry in entries {
            let relative = format!("{prefix}{}", entry.name);
            if entry.metadata.kind == EntryKind::Directory {
                if spec.recursive {
                    pending.push((entry.path, format!("{relative}/")));
                }
                continue;
            }
            if !spec.matches(&entry.name) {
                continue;
            }
            let metadata = match entry.metadata.kind {
                EntryKind::File => entry.metadata,
                EntryKind::Symlink => match session.stat(&entry.path) {
                    Ok(target) if target.kind == EntryKind::File => target,
                    Ok(_) => {
                        tracing::debug!("skipping symlink '{}', not a regular file", entry.path);
                        continue;
                    }
                    Err(err) => {
                        tracing::warn!("skipping symlink '{}': {err}", entry.path);
                        continue;
                    }
                },
                EntryKind::Directory | EntryKind::Other => continue,
            };
            tracing::trace!("found '{}' ({} bytes)", entry.path, metadata.size);
            files.push(RemoteFileRef {
                server: server.to_string(),
                directory: spec.name.clone(),
                path: entry.path,
                relative,
                size: metadata.size,
                mtime: metadata.mtime,
            });
        }
    }
    // listing order is backend dependent
    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

fn discovery_error(server: &str, spec: &DirectorySpec, err: &Error) -> Error {
    Error::Discovery {
        server: server.to_string(),
        path: spec.path.clone(),
        message: err.to_string(),
    }
}

/// Lists matching regular files below the directory root.
///
/// A failure listing the root path is an [`Error::Discovery`]; failures in nested directories are
/// logged and skipped.
pub fn list(
    session: &mut dyn RemoteSession,
    server: &str,
    spec: &DirectorySpec,
) -> Result<Vec<RemoteFileRef>, Error> {
    walk(session, server, spec).map_err(|err| discovery_error(server, spec, &err))
}

/// Leases the server session and lists `spec` on the blocking pool.
///
/// Authentication failures are passed through unchanged; every other failure becomes an
/// [`Error::Discovery`]. A transient failure also degrades the session.
#[instrument(skip_all, fields(server = %spec.server, directory = %spec.name))]
pub async fn discover(
    sessions: &Arc<SessionManager>,
    spec: &DirectorySpec,
) -> Result<Vec<RemoteFileRef>, Error> {
    let mut lease = sessions.lease(&spec.server).await?;
    let task_spec = spec.clone();
    let (lease, result) = tokio::task::spawn_blocking(move || {
        let server = lease.server().to_string();
        let result = match lease.acquire() {
            Ok(session) => walk(session, &server, &task_spec),
            Err(err) => Err(err),
        };
        if let Some(err) = result.as_ref().err().filter(|err| err.is_recoverable()) {
            lease.mark_degraded(err);
        }
        (lease, result)
    })
    .await
    .map_err(|err| Error::Protocol(format!("discovery task failed: {err}")))?;
    drop(lease);
    match result {
        Ok(files) => {
            tracing::info!(
                "'{}': {} matching file(s) in '{}'",
                spec.name,
                files.len(),
                spec.path
            );
            Ok(files)
        }
        Err(err @ Error::Auth { .. }) => Err(err),
        Err(err) => {
            tracing::error!("discovery of '{}' failed: {err}", spec.name);
            Err(discovery_error(&spec.server, spec, &err))
        }
    }
}
