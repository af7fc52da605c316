//! SSH client capability consumed by the engine
//!
//! The engine never speaks the SSH protocol itself. It needs five primitives: open a session,
//! list a directory, stat a path, open a remote file and read N bytes at an offset. They are
//! expressed as blocking traits because every backend call runs on the blocking pool via
//! `spawn_blocking`.

use std::time::{Duration, SystemTime};

use crate::config::ServerProfile;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: SystemTime,
}

/// One entry of a remote directory listing, metadata as returned by `lstat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub path: String,
    pub metadata: RemoteMetadata,
}

/// Transport parameters applied when a session is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTuning {
    pub keepalive_interval: Duration,
    /// Transfer window requested from backends that support it.
    pub window_size: u32,
}

impl Default for TransportTuning {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            window_size: 2 * 1024 * 1024,
        }
    }
}

/// An open remote file.
pub trait RemoteFile: Send {
    /// Reads up to `buf.len()` bytes starting at `offset`.
    ///
    /// Implementations fill the whole buffer unless end of file is reached first, so a short
    /// count means EOF. `Ok(0)` is returned at or past the end of the file.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, Error>;
}

/// A live, authenticated session to one server.
pub trait RemoteSession: Send {
    fn read_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>, Error>;

    /// Metadata of `path`, following symlinks.
    fn stat(&mut self, path: &str) -> Result<RemoteMetadata, Error>;

    fn open(&mut self, path: &str) -> Result<Box<dyn RemoteFile>, Error>;

    /// Cheap health check, e.g. a keepalive round.
    fn is_alive(&mut self) -> bool;

    fn close(&mut self);
}

/// Factory of sessions; one implementation per backend.
pub trait SshConnector: Send + Sync {
    fn connect(
        &self,
        profile: &ServerProfile,
        tuning: &TransportTuning,
    ) -> Result<Box<dyn RemoteSession>, Error>;
}

/// Joins a remote directory and an entry name with exactly one separator.
#[must_use]
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}
