//! In-memory SSH backend with fault injection

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::config::{Auth, ServerProfile, Timeouts};
use crate::error::Error;
use crate::ssh::{
    EntryKind, RemoteEntry, RemoteFile, RemoteMetadata, RemoteSession, SshConnector,
    TransportTuning, join_remote,
};

/// Deterministic file contents of the given length.
pub fn pattern(size: u64) -> Vec<u8> {
    (0..size).map(|idx| (idx % 251) as u8).collect()
}

#[derive(Debug, Clone)]
enum Node {
    File { data: Arc<Vec<u8>>, mtime: SystemTime },
    Dir,
    Symlink { target: String },
}

fn parent(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((parent, _)) => parent,
        None => "/",
    }
}

/// Description of one fake server; built once, never changes afterwards.
#[derive(Debug, Clone)]
pub struct MockServer {
    name: String,
    nodes: BTreeMap<String, Node>,
    unreadable: HashSet<String>,
    auth_failure: bool,
    connect_failures: u64,
    // path -> (offset, failing sessions)
    read_failures: HashMap<String, (u64, u64)>,
    short_reads: HashMap<String, u64>,
    read_delay: Duration,
}

impl MockServer {
    pub fn new(name: &str) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir);
        Self {
            name: name.to_string(),
            nodes,
            unreadable: HashSet::new(),
            auth_failure: false,
            connect_failures: 0,
            read_failures: HashMap::new(),
            short_reads: HashMap::new(),
            read_delay: Duration::ZERO,
        }
    }

    fn insert(mut self, path: &str, node: Node) -> Self {
        let mut dir = parent(path);
        while dir != "/" {
            self.nodes.entry(dir.to_string()).or_insert(Node::Dir);
            dir = parent(dir);
        }
        self.nodes.insert(path.to_string(), node);
        self
    }

    pub fn file(self, path: &str, size: u64, mtime: SystemTime) -> Self {
        let data = Arc::new(pattern(size));
        self.insert(path, Node::File { data, mtime })
    }

    pub fn dir(self, path: &str) -> Self {
        self.insert(path, Node::Dir)
    }

    pub fn symlink(self, path: &str, target: &str) -> Self {
        self.insert(
            path,
            Node::Symlink {
                target: target.to_string(),
            },
        )
    }

    /// Listing this directory fails with permission denied.
    pub fn unreadable_dir(mut self, path: &str) -> Self {
        self.unreadable.insert(path.to_string());
        self
    }

    pub fn auth_failure(mut self) -> Self {
        self.auth_failure = true;
        self
    }

    /// The first `count` connection attempts fail with a network error.
    pub fn connect_failures(mut self, count: u64) -> Self {
        self.connect_failures = count;
        self
    }

    /// Reads of `path` covering `offset` fail on the first `sessions` sessions.
    pub fn read_failure(mut self, path: &str, offset: u64, sessions: u64) -> Self {
        self.read_failures
            .insert(path.to_string(), (offset, sessions));
        self
    }

    /// The server delivers only the first `at` bytes of `path`.
    pub fn short_read(mut self, path: &str, at: u64) -> Self {
        self.short_reads.insert(path.to_string(), at);
        self
    }

    pub fn read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    fn profile(&self) -> ServerProfile {
        ServerProfile {
            name: self.name.clone(),
            host: format!("{}.test", self.name),
            port: 22,
            username: "ops".to_string(),
            auth: Auth::Password("secret".to_string()),
            timeouts: Timeouts {
                connect: Duration::from_secs(30),
                banner: Duration::from_secs(60),
                auth: Duration::from_secs(60),
            },
        }
    }

    fn lookup(&self, path: &str) -> Result<&Node, Error> {
        self.nodes.get(path).ok_or_else(|| Error::RemotePath {
            path: path.to_string(),
            message: "no such file".to_string(),
        })
    }

    fn resolve(&self, path: &str) -> Result<&Node, Error> {
        let mut current = path.to_string();
        for _ in 0..8 {
            match self.lookup(&current)? {
                Node::Symlink { target } => current = target.clone(),
                node => return Ok(node),
            }
        }
        Err(Error::RemotePath {
            path: path.to_string(),
            message: "too many levels of symbolic links".to_string(),
        })
    }
}

fn metadata(node: &Node) -> RemoteMetadata {
    match node {
        Node::File { data, mtime } => RemoteMetadata {
            kind: EntryKind::File,
            size: data.len() as u64,
            mtime: *mtime,
        },
        Node::Dir => RemoteMetadata {
            kind: EntryKind::Directory,
            size: 0,
            mtime: SystemTime::UNIX_EPOCH,
        },
        Node::Symlink { .. } => RemoteMetadata {
            kind: EntryKind::Symlink,
            size: 0,
            mtime: SystemTime::UNIX_EPOCH,
        },
    }
}

#[derive(Debug, Default)]
struct Counters {
    connect_attempts: AtomicU64,
    // tokio clock, so paused-time tests see virtual instants
    attempt_times: Mutex<Vec<tokio::time::Instant>>,
    connects: AtomicU64,
    closes: AtomicU64,
    reads: AtomicU64,
    in_use: AtomicUsize,
    overlaps: AtomicU64,
    // sessions up to this generation fail their health check
    killed: AtomicU64,
    tuning: Mutex<Option<TransportTuning>>,
}

struct ServerState {
    server: MockServer,
    counters: Counters,
}

struct UseGuard<'a> {
    counters: &'a Counters,
}

impl ServerState {
    fn enter(&self) -> UseGuard<'_> {
        if self.counters.in_use.fetch_add(1, Ordering::SeqCst) > 0 {
            self.counters.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        UseGuard {
            counters: &self.counters,
        }
    }
}

impl Drop for UseGuard<'_> {
    fn drop(&mut self) {
        self.counters.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

/// [`SshConnector`] serving [`MockServer`] trees.
pub struct MockConnector {
    order: Vec<String>,
    servers: HashMap<String, Arc<ServerState>>,
}

impl MockConnector {
    pub fn new(servers: Vec<MockServer>) -> Self {
        let order = servers.iter().map(|server| server.name.clone()).collect();
        let servers = servers
            .into_iter()
            .map(|server| {
                let state = ServerState {
                    server,
                    counters: Counters::default(),
                };
                (state.server.name.clone(), Arc::new(state))
            })
            .collect();
        Self { order, servers }
    }

    fn state(&self, name: &str) -> &Arc<ServerState> {
        self.servers
            .get(name)
            .unwrap_or_else(|| panic!("no mock server named '{name}'"))
    }

    pub fn profiles(&self) -> Vec<Arc<ServerProfile>> {
        self.order
            .iter()
            .map(|name| Arc::new(self.state(name).server.profile()))
            .collect()
    }

    /// Connects directly, bypassing any session manager.
    pub fn session(&self, name: &str) -> Box<dyn RemoteSession> {
        let profile = self.state(name).server.profile();
        match self.connect(&profile, &TransportTuning::default()) {
            Ok(session) => session,
            Err(err) => panic!("mock connect to '{name}' failed: {err}"),
        }
    }

    pub fn connect_attempts(&self, name: &str) -> u64 {
        self.state(name).counters.connect_attempts.load(Ordering::SeqCst)
    }

    /// When each connection attempt was made.
    pub fn attempt_times(&self, name: &str) -> Vec<tokio::time::Instant> {
        self.state(name)
            .counters
            .attempt_times
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn connects(&self, name: &str) -> u64 {
        self.state(name).counters.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self, name: &str) -> u64 {
        self.state(name).counters.closes.load(Ordering::SeqCst)
    }

    /// Number of `read_at` calls served.
    pub fn reads(&self, name: &str) -> u64 {
        self.state(name).counters.reads.load(Ordering::SeqCst)
    }

    /// Times a session operation started while another one was still running on that server.
    pub fn overlapping_uses(&self, name: &str) -> u64 {
        self.state(name).counters.overlaps.load(Ordering::SeqCst)
    }

    /// Transport parameters of the latest connection.
    pub fn tuning(&self, name: &str) -> Option<TransportTuning> {
        *self
            .state(name)
            .counters
            .tuning
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Every session established so far fails its next health check.
    pub fn kill_sessions(&self, name: &str) {
        let counters = &self.state(name).counters;
        counters
            .killed
            .store(counters.connects.load(Ordering::SeqCst), Ordering::SeqCst);
    }
}

impl SshConnector for MockConnector {
    fn connect(
        &self,
        profile: &ServerProfile,
        tuning: &TransportTuning,
    ) -> Result<Box<dyn RemoteSession>, Error> {
        let state = self.servers.get(&profile.name).ok_or_else(|| Error::Connect {
            server: profile.name.clone(),
            message: "unknown host".to_string(),
        })?;
        let counters = &state.counters;
        let attempt = counters.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        counters
            .attempt_times
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(tokio::time::Instant::now());
        if state.server.auth_failure {
            return Err(Error::Auth {
                server: profile.name.clone(),
                message: "permission denied (password)".to_string(),
            });
        }
        if attempt <= state.server.connect_failures {
            return Err(Error::Connect {
                server: profile.name.clone(),
                message: "connection refused".to_string(),
            });
        }
        let generation = counters.connects.fetch_add(1, Ordering::SeqCst) + 1;
        *counters
            .tuning
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(*tuning);
        Ok(Box::new(MockSession {
            state: state.clone(),
            generation,
        }))
    }
}

struct MockSession {
    state: Arc<ServerState>,
    generation: u64,
}

impl RemoteSession for MockSession {
    fn read_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>, Error> {
        let _use = self.state.enter();
        let server = &self.state.server;
        if server.unreadable.contains(path) {
            return Err(Error::RemotePath {
                path: path.to_string(),
                message: "permission denied".to_string(),
            });
        }
        match server.resolve(path)? {
            Node::Dir => {}
            _ => {
                return Err(Error::RemotePath {
                    path: path.to_string(),
                    message: "not a directory".to_string(),
                });
            }
        }
        let dir = path.trim_end_matches('/');
        let dir = if dir.is_empty() { "/" } else { dir };
        Ok(server
            .nodes
            .iter()
            .filter(|(child, _)| child.as_str() != "/" && parent(child) == dir)
            .map(|(child, node)| {
                let name = child.rsplit('/').next().unwrap_or_default().to_string();
                RemoteEntry {
                    path: join_remote(dir, &name),
                    name,
                    metadata: metadata(node),
                }
            })
            .collect())
    }

    fn stat(&mut self, path: &str) -> Result<RemoteMetadata, Error> {
        let _use = self.state.enter();
        self.state.server.resolve(path).map(metadata)
    }

    fn open(&mut self, path: &str) -> Result<Box<dyn RemoteFile>, Error> {
        let _use = self.state.enter();
        let server = &self.state.server;
        let data = match server.resolve(path)? {
            Node::File { data, .. } => data.clone(),
            _ => {
                return Err(Error::RemotePath {
                    path: path.to_string(),
                    message: "not a regular file".to_string(),
                });
            }
        };
        let failure = server
            .read_failures
            .get(path)
            .filter(|(_, sessions)| self.generation <= *sessions)
            .map(|(offset, _)| *offset);
        let limit = server
            .short_reads
            .get(path)
            .map_or(data.len() as u64, |at| (*at).min(data.len() as u64));
        Ok(Box::new(MockFile {
            state: self.state.clone(),
            path: path.to_string(),
            data,
            limit,
            failure,
        }))
    }

    fn is_alive(&mut self) -> bool {
        self.generation > self.state.counters.killed.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.state.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockFile {
    state: Arc<ServerState>,
    path: String,
    data: Arc<Vec<u8>>,
    limit: u64,
    failure: Option<u64>,
}

impl RemoteFile for MockFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        let _use = self.state.enter();
        self.state.counters.reads.fetch_add(1, Ordering::SeqCst);
        if !self.state.server.read_delay.is_zero() {
            std::thread::sleep(self.state.server.read_delay);
        }
        let end = (offset + buf.len() as u64).min(self.limit);
        if let Some(at) = self.failure.filter(|at| (offset..offset + buf.len() as u64).contains(at)) {
            return Err(Error::Protocol(format!(
                "corrupted packet reading '{}' at offset {at}",
                self.path
            )));
        }
        if offset >= end {
            return Ok(0);
        }
        let len = (end - offset) as usize;
        let start = offset as usize;
        buf[..len].copy_from_slice(&self.data[start..start + len]);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_children_only() {
        let connector = MockConnector::new(vec![
            MockServer::new("s")
                .file("/a/b/c.log", 3, SystemTime::now())
                .file("/a/d.log", 4, SystemTime::now()),
        ]);
        let mut session = connector.session("s");
        let mut names: Vec<String> = session
            .read_dir("/a")
            .unwrap()
            .into_iter()
            .map(|entry| entry.path)
            .collect();
        names.sort();
        assert_eq!(names, ["/a/b", "/a/d.log"]);
        assert_eq!(session.read_dir("/").unwrap().len(), 1);
    }

    #[test]
    fn read_failure_is_limited_to_early_sessions() {
        let connector = MockConnector::new(vec![
            MockServer::new("s")
                .file("/f", 100, SystemTime::now())
                .read_failure("/f", 50, 1),
        ]);
        let mut buf = [0u8; 60];
        let mut first = connector.session("s");
        let mut file = first.open("/f").unwrap();
        assert_eq!(file.read_at(0, &mut buf[..40]).unwrap(), 40);
        assert!(file.read_at(40, &mut buf).is_err());
        let mut second = connector.session("s");
        let mut file = second.open("/f").unwrap();
        assert_eq!(file.read_at(40, &mut buf).unwrap(), 60);
        assert_eq!(&buf[..], &pattern(100)[40..]);
        assert_eq!(file.read_at(100, &mut buf).unwrap(), 0);
    }
}
