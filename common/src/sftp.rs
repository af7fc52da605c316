//! libssh2-backed implementation of the SSH client capability

use std::io::{Read, Seek, SeekFrom};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::instrument;

use crate::config::{Auth, ServerProfile};
use crate::error::Error;
use crate::ssh::{
    EntryKind, RemoteEntry, RemoteFile, RemoteMetadata, RemoteSession, SshConnector,
    TransportTuning, join_remote,
};

// libssh2 error codes the engine distinguishes
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_FILE: i32 = -16;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;
const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;
const LIBSSH2_FX_PERMISSION_DENIED: i32 = 3;
const LIBSSH2_FX_NO_SUCH_PATH: i32 = 10;

fn millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

fn classify(err: &ssh2::Error, path: &str) -> Error {
    match err.code() {
        ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => {
            Error::Timeout(format!("{path}: {}", err.message()))
        }
        ssh2::ErrorCode::SFTP(
            LIBSSH2_FX_NO_SUCH_FILE | LIBSSH2_FX_PERMISSION_DENIED | LIBSSH2_FX_NO_SUCH_PATH,
        ) => Error::RemotePath {
            path: path.to_string(),
            message: err.message().to_string(),
        },
        _ => Error::Protocol(format!("{path}: {err}")),
    }
}

fn classify_io(err: &std::io::Error, path: &str) -> Error {
    match err.kind() {
        std::io::ErrorKind::TimedOut => Error::Timeout(format!("reading {path}: {err}")),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => Error::RemotePath {
            path: path.to_string(),
            message: err.to_string(),
        },
        _ => Error::Protocol(format!("reading {path}: {err}")),
    }
}

fn metadata(stat: &ssh2::FileStat) -> RemoteMetadata {
    let file_type = stat.file_type();
    let kind = if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };
    RemoteMetadata {
        kind,
        size: stat.size.unwrap_or(0),
        mtime: SystemTime::UNIX_EPOCH + Duration::from_secs(stat.mtime.unwrap_or(0)),
    }
}

/// Connects with `ssh2` over a plain TCP socket.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ssh2Connector;

impl Ssh2Connector {
    fn authenticate(session: &ssh2::Session, profile: &ServerProfile) -> Result<(), Error> {
        let result = match &profile.auth {
            Auth::Password(password) => session.userauth_password(&profile.username, password),
            Auth::KeyFile { path, passphrase } => session.userauth_pubkey_file(
                &profile.username,
                None,
                path,
                passphrase.as_deref(),
            ),
        };
        match result {
            Ok(()) if session.authenticated() => Ok(()),
            Ok(()) => Err(Error::Auth {
                server: profile.name.clone(),
                message: "server did not accept the credentials".to_string(),
            }),
            Err(err) => Err(classify_auth(&err, profile)),
        }
    }
}

/// Rejected credentials and unusable key files are final; anything else is a transport problem.
fn classify_auth(err: &ssh2::Error, profile: &ServerProfile) -> Error {
    match err.code() {
        ssh2::ErrorCode::Session(
            LIBSSH2_ERROR_AUTHENTICATION_FAILED | LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED,
        ) => Error::Auth {
            server: profile.name.clone(),
            message: err.message().to_string(),
        },
        ssh2::ErrorCode::Session(LIBSSH2_ERROR_FILE)
            if matches!(profile.auth, Auth::KeyFile { .. }) =>
        {
            Error::Auth {
                server: profile.name.clone(),
                message: format!("cannot use key file: {err}"),
            }
        }
        _ => classify(err, &profile.host),
    }
}

impl SshConnector for Ssh2Connector {
    #[instrument(skip_all, fields(server = %profile.name, host = %profile.host, port = profile.port))]
    fn connect(
        &self,
        profile: &ServerProfile,
        tuning: &TransportTuning,
    ) -> Result<Box<dyn RemoteSession>, Error> {
        let connect_error = |message: String| Error::Connect {
            server: profile.name.clone(),
            message,
        };
        let addrs = (profile.host.as_str(), profile.port)
            .to_socket_addrs()
            .map_err(|err| connect_error(format!("cannot resolve {}: {err}", profile.host)))?;
        let mut last_error = None;
        let mut tcp = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, profile.timeouts.connect) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(err) => last_error = Some(format!("{addr}: {err}")),
            }
        }
        let tcp = tcp.ok_or_else(|| {
            connect_error(last_error.unwrap_or_else(|| "no address to connect to".to_string()))
        })?;
        if let Err(err) = tcp.set_nodelay(true) {
            tracing::debug!("failed to set TCP_NODELAY: {err}");
        }
        let mut session = ssh2::Session::new()
            .map_err(|err| connect_error(format!("cannot create session: {err}")))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(millis(profile.timeouts.banner));
        session.handshake().map_err(|err| match err.code() {
            ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => {
                Error::Timeout(format!("banner exchange with {}: {err}", profile.name))
            }
            _ => connect_error(format!("handshake failed: {err}")),
        })?;
        session.set_timeout(millis(profile.timeouts.auth));
        Self::authenticate(&session, profile)?;
        // from here on the connect timeout bounds every stalled read
        session.set_timeout(millis(profile.timeouts.connect));
        let keepalive = u32::try_from(tuning.keepalive_interval.as_secs()).unwrap_or(u32::MAX);
        session.set_keepalive(true, keepalive);
        // libssh2 sizes the SFTP channel window on its own
        tracing::debug!(
            "keepalive every {keepalive}s, requested window {}",
            bytesize::ByteSize(u64::from(tuning.window_size))
        );
        let sftp = session.sftp().map_err(|err| classify(&err, "sftp subsystem"))?;
        tracing::info!("connected to {}@{}:{}", profile.username, profile.host, profile.port);
        Ok(Box::new(Ssh2Session { session, sftp }))
    }
}

struct Ssh2Session {
    session: ssh2::Session,
    sftp: ssh2::Sftp,
}

impl RemoteSession for Ssh2Session {
    fn read_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>, Error> {
        let listing = self
            .sftp
            .readdir(Path::new(path))
            .map_err(|err| classify(&err, path))?;
        let mut entries = Vec::with_capacity(listing.len());
        for (entry_path, stat) in listing {
            let Some(name) = entry_path.file_name().and_then(|name| name.to_str()) else {
                tracing::warn!("skipping non UTF-8 entry {:?} in {path}", entry_path);
                continue;
            };
            if name == "." || name == ".." {
                continue;
            }
            entries.push(RemoteEntry {
                name: name.to_string(),
                path: join_remote(path, name),
                metadata: metadata(&stat),
            });
        }
        Ok(entries)
    }

    fn stat(&mut self, path: &str) -> Result<RemoteMetadata, Error> {
        self.sftp
            .stat(Path::new(path))
            .map(|stat| metadata(&stat))
            .map_err(|err| classify(&err, path))
    }

    fn open(&mut self, path: &str) -> Result<Box<dyn RemoteFile>, Error> {
        let file = self
            .sftp
            .open(Path::new(path))
            .map_err(|err| classify(&err, path))?;
        Ok(Box::new(Ssh2File {
            path: path.to_string(),
            file,
            position: 0,
        }))
    }

    fn is_alive(&mut self) -> bool {
        self.session.keepalive_send().is_ok()
    }

    fn close(&mut self) {
        if let Err(err) = self.session.disconnect(None, "logfetch done", None) {
            tracing::debug!("disconnect failed: {err}");
        }
    }
}

struct Ssh2File {
    path: String,
    file: ssh2::File,
    position: u64,
}

impl RemoteFile for Ssh2File {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        if offset != self.position {
            self.file
                .seek(SeekFrom::Start(offset))
                .map_err(|err| classify_io(&err, &self.path))?;
            self.position = offset;
        }
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(classify_io(&err, &self.path)),
            }
        }
        self.position += filled as u64;
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;

    fn profile(auth: Auth) -> ServerProfile {
        ServerProfile {
            name: "local".to_string(),
            host: "127.0.0.1".to_string(),
            port: 1,
            username: "nobody".to_string(),
            auth,
            timeouts: Timeouts {
                connect: Duration::from_secs(2),
                banner: Duration::from_secs(2),
                auth: Duration::from_secs(2),
            },
        }
    }

    fn key_file() -> Auth {
        Auth::KeyFile {
            path: "/home/ops/.ssh/id_ed25519".into(),
            passphrase: None,
        }
    }

    #[test]
    fn unreachable_host_is_a_connect_error() {
        // nothing listens on port 1 of the loopback interface
        let profile = profile(Auth::Password("x".to_string()));
        let err = match Ssh2Connector.connect(&profile, &TransportTuning::default()) {
            Ok(_) => panic!("expected the connection to fail"),
            Err(err) => err,
        };
        assert!(err.is_recoverable(), "{err}");
        assert!(matches!(err, Error::Connect { .. }), "{err}");
    }

    #[test]
    fn io_errors_are_classified() {
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "stalled");
        assert!(matches!(classify_io(&timeout, "/a"), Error::Timeout(_)));
        let gone = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(classify_io(&gone, "/a"), Error::RemotePath { .. }));
        let other = std::io::Error::other("bad packet");
        assert!(classify_io(&other, "/a").is_recoverable());
    }

    #[test]
    fn rejected_credentials_are_auth_errors() {
        let denied = ssh2::Error::new(
            ssh2::ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED),
            "Authentication failed",
        );
        for auth in [Auth::Password("x".to_string()), key_file()] {
            let err = classify_auth(&denied, &profile(auth));
            assert!(matches!(err, Error::Auth { .. }), "{err}");
        }
        let unverified = ssh2::Error::new(
            ssh2::ErrorCode::Session(LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED),
            "Username/PublicKey combination invalid",
        );
        assert!(matches!(
            classify_auth(&unverified, &profile(key_file())),
            Error::Auth { .. }
        ));
    }

    #[test]
    fn unusable_key_file_is_an_auth_error() {
        let unreadable = ssh2::Error::new(
            ssh2::ErrorCode::Session(LIBSSH2_ERROR_FILE),
            "Unable to extract public key from private key file",
        );
        let err = classify_auth(&unreadable, &profile(key_file()));
        assert!(matches!(err, Error::Auth { .. }), "{err}");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn transport_errors_during_key_auth_are_recoverable() {
        let timeout = ssh2::Error::new(
            ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT),
            "Timed out waiting on socket",
        );
        let err = classify_auth(&timeout, &profile(key_file()));
        assert!(matches!(err, Error::Timeout(_)), "{err}");
        assert!(err.is_recoverable());
        // LIBSSH2_ERROR_SOCKET_RECV
        let reset = ssh2::Error::new(ssh2::ErrorCode::Session(-43), "Failure while reading");
        let err = classify_auth(&reset, &profile(key_file()));
        assert!(matches!(err, Error::Protocol(_)), "{err}");
        assert!(err.is_recoverable());
    }
}
