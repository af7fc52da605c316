//! Download of a single remote file
//!
//! Data is written to a hidden sibling of the destination (`.<name>.part`) which is renamed onto
//! the destination only after every byte arrived and was synced. Any failure removes the
//! temporary file, so a destination path either holds a complete copy or nothing.
//!
//! Files smaller than the large-file threshold are streamed with a single copy. Larger files are
//! read in fixed-size chunks at increasing offsets, pausing briefly after every `pace_every`
//! bytes. Cancellation is checked before every remote read of either kind.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::discovery::RemoteFileRef;
use crate::error::Error;
use crate::ssh::{RemoteFile, RemoteSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub chunk_size: u64,
    pub large_file_threshold: u64,
    pub pace_every: u64,
    pub pace_delay: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: 32 * 1024,
            large_file_threshold: 10 * 1024 * 1024,
            pace_every: 1024 * 1024,
            pace_delay: Duration::from_millis(10),
        }
    }
}

/// Temporary sibling used while `local_path` is being downloaded.
#[must_use]
pub fn temp_path(local_path: &Path) -> PathBuf {
    let name = local_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    local_path.with_file_name(format!(".{name}.part"))
}

/// Removes the temporary file of an interrupted download, if any.
pub fn discard_partial(local_path: &Path) {
    let temp = temp_path(local_path);
    match std::fs::remove_file(&temp) {
        Ok(()) => tracing::debug!("removed partial download {:?}", temp),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!("failed to remove partial download {:?}: {err}", temp),
    }
}

/// Downloads `file` to `local_path`, returning the number of bytes written.
///
/// `on_progress(done, total)` is called after every chunk of a large file and once at the end of
/// a small one. The byte count always equals the size recorded at discovery; data appended to
/// the remote file after discovery is not downloaded.
#[instrument(skip_all, fields(server = %file.server, path = %file.path, size = file.size))]
pub fn transfer(
    session: &mut dyn RemoteSession,
    file: &RemoteFileRef,
    local_path: &Path,
    settings: &Settings,
    cancel: &CancellationToken,
    on_progress: &mut dyn FnMut(u64, u64),
) -> Result<u64, Error> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let temp = temp_path(local_path);
    match download(session, file, &temp, settings, cancel, on_progress) {
        Ok(bytes) => {
            if let Err(err) = std::fs::rename(&temp, local_path) {
                discard_partial(local_path);
                return Err(Error::local_io(local_path, err));
            }
            tracing::debug!("saved {} to {:?}", bytesize::ByteSize(bytes), local_path);
            Ok(bytes)
        }
        Err(err) => {
            discard_partial(local_path);
            Err(err)
        }
    }
}

fn download(
    session: &mut dyn RemoteSession,
    file: &RemoteFileRef,
    temp: &Path,
    settings: &Settings,
    cancel: &CancellationToken,
    on_progress: &mut dyn FnMut(u64, u64),
) -> Result<u64, Error> {
    if let Some(parent) = temp.parent() {
        std::fs::create_dir_all(parent).map_err(|err| Error::local_io(parent, err))?;
    }
    let mut remote = session.open(&file.path)?;
    let mut local = std::fs::File::create(temp).map_err(|err| Error::local_io(temp, err))?;
    let bytes = if file.size < settings.large_file_threshold {
        copy_streamed(remote.as_mut(), file, &mut local, temp, cancel)?
    } else {
        copy_chunked(remote.as_mut(), file, &mut local, temp, settings, cancel, on_progress)?
    };
    if bytes != file.size {
        return Err(Error::Protocol(format!(
            "transferred {bytes} bytes of {} for '{}'",
            file.size, file.path
        )));
    }
    local.sync_all().map_err(|err| Error::local_io(temp, err))?;
    if file.size < settings.large_file_threshold {
        on_progress(bytes, file.size);
    }
    Ok(bytes)
}

/// Adapts a [`RemoteFile`] to [`Read`], delivering exactly `remaining` bytes.
struct RemoteReader<'a> {
    file: &'a mut dyn RemoteFile,
    path: &'a str,
    offset: u64,
    remaining: u64,
    cancel: &'a CancellationToken,
    // remote failures are kept aside so they are not mistaken for local write errors
    error: Option<Error>,
}

impl Read for RemoteReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        if self.cancel.is_cancelled() {
            tracing::info!("cancelled after {} bytes", self.offset);
            self.error = Some(Error::Cancelled);
            return Err(std::io::Error::other("transfer cancelled"));
        }
        let want = buf
            .len()
            .min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let got = match self.file.read_at(self.offset, &mut buf[..want]) {
            Ok(got) => got,
            Err(err) => {
                self.error = Some(err);
                return Err(std::io::Error::other("remote read failed"));
            }
        };
        if got != want {
            self.error = Some(Error::Protocol(format!(
                "short read of '{}' at offset {}: {got} of {want} bytes",
                self.path, self.offset
            )));
            return Err(std::io::Error::other("remote read failed"));
        }
        self.offset += got as u64;
        self.remaining -= got as u64;
        Ok(got)
    }
}

fn copy_streamed(
    remote: &mut dyn RemoteFile,
    file: &RemoteFileRef,
    local: &mut std::fs::File,
    temp: &Path,
    cancel: &CancellationToken,
) -> Result<u64, Error> {
    let mut reader = RemoteReader {
        file: remote,
        path: &file.path,
        offset: 0,
        remaining: file.size,
        cancel,
        error: None,
    };
    let mut writer = std::io::BufWriter::new(local);
    let copied = std::io::copy(&mut reader, &mut writer);
    match (copied, reader.error.take()) {
        (_, Some(err)) => Err(err),
        (Err(err), None) => Err(Error::local_io(temp, err)),
        (Ok(bytes), None) => {
            writer.flush().map_err(|err| Error::local_io(temp, err))?;
            Ok(bytes)
        }
    }
}

fn copy_chunked(
    remote: &mut dyn RemoteFile,
    file: &RemoteFileRef,
    local: &mut std::fs::File,
    temp: &Path,
    settings: &Settings,
    cancel: &CancellationToken,
    on_progress: &mut dyn FnMut(u64, u64),
) -> Result<u64, Error> {
    let chunk_size = usize::try_from(settings.chunk_size.max(1)).unwrap_or(usize::MAX);
    let mut buffer = vec![0u8; chunk_size];
    let mut pacer = throttle::Pacer::new(settings.pace_every, settings.pace_delay);
    let mut done = 0u64;
    while done < file.size {
        if cancel.is_cancelled() {
            tracing::info!("cancelled after {} of {}", done, file.size);
            return Err(Error::Cancelled);
        }
        let want = buffer
            .len()
            .min(usize::try_from(file.size - done).unwrap_or(usize::MAX));
        let got = remote.read_at(done, &mut buffer[..want])?;
        if got != want {
            return Err(Error::Protocol(format!(
                "short read of '{}' at offset {done}: {got} of {want} bytes",
                file.path
            )));
        }
        local
            .write_all(&buffer[..got])
            .map_err(|err| Error::local_io(temp, err))?;
        done += got as u64;
        on_progress(done, file.size);
        if let Some(pause) = pacer.record(got as u64) {
            std::thread::sleep(pause);
        }
    }
    tracing::debug!("{} pauses while pacing", pacer.pauses());
    Ok(done)
}
