//! Modification-time filtering of discovered files

use std::time::SystemTime;

use crate::discovery::RemoteFileRef;
use crate::error::Error;

/// Keeps the files modified at or after `cutoff`, preserving order.
#[must_use]
pub fn filter(files: Vec<RemoteFileRef>, cutoff: SystemTime) -> Vec<RemoteFileRef> {
    files.into_iter().filter(|file| file.mtime >= cutoff).collect()
}

/// Inclusive modification-time window; an open bound accepts everything on that side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeWindow {
    since: Option<SystemTime>,
    until: Option<SystemTime>,
}

impl TimeWindow {
    pub fn new(since: Option<SystemTime>, until: Option<SystemTime>) -> Result<Self, Error> {
        if let Some((start, end)) = since.zip(until).filter(|(start, end)| start > end) {
            return Err(Error::Config(format!(
                "start of the time window ({}) is after its end ({})",
                humantime::format_rfc3339_seconds(start),
                humantime::format_rfc3339_seconds(end)
            )));
        }
        Ok(Self { since, until })
    }

    /// Window covering the last `age`, computed once from `now`.
    #[must_use]
    pub fn last(age: std::time::Duration, now: SystemTime) -> Self {
        Self {
            since: Some(now.checked_sub(age).unwrap_or(SystemTime::UNIX_EPOCH)),
            until: None,
        }
    }

    #[must_use]
    pub fn since(&self) -> Option<SystemTime> {
        self.since
    }

    #[must_use]
    pub fn until(&self) -> Option<SystemTime> {
        self.until
    }

    #[must_use]
    pub fn contains(&self, mtime: SystemTime) -> bool {
        self.since.is_none_or(|since| mtime >= since) && self.until.is_none_or(|until| mtime <= until)
    }

    #[must_use]
    pub fn apply(&self, files: Vec<RemoteFileRef>) -> Vec<RemoteFileRef> {
        let files = match self.since {
            Some(cutoff) => filter(files, cutoff),
            None => files,
        };
        match self.until {
            Some(until) => files.into_iter().filter(|file| file.mtime <= until).collect(),
            None => files,
        }
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bound = |time: Option<SystemTime>| {
            time.map_or_else(
                || "*".to_string(),
                |time| humantime::format_rfc3339_seconds(time).to_string(),
            )
        };
        write!(f, "[{} .. {}]", bound(self.since), bound(self.until))
    }
}
