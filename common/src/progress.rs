use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing::{Level, event, instrument};

#[derive(Debug)]
pub struct TlsCounter {
    // mutex is used primarily from one thread, so it's not a bottleneck
    count: thread_local::ThreadLocal<std::sync::Mutex<u64>>,
}

impl TlsCounter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        let mutex = self.count.get_or(|| std::sync::Mutex::new(0));
        let mut guard = mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard += value;
    }

    pub fn inc(&self) {
        self.add(1);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.count.iter().fold(0, |x, y| {
            x + *y.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        })
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of transfers currently in progress, with the highest value seen.
#[derive(Debug, Default)]
pub struct ActiveGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

pub struct ActiveGuard<'a> {
    gauge: &'a ActiveGauge,
}

impl ActiveGauge {
    pub fn enter(&self) -> ActiveGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ActiveGuard { gauge: self }
    }

    #[must_use]
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Status {
    pub done: u64,
    pub total: u64,
}

/// Shared run counters, read by the progress display while workers update them.
pub struct Progress {
    pub files_downloaded: TlsCounter,
    pub files_failed: TlsCounter,
    pub retries: TlsCounter,
    pub active: ActiveGauge,
    bytes_done: AtomicU64,
    bytes_total: AtomicU64,
    tasks_total: AtomicU64,
    start_time: std::time::Instant,
}

impl Progress {
    #[must_use]
    pub fn new() -> Self {
        Self {
            files_downloaded: Default::default(),
            files_failed: Default::default(),
            retries: Default::default(),
            active: Default::default(),
            bytes_done: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            tasks_total: AtomicU64::new(0),
            start_time: std::time::Instant::now(),
        }
    }

    /// Registers work about to be scheduled.
    pub fn add_tasks(&self, tasks: u64, bytes: u64) {
        self.tasks_total.fetch_add(tasks, Ordering::Relaxed);
        self.bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_done.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Takes back bytes of an attempt that will be repeated.
    pub fn sub_bytes(&self, bytes: u64) {
        // saturating, a concurrent reader may briefly see the old value
        let _ = self
            .bytes_done
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |done| {
                Some(done.saturating_sub(bytes))
            });
    }

    #[instrument(skip(self))]
    pub fn tasks(&self) -> Status {
        let total = self.tasks_total.load(Ordering::Relaxed);
        let mut status = Status {
            done: self.files_downloaded.get() + self.files_failed.get(),
            total,
        };
        if status.done > status.total {
            event!(
                Level::DEBUG,
                "Progress inversion - total: {}, done {}",
                status.total,
                status.done
            );
            status.total = status.done;
        }
        status
    }

    #[must_use]
    pub fn bytes(&self) -> Status {
        Status {
            done: self.bytes_done.load(Ordering::Relaxed),
            total: self.bytes_total.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressPrinter<'a> {
    progress: &'a Progress,
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(progress: &'a Progress) -> Self {
        Self {
            progress,
            last_bytes: progress.bytes().done,
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> anyhow::Result<String> {
        let time_now = std::time::Instant::now();
        let tasks = self.progress.tasks();
        let bytes = self.progress.bytes();
        let total_duration_secs = self.progress.get_duration().as_secs_f64();
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64();
        let average_bytes_rate = bytes.done as f64 / total_duration_secs;
        let current_bytes_rate =
            bytes.done.saturating_sub(self.last_bytes) as f64 / curr_duration_secs;
        // update self
        self.last_bytes = bytes.done;
        self.last_update = time_now;
        Ok(format!(
            "---------------------\n\
            FILES:\n\
            done:        {:>10} / {}\n\
            in progress: {:>10}\n\
            downloaded:  {:>10}\n\
            failed:      {:>10}\n\
            retries:     {:>10}\n\
            -----------------------\n\
            TRANSFERRED:\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            total:   {:>10} / {}",
            tasks.done,
            tasks.total,
            self.progress.active.current(),
            self.progress.files_downloaded.get(),
            self.progress.files_failed.get(),
            self.progress.retries.get(),
            bytesize::ByteSize(average_bytes_rate as u64),
            bytesize::ByteSize(current_bytes_rate as u64),
            bytesize::ByteSize(bytes.done),
            bytesize::ByteSize(bytes.total),
        ))
    }
}
