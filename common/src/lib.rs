//! Engine of `logfetch`: collects log files from many SSH servers
//!
//! The crate is organized leaf-first:
//!
//! - [`config`] - validated TOML configuration (servers, directories, settings)
//! - [`ssh`] / [`sftp`] - the SSH client capability and its libssh2 implementation
//! - [`session`] - one owned session per server with reconnect-on-degrade
//! - [`discovery`] / [`filter`] - remote file listing and modification-time filtering
//! - [`transfer`] - single-file download, streamed or chunked with pacing
//! - [`retry`] / [`scheduler`] - backoff around attempts, bounded concurrent workers
//! - [`collect`] - the whole run, producing a [`report::Report`]
//!
//! Binaries drive the engine through [`run`], which sets up the tokio runtime, tracing and the
//! progress display.

use std::io::IsTerminal;
use std::sync::LazyLock;

use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub mod collect;
pub mod config;
pub mod discovery;
pub mod error;
pub mod filter;
pub mod progress;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod sftp;
pub mod ssh;
pub mod transfer;

#[cfg(test)]
pub mod testutils;

pub use config::Config;
pub use error::Error;
pub use report::{Report, RunStatus};

static PROGRESS: LazyLock<progress::Progress> = LazyLock::new(progress::Progress::new);

/// Process-wide progress counters, shared by the engine and the progress display.
#[must_use]
pub fn get_progress() -> &'static progress::Progress {
    &PROGRESS
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// Progress bar on a terminal, text updates otherwise
    #[default]
    #[value(alias = "Auto")]
    Auto,
    /// Animated progress bar
    #[value(alias = "ProgressBar")]
    ProgressBar,
    /// Periodic text summaries, appropriate for logging
    #[value(alias = "TextUpdates")]
    TextUpdates,
}

#[derive(Debug, Clone)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// Human readable delay between updates, e.g. "200ms"
    pub progress_delay: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    pub quiet: bool,
    pub verbose: u8,
    pub print_summary: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// 0 means number of cores
    pub max_workers: usize,
    /// 0 means tokio default
    pub max_blocking_threads: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    /// Second, non-ANSI log destination
    pub log_file: Option<std::path::PathBuf>,
}

fn level_for(verbose: u8) -> &'static str {
    match verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn setup_tracing(output: &OutputConfig, config: &TracingConfig) -> anyhow::Result<()> {
    let level = if output.quiet && output.verbose == 0 {
        "off"
    } else {
        level_for(output.verbose)
    };
    let stdout_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(std::io::stdout().is_terminal())
        .with_filter(stdout_filter);
    let file_layer = match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| anyhow::anyhow!("cannot open log file {:?}: {err}", path))?;
            // the file always gets at least debug detail
            let file_level = level_for(output.verbose.max(2));
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .with_filter(tracing_subscriber::EnvFilter::new(file_level)),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to initialize tracing: {err}"))
}

fn build_runtime(config: &RuntimeConfig) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if config.max_workers > 0 {
        builder.worker_threads(config.max_workers);
    }
    if config.max_blocking_threads > 0 {
        builder.max_blocking_threads(config.max_blocking_threads);
    }
    builder
        .build()
        .map_err(|err| anyhow::anyhow!("failed to build tokio runtime: {err}"))
}

enum ProgressDisplay {
    Bar(indicatif::ProgressBar),
    Text(progress::ProgressPrinter<'static>),
}

impl ProgressDisplay {
    fn update(&mut self, progress: &progress::Progress) {
        match self {
            ProgressDisplay::Bar(bar) => {
                let bytes = progress.bytes();
                let tasks = progress.tasks();
                bar.set_length(bytes.total);
                bar.set_position(bytes.done.min(bytes.total));
                bar.set_message(format!(
                    "files {}/{} | failed {} | retries {}",
                    tasks.done,
                    tasks.total,
                    progress.files_failed.get(),
                    progress.retries.get()
                ));
            }
            ProgressDisplay::Text(printer) => match printer.print() {
                Ok(text) => eprintln!("{text}"),
                Err(err) => tracing::debug!("failed to render progress: {err:#}"),
            },
        }
    }
}

struct ProgressTracker {
    done: std::sync::Arc<(std::sync::Mutex<bool>, std::sync::Condvar)>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ProgressTracker {
    fn start(settings: &ProgressSettings) -> anyhow::Result<Self> {
        let progress_type = match settings.progress_type {
            ProgressType::Auto if std::io::stderr().is_terminal() => ProgressType::ProgressBar,
            ProgressType::Auto => ProgressType::TextUpdates,
            other => other,
        };
        let delay = match &settings.progress_delay {
            Some(delay) => humantime::parse_duration(delay)
                .map_err(|err| anyhow::anyhow!("invalid --progress-delay '{delay}': {err}"))?,
            None if progress_type == ProgressType::ProgressBar => {
                std::time::Duration::from_millis(200)
            }
            None => std::time::Duration::from_secs(10),
        };
        let mut display = if progress_type == ProgressType::ProgressBar {
            let style = indicatif::ProgressStyle::with_template(
                "{spinner} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
            )?
            .progress_chars("=>-");
            let bar = indicatif::ProgressBar::new(0);
            bar.set_style(style);
            ProgressDisplay::Bar(bar)
        } else {
            ProgressDisplay::Text(progress::ProgressPrinter::new(get_progress()))
        };
        let done = std::sync::Arc::new((std::sync::Mutex::new(false), std::sync::Condvar::new()));
        let thread = {
            let done = done.clone();
            std::thread::spawn(move || {
                let (lock, cvar) = &*done;
                let mut finished = lock
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                loop {
                    display.update(get_progress());
                    if *finished {
                        break;
                    }
                    finished = cvar
                        .wait_timeout(finished, delay)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|err| err.into_inner().0);
                }
                if let ProgressDisplay::Bar(bar) = display {
                    bar.finish_and_clear();
                }
            })
        };
        Ok(Self {
            done,
            thread: Some(thread),
        })
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.done;
        *lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = true;
        cvar.notify_one();
        if let Some(Err(_)) = self.thread.take().map(std::thread::JoinHandle::join) {
            tracing::debug!("progress thread panicked");
        }
    }
}

/// Runs `func` on a fresh runtime with tracing and optional progress display.
///
/// Returns `None` when `func` fails; the error has been reported by then (unless `quiet`).
pub fn run<Fut, Summary>(
    progress_settings: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    tracing: TracingConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    if let Err(err) = setup_tracing(&output, &tracing) {
        eprintln!("{err:#}");
        return None;
    }
    let runtime = match build_runtime(&runtime) {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!("{err:#}");
            return None;
        }
    };
    let tracker = match progress_settings.as_ref().map(ProgressTracker::start).transpose() {
        Ok(tracker) => tracker,
        Err(err) => {
            tracing::error!("{err:#}");
            return None;
        }
    };
    let res = runtime.block_on(func());
    drop(tracker);
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(err) => {
            if !output.quiet {
                tracing::error!("{err:#}");
            }
            None
        }
    }
}
