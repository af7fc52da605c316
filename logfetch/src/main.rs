use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "logfetch",
    version,
    about = "Collect log files from many SSH hosts at once",
    long_about = "`logfetch` downloads log files from a fleet of SSH servers in parallel.

Servers, remote directories and file patterns are read from a TOML configuration file. Files are
selected by modification time and downloaded over SFTP with bounded concurrency; transient network
failures are retried with progressive backoff and a per-file report is printed at the end.

EXAMPLES:
    # Everything modified in the last day
    logfetch -c logfetch.toml --since 24h --progress --summary

    # A fixed date range from two servers only
    logfetch --since-date 2024-05-01 --until-date '2024-05-02 12:00' --server web1 --server web2

    # Show what would be downloaded
    logfetch --since 2h --list"
)]
struct Args {
    // Selection
    /// Configuration file
    #[arg(
        short,
        long,
        default_value = "logfetch.toml",
        value_name = "PATH",
        help_heading = "Selection"
    )]
    config: std::path::PathBuf,

    /// Only files modified within this age, e.g. "24h", "90min", "7days"
    #[arg(
        long,
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        conflicts_with_all = ["since_date", "until_date"],
        help_heading = "Selection"
    )]
    since: Option<std::time::Duration>,

    /// Only files modified at or after this local date/time
    ///
    /// Accepts "YYYY-MM-DD", "YYYY-MM-DD HH:MM", "YYYY-MM-DD HH:MM:SS" and RFC 3339 timestamps.
    #[arg(long, value_name = "DATE", value_parser = parse_date, help_heading = "Selection")]
    since_date: Option<SystemTime>,

    /// Only files modified at or before this local date/time (same formats as --since-date)
    #[arg(long, value_name = "DATE", value_parser = parse_date, help_heading = "Selection")]
    until_date: Option<SystemTime>,

    /// Restrict the run to this server (repeatable)
    #[arg(long = "server", value_name = "NAME", help_heading = "Selection")]
    servers: Vec<String>,

    /// Restrict the run to this directory entry (repeatable)
    #[arg(long = "directory", value_name = "NAME", help_heading = "Selection")]
    directories: Vec<String>,

    /// List matching remote files without downloading them
    #[arg(long, help_heading = "Selection")]
    list: bool,

    // Transfer
    /// Local root for downloads, overrides `default_download_path`
    #[arg(long, value_name = "PATH", help_heading = "Transfer options")]
    download_path: Option<std::path::PathBuf>,

    /// Maximum simultaneous downloads, overrides `max_concurrent_transfers`
    #[arg(
        long,
        value_name = "N",
        value_parser = clap::value_parser!(u16).range(1..),
        help_heading = "Transfer options"
    )]
    max_concurrent_transfers: Option<u16>,

    /// Attempts per file including the first, overrides `retry_attempts`
    #[arg(
        long,
        value_name = "N",
        value_parser = clap::value_parser!(u32).range(1..),
        help_heading = "Transfer options"
    )]
    retry_attempts: Option<u32>,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Set the type of progress display
    ///
    /// If specified, --progress flag is implied.
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Set delay between progress updates
    ///
    /// Default is 200ms for the progress bar and 10s for text updates. If specified, --progress flag is implied. Accepts human-readable durations like "200ms", "10s", "5min".
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    /// Also write logs (at least DEBUG) to this file
    #[arg(long, value_name = "PATH", help_heading = "Progress & output")]
    log_file: Option<std::path::PathBuf>,

    // Advanced settings
    /// Number of worker threads (0 = number of CPU cores)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads (0 = Tokio default of 512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,
}

fn local_time(naive: chrono::NaiveDateTime) -> Result<SystemTime, String> {
    naive
        .and_local_timezone(chrono::Local)
        .earliest()
        .map(SystemTime::from)
        .ok_or_else(|| format!("{naive} does not exist in the local time zone"))
}

fn parse_date(value: &str) -> Result<SystemTime, String> {
    let value = value.trim();
    if let Ok(timestamp) = chrono::DateTime::parse_from_rfc3339(value) {
        return Ok(timestamp.into());
    }
    for format in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(value, format) {
            return local_time(naive);
        }
    }
    match chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        Ok(date) => local_time(date.and_time(chrono::NaiveTime::MIN)),
        Err(_) => Err(format!(
            "'{value}' is not a date, expected YYYY-MM-DD[ HH:MM[:SS]]"
        )),
    }
}

fn time_window(args: &Args) -> anyhow::Result<common::filter::TimeWindow> {
    match args.since {
        Some(age) => Ok(common::filter::TimeWindow::last(age, SystemTime::now())),
        None => Ok(common::filter::TimeWindow::new(
            args.since_date,
            args.until_date,
        )?),
    }
}

fn load_config(args: &Args) -> anyhow::Result<common::Config> {
    let mut config = common::Config::load(&args.config)
        .with_context(|| format!("failed to load configuration from {:?}", args.config))?;
    config.select(&args.servers, &args.directories)?;
    if let Some(path) = &args.download_path {
        config.settings.default_download_path.clone_from(path);
    }
    if let Some(limit) = args.max_concurrent_transfers {
        config.settings.max_concurrent_transfers = usize::from(limit);
    }
    if let Some(attempts) = args.retry_attempts {
        config.settings.retry_attempts = attempts;
    }
    Ok(config)
}

fn format_mtime(mtime: SystemTime) -> String {
    chrono::DateTime::<chrono::Local>::from(mtime)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

#[instrument(skip_all)]
async fn list(
    config: &common::Config,
    window: common::filter::TimeWindow,
    cancel: CancellationToken,
) -> common::Report {
    let started = std::time::Instant::now();
    let sessions = Arc::new(common::session::SessionManager::new(
        Arc::new(common::sftp::Ssh2Connector),
        config.settings.tuning(),
        &config.servers,
    ));
    let discovered =
        common::collect::discover_all(&sessions, &config.directories, &window, &cancel).await;
    sessions.disconnect_all().await;
    for file in &discovered.files {
        println!(
            "{}:{}\t{}\t{}",
            file.server,
            file.path,
            bytesize::ByteSize(file.size),
            format_mtime(file.mtime)
        );
    }
    common::Report {
        directories: discovered.directories,
        results: Vec::new(),
        elapsed: started.elapsed(),
    }
}

async fn async_main(args: Args) -> anyhow::Result<common::Report> {
    let config = load_config(&args)?;
    let window = time_window(&args)?;
    tracing::info!(
        "{} server(s), {} directory entries, window {}",
        config.servers.len(),
        config.directories.len(),
        window
    );
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, aborting transfers");
                cancel.cancel();
            }
        });
    }
    if args.list {
        return Ok(list(&config, window, cancel).await);
    }
    let report = common::collect::collect(
        &config,
        Arc::new(common::sftp::Ssh2Connector),
        window,
        cancel,
        common::get_progress(),
    )
    .await;
    if !args.quiet {
        print!("{}", report.table());
        let failed = report
            .directories
            .iter()
            .filter_map(|dir| dir.error.as_ref().map(|error| (dir, error)));
        for (dir, error) in failed {
            eprintln!("{}:{} ({}): {}", dir.server, dir.path, dir.directory, error);
        }
    }
    Ok(report)
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let tracing = common::TracingConfig {
        log_file: args.log_file.clone(),
    };
    let progress = (args.progress || args.progress_type.is_some() || args.progress_delay.is_some())
        .then(|| common::ProgressSettings {
            progress_type: args.progress_type.unwrap_or_default(),
            progress_delay: args.progress_delay.clone(),
        });
    let res = common::run(
        // listing does not download, a progress display would only clutter its output
        progress.filter(|_| !args.list),
        output,
        runtime,
        tracing,
        func,
    );
    match res {
        Some(report) if report.status() == common::RunStatus::Success => Ok(()),
        _ => std::process::exit(1),
    }
}
