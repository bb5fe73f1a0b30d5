// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;

use dlmgr::backend::{AddRequest, MegaOptions, TransferOptions};
use dlmgr::config::{validate_port, Config, DIRECT_FALLBACK_ENV};
use dlmgr::error::explain;
use dlmgr::store::JobStatus;
use dlmgr::utils::mask_sensitive;
use dlmgr::{JobManager, JobRecord};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Operation completed successfully
    pub const SUCCESS: i32 = 0;
    /// Operation failed
    pub const ERROR: i32 = 1;
    /// Invalid command line arguments
    pub const USAGE: i32 = 64;
}

use exit_codes::*;

/// Spinner helpers for consistent progress indicators
mod spinner {
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    pub fn create(message: &str) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .tick_chars("\u{28FB}\u{28F9}\u{28FC}\u{28F8}\u{28FE}\u{28F6}\u{28F7}\u{28E7}\u{28CF}\u{28DF} ")
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(80));
        spinner
    }
}

/// dlmgr - local download orchestrator
#[derive(Parser)]
#[command(name = "dlmgr")]
#[command(version = VERSION)]
#[command(about = "Local download orchestrator. aria2 first, direct fetch when nothing else works.")]
#[command(long_about = "dlmgr - local download orchestrator\n\n\
    Add a download:      dlmgr add <url>\n\
    Check jobs:          dlmgr status (or: dlmgr s)\n\
    Pause / resume:      dlmgr pause <id>, dlmgr resume <id>\n\
    aria2 progress:      dlmgr progress <gid>\n\
    Configure:           dlmgr config show\n\n\
    Set ARIA2_DIRECT_FALLBACK=1 to allow an in-process download when aria2 cannot run.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Quiet mode: no spinner, errors only in the log
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Verbose mode: debug logging (RUST_LOG overrides)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a download
    ///
    /// Examples:
    ///   dlmgr add "magnet:?xt=urn:btih:..."
    ///   dlmgr add https://example.com/file.iso --connections 8 --split 8
    ///   dlmgr add https://mega.nz/file/... --merge
    Add {
        /// URL, magnet link or MEGA link
        url: String,

        /// Force a backend (aria2 or mega) instead of choosing by URL
        #[arg(short, long)]
        backend: Option<String>,

        /// Output file name
        #[arg(short, long)]
        out: Option<String>,

        /// Target directory (defaults to the configured download dir)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Connections per server (1-16)
        #[arg(long, value_parser = clap::value_parser!(u8).range(1..=16))]
        connections: Option<u8>,

        /// Split the download into N pieces (1-64)
        #[arg(long, value_parser = clap::value_parser!(u8).range(1..=64))]
        split: Option<u8>,

        /// Speed limit in bytes per second
        #[arg(long, value_name = "BYTES_PER_SEC", value_parser = clap::value_parser!(u64).range(1..))]
        max_speed: Option<u64>,

        /// MEGA: merge a folder into an existing local folder
        #[arg(long)]
        merge: bool,

        /// MEGA: queue the transfer in the MEGAcmd server
        #[arg(long = "mega-queue")]
        mega_queue: bool,

        /// MEGA: ignore the transfer quota warning
        #[arg(long)]
        ignore_quota_warn: bool,

        /// MEGA: password for a protected link
        #[arg(long)]
        link_password: Option<String>,
    },

    /// Pause a download
    Pause { id: String },

    /// Resume a paused download
    Resume { id: String },

    /// Stop a download and remove it from the queue
    #[command(alias = "rm")]
    Remove { id: String },

    /// Show job status (all jobs, or one by id)
    #[command(alias = "s")]
    Status { id: Option<String> },

    /// List queued and archived jobs
    #[command(alias = "ls")]
    List,

    /// Show aria2 progress for a GID
    Progress { gid: String },

    /// List downloads the aria2 RPC server reports as active
    Active,

    /// Show or change configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the current configuration (secrets masked)
    Show,

    /// Configure the aria2 backend
    SetAria2 {
        /// RPC shared secret
        #[arg(long)]
        secret: Option<String>,

        /// RPC port (1-65535)
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
        port: Option<u16>,

        /// Path to aria2c
        #[arg(long)]
        binary: Option<PathBuf>,

        /// Ports to try after the configured one, comma separated
        #[arg(long, value_delimiter = ',', num_args = 0..)]
        alternate_ports: Option<Vec<u16>>,

        /// Keep a spawned RPC server running after dlmgr exits
        #[arg(long)]
        keep_alive: Option<bool>,
    },

    /// Configure the MEGAcmd backend
    SetMega {
        /// Account email
        #[arg(long)]
        email: Option<String>,

        /// Account password
        #[arg(long)]
        password: Option<String>,

        /// Path to mega-get
        #[arg(long)]
        binary: Option<PathBuf>,
    },

    /// General settings
    Set {
        /// Default download directory
        #[arg(long)]
        download_dir: Option<PathBuf>,

        /// Allow the direct-download fallback
        #[arg(long)]
        direct_fallback: Option<bool>,
    },
}

fn init_logging(verbose: bool, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if verbose {
        "dlmgr=debug,info"
    } else if quiet {
        "error"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_job(job: &JobRecord) {
    let line = job.status_line();
    let line = match job.status {
        JobStatus::Queued => line.dimmed(),
        JobStatus::Started => line.normal(),
        JobStatus::Paused => line.yellow(),
        JobStatus::Completed => line.green(),
        JobStatus::Error => line.red(),
    };
    println!("{}", line);
    if let Some(err) = &job.error {
        println!("    {} {}", "error:".red(), err);
    }
}

fn handle_add(
    request: AddRequest,
    backend: Option<String>,
    quiet: bool,
) -> Result<i32> {
    let config = Config::load();
    let mut manager = JobManager::from_config(&config);

    let spinner = (!quiet).then(|| spinner::create(&format!("Starting {}", request.url)));
    let result = manager.add(request, backend.as_deref());
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }
    manager.shutdown();
    let outcome = result?;

    let job = &outcome.job;
    match (&outcome.error, job.status) {
        (Some(err), _) => {
            eprintln!("{}", explain(err).build().red());
            eprintln!("Job {} recorded as {}", job.id, "error".red());
            Ok(ERROR)
        }
        (None, JobStatus::Completed) => {
            println!(
                "{} Downloaded {} directly (job {})",
                "[✓]".green(),
                job.url,
                job.id
            );
            Ok(SUCCESS)
        }
        (None, _) => {
            let handle = match (&job.rpc_handle, job.process_handle) {
                (Some(gid), _) => format!("GID: {}", gid),
                (None, Some(pid)) => format!("PID: {}", pid),
                (None, None) => "no handle".to_string(),
            };
            let tier = outcome
                .tier
                .map(|t| t.to_string())
                .unwrap_or_else(|| job.backend.to_string());
            println!(
                "{} Added download {} ({}) using {} ({})",
                "[✓]".green(),
                job.id.bold(),
                job.url,
                tier,
                handle
            );
            Ok(SUCCESS)
        }
    }
}

fn handle_status(id: Option<&str>) -> Result<i32> {
    let config = Config::load();
    let mut manager = JobManager::from_config(&config);
    for job in manager.refresh()? {
        tracing::info!("Job {} is now {}", job.id, job.status);
    }

    let jobs = manager.jobs(id)?;
    if jobs.is_empty() {
        match id {
            Some(id) => {
                eprintln!("{} No job with id {}", "[!]".yellow(), id);
                return Ok(ERROR);
            }
            None => println!("No downloads yet. Use 'dlmgr add <url>' to start one."),
        }
    }
    for job in &jobs {
        print_job(job);
    }
    Ok(SUCCESS)
}

fn handle_list() -> Result<i32> {
    let config = Config::load();
    let mut manager = JobManager::from_config(&config);
    manager.refresh()?;

    let data = manager.store().load()?;
    if data.queue.is_empty() && data.history.is_empty() {
        println!("No downloads yet. Use 'dlmgr add <url>' to start one.");
        return Ok(SUCCESS);
    }

    println!("{} ({})", "Queue".bold(), data.queue.len());
    for job in &data.queue {
        print_job(job);
    }
    if !data.history.is_empty() {
        println!();
        println!("{} ({})", "History".bold(), data.history.len());
        for job in &data.history {
            print_job(job);
        }
    }
    Ok(SUCCESS)
}

fn handle_pause_resume(id: &str, pause: bool) -> Result<i32> {
    let config = Config::load();
    let mut manager = JobManager::from_config(&config);
    let result = if pause { manager.pause(id) } else { manager.resume(id) };
    match result {
        Ok(job) => {
            let verb = if pause { "Paused" } else { "Resumed" };
            let handle = job
                .process_handle
                .map(|pid| format!("PID: {}", pid))
                .or_else(|| job.rpc_handle.as_ref().map(|gid| format!("GID: {}", gid)))
                .unwrap_or_default();
            println!("{} {} download {} ({})", "[✓]".green(), verb, job.id, handle);
            Ok(SUCCESS)
        }
        Err(e) => {
            eprintln!("{} {:#}", "[✗]".red(), e);
            Ok(ERROR)
        }
    }
}

fn handle_remove(id: &str) -> Result<i32> {
    let config = Config::load();
    let mut manager = JobManager::from_config(&config);
    match manager.remove(id)? {
        Some(job) => {
            println!("{} Removed download {} ({})", "[✓]".green(), job.id, job.url);
            Ok(SUCCESS)
        }
        None => {
            eprintln!("{} No job with id {}", "[!]".yellow(), id);
            Ok(ERROR)
        }
    }
}

fn handle_progress(gid: &str) -> Result<i32> {
    let config = Config::load();
    let mut manager = JobManager::from_config(&config);
    match manager.progress(gid) {
        Ok(report) => {
            println!("{}", report.render_detail());
            Ok(SUCCESS)
        }
        Err(e) => {
            eprintln!("Could not retrieve status for GID {}", gid);
            eprintln!("{}", explain(&e).build().red());
            Ok(ERROR)
        }
    }
}

fn handle_active() -> Result<i32> {
    let config = Config::load();
    let mut manager = JobManager::from_config(&config);
    match manager.active() {
        Ok(reports) if reports.is_empty() => {
            println!("No active aria2 downloads.");
            Ok(SUCCESS)
        }
        Ok(reports) => {
            for report in reports {
                println!("{}", report.render_line());
            }
            Ok(SUCCESS)
        }
        Err(e) => {
            eprintln!("Failed to list aria2 downloads");
            eprintln!("{}", explain(&e).build().red());
            Ok(ERROR)
        }
    }
}

fn handle_config(command: ConfigCommands) -> Result<i32> {
    let mut config = Config::load();

    match command {
        ConfigCommands::Show => {
            println!("{} {}", "Config file:".bold(), Config::default_path().display());
            println!("{}", serde_json::to_string_pretty(&config.masked())?);
            let env_note = match std::env::var(DIRECT_FALLBACK_ENV) {
                Ok(value) => format!("{}={} (overrides config)", DIRECT_FALLBACK_ENV, value),
                Err(_) => format!("{} not set", DIRECT_FALLBACK_ENV),
            };
            println!(
                "Direct fallback: {} ({})",
                if config.direct_fallback_enabled() { "enabled".green() } else { "disabled".dimmed() },
                env_note
            );
            return Ok(SUCCESS);
        }
        ConfigCommands::SetAria2 {
            secret,
            port,
            binary,
            alternate_ports,
            keep_alive,
        } => {
            if let Some(secret) = secret {
                println!("{} RPC secret set to {}", "[✓]".green(), mask_sensitive(&secret, 3));
                config.aria2.rpc_secret = secret;
            }
            if let Some(port) = port {
                config.aria2.rpc_port = validate_port(port)?;
                println!("{} RPC port set to {}", "[✓]".green(), port);
            }
            if let Some(binary) = binary {
                println!("{} aria2c path set to {}", "[✓]".green(), binary.display());
                config.aria2.binary = Some(binary);
            }
            if let Some(ports) = alternate_ports {
                config.aria2.alternate_ports = ports.into_iter().filter(|p| *p != 0).collect();
                println!(
                    "{} Alternate ports set to {:?}",
                    "[✓]".green(),
                    config.aria2.alternate_ports
                );
            }
            if let Some(keep_alive) = keep_alive {
                config.aria2.keep_server_alive = keep_alive;
                println!("{} Keep RPC server alive: {}", "[✓]".green(), keep_alive);
            }
        }
        ConfigCommands::SetMega {
            email,
            password,
            binary,
        } => {
            if let Some(email) = email {
                println!("{} MEGA email set to {}", "[✓]".green(), email);
                config.mega.email = Some(email);
            }
            if let Some(password) = password {
                config.mega.password = Some(password);
                println!("{} MEGA password set", "[✓]".green());
            }
            if let Some(binary) = binary {
                println!("{} mega-get path set to {}", "[✓]".green(), binary.display());
                config.mega.binary = Some(binary);
            }
        }
        ConfigCommands::Set {
            download_dir,
            direct_fallback,
        } => {
            if let Some(dir) = download_dir {
                println!("{} Download directory set to {}", "[✓]".green(), dir.display());
                config.download_dir = Some(dir);
            }
            if let Some(enabled) = direct_fallback {
                config.direct_fallback = enabled;
                println!("{} Direct fallback: {}", "[✓]".green(), enabled);
            }
        }
    }

    config.save()?;
    Ok(SUCCESS)
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Add {
            url,
            backend,
            out,
            dir,
            connections,
            split,
            max_speed,
            merge,
            mega_queue,
            ignore_quota_warn,
            link_password,
        } => {
            let request = AddRequest {
                url,
                dir,
                transfer: TransferOptions {
                    out,
                    max_connection_per_server: connections,
                    split,
                    max_download_limit: max_speed,
                    ..Default::default()
                },
                mega: MegaOptions {
                    merge,
                    queue: mega_queue,
                    ignore_quota_warning: ignore_quota_warn,
                    link_password,
                },
            };
            handle_add(request, backend, cli.quiet)
        }
        Commands::Pause { id } => handle_pause_resume(&id, true),
        Commands::Resume { id } => handle_pause_resume(&id, false),
        Commands::Remove { id } => handle_remove(&id),
        Commands::Status { id } => handle_status(id.as_deref()),
        Commands::List => handle_list(),
        Commands::Progress { gid } => handle_progress(&gid),
        Commands::Active => handle_active(),
        Commands::Config { command } => handle_config(command),
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { USAGE } else { SUCCESS };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    init_logging(cli.verbose, cli.quiet);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "[✗]".red(), e);
            ERROR
        }
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_add_parses_options() {
        let cli = Cli::try_parse_from([
            "dlmgr", "add", "https://example.com/a.iso", "--connections", "8", "--split", "4", "-o", "b.iso",
        ])
        .unwrap();
        match cli.command {
            Commands::Add { connections, split, out, .. } => {
                assert_eq!(connections, Some(8));
                assert_eq!(split, Some(4));
                assert_eq!(out.as_deref(), Some("b.iso"));
            }
            _ => panic!("expected add"),
        }
    }

    #[test]
    fn test_out_of_range_connections_is_usage_error() {
        let err = Cli::try_parse_from(["dlmgr", "add", "x", "--connections", "17"])
            .err()
            .unwrap();
        assert!(err.use_stderr());
    }

    #[test]
    fn test_port_zero_rejected() {
        assert!(Cli::try_parse_from(["dlmgr", "config", "set-aria2", "--port", "0"]).is_err());
        assert!(Cli::try_parse_from(["dlmgr", "config", "set-aria2", "--port", "6801"]).is_ok());
    }
}
