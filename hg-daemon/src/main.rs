//! helmgate Daemon (helmgated)
//!
//! The device process of an access checkpoint. It owns the card reader lines,
//! runs every completed frame through the decision pipeline and keeps the
//! authorization table and audit log reconciled with the remote service.
//!
//! # Threads
//! - **Edge listener**: blocks on the GPIO lines and only feeds the decoder
//! - **Main loop**: polls the decoder, decides, logs, uploads, pulls cards
//!
//! # Hardening Measures
//! - Environment sanitization (clear dangerous env vars)
//! - Restrictive umask (0027), no core dumps
//! - Working directory set to /
//! - PID file against a second instance on the same reader
//!
//! # Startup
//! Configuration problems and missing classifier resources are fatal; once
//! running, every failure is logged and the loop keeps going.

mod classifier;
mod gpio;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, error, info, warn};

use hg_core::{
    load_config, load_config_from, Checkpoint, Clock, Decision, DeviceConfig, HttpTransport, SystemClock,
    WiegandDecoder,
};

use classifier::CommandClassifier;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const PID_FILE: &str = "/run/helmgated.pid";

const LOG_ENV: &str = "HELMGATE_LOG";

// ============================================================================
// Security Hardening
// ============================================================================

/// Remove variables that could alter how we or the classifier run
fn sanitize_environment() {
    const DANGEROUS_VARS: &[&str] = &[
        "LD_PRELOAD",
        "LD_LIBRARY_PATH",
        "LD_AUDIT",
        "LD_DEBUG",
        "LD_PROFILE",
        "MALLOC_CHECK_",
        "HOSTALIASES",
        "LOCALDOMAIN",
        "RES_OPTIONS",
        "IFS",
    ];

    for var in DANGEROUS_VARS {
        std::env::remove_var(var);
    }
    std::env::set_var("PATH", "/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin");
}

/// No core dumps: they would contain the shared secret
fn disable_core_dumps() {
    let limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    // SAFETY: setrlimit is called with a valid resource constant and an
    // initialized rlimit struct.
    #[allow(clippy::useless_conversion)]
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_CORE as libc::__rlimit_resource_t, &limit) };
    if rc != 0 {
        warn!("Failed to disable core dumps");
    }
}

fn set_secure_umask() {
    // Audit files stay readable by the operator group, never by others
    // SAFETY: umask only sets the file creation mask of this process.
    unsafe { libc::umask(0o027) };
}

fn secure_working_directory() {
    if std::env::set_current_dir("/").is_err() {
        warn!("Could not chdir to /");
    }
}

// ============================================================================
// PID File Management
// ============================================================================

/// Write the PID file, refusing to start next to a live instance
fn write_pid_file(path: &Path) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    if path.exists() {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Ok(old_pid) = content.trim().parse::<i32>() {
                // SAFETY: signal 0 only checks that the process exists.
                if old_pid > 0 && unsafe { libc::kill(old_pid, 0) } == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::AddrInUse,
                        format!("Another instance is running (PID {})", old_pid),
                    ));
                }
            }
        }
        let _ = std::fs::remove_file(path);
    }

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(path)?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()?;
    debug!(path = ?path, "PID file written");
    Ok(())
}

fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove PID file: {}", e);
        }
    }
}

// ============================================================================
// CLI
// ============================================================================

struct Options {
    config: Option<PathBuf>,
    pid_file: PathBuf,
}

fn print_help() {
    eprintln!("helmgated {} - helmgate access checkpoint daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    helmgated [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config PATH   Configuration file");
    eprintln!("    -p, --pid-file PATH PID file (default {})", PID_FILE);
    eprintln!("    -v, --version       Print version");
    eprintln!("    -h, --help          Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    HELMGATE_CONFIG     Configuration file (default /etc/helmgate/config.json)");
    eprintln!("    HELMGATE_LOG        Log level (trace, debug, info, warn, error)");
}

/// `None` when the process should exit right away (help, version)
fn parse_args() -> Option<Options> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options { config: None, pid_file: PathBuf::from(PID_FILE) };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return None;
            }
            "-v" | "--version" => {
                println!("helmgated {}", VERSION);
                return None;
            }
            flag @ ("-c" | "--config" | "-p" | "--pid-file") => {
                i += 1;
                let Some(value) = args.get(i) else {
                    eprintln!("Error: {} requires a path argument", flag);
                    std::process::exit(2);
                };
                if matches!(flag, "-c" | "--config") {
                    options.config = Some(PathBuf::from(value));
                } else {
                    options.pid_file = PathBuf::from(value);
                }
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(2);
            }
        }
        i += 1;
    }
    Some(options)
}

// ============================================================================
// Logging
// ============================================================================

/// Journald when systemd is there, stdout otherwise. Returns the sink used.
fn init_logging() -> &'static str {
    let log_level = std::env::var(LOG_ENV).unwrap_or_else(|_| "info".to_string());

    if Path::new("/run/systemd/journal/socket").exists() {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(&log_level))
                    .init();
                return "systemd journal";
            }
            Err(e) => eprintln!("Failed to create journald layer: {}, falling back to stdout", e),
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(&log_level)
        .init();
    "stdout"
}

// ============================================================================
// Main Loop
// ============================================================================

fn report(decision: &Decision) {
    match decision {
        Decision::Logged { event, upload, .. } => {
            debug!(site = event.card.site, user = event.card.user, ?upload, "Event logged");
        }
        Decision::Deduplicated { outcome, upload } => {
            debug!(?outcome, ?upload, "Outcome deduplicated");
        }
        Decision::Unrecorded { event, error } => {
            error!(site = event.card.site, user = event.card.user, %error, "Decision taken but not recorded");
        }
        Decision::Rejected(_) | Decision::Suppressed { .. } => {}
    }
}

fn run(config: &DeviceConfig, shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    classifier::check_resources(&config.classifier).context("classifier resources")?;
    let mut classifier = CommandClassifier::from_config(&config.classifier)?;
    let transport = HttpTransport::new(&config.server)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let mut checkpoint = Checkpoint::new(config, clock.clone()).context("preparing storage")?;
    info!(cards = checkpoint.cards().len(), "Authorization table ready");

    let decoder = Arc::new(WiegandDecoder::new(clock, config.timing.frame_timeout_ms));
    let lines = gpio::open_lines(&config.gpio).context("opening reader lines")?;
    info!(data0 = lines.0.number(), data1 = lines.1.number(), "Reader lines open");
    let listener = gpio::spawn_listener(lines, decoder.clone(), shutdown.clone())?;

    // First pull right away; tick() logs its own failures
    if let Some(Ok(outcome)) = checkpoint.tick(&transport) {
        info!(version = %outcome.version, updated = outcome.updated, "Startup card pull done");
    }

    info!("Ready, waiting for cards");
    let sleep = Duration::from_millis(config.timing.poll_sleep_ms.max(1));
    while !shutdown.load(Ordering::SeqCst) {
        if let Some(frame) = decoder.poll() {
            debug!(bits = frame.bit_count, took_ms = frame.last_bit_ms.saturating_sub(frame.first_bit_ms), "Frame complete");
            let decision = checkpoint.handle_frame(&frame, &mut classifier, &transport);
            report(&decision);
        }
        checkpoint.tick(&transport);
        std::thread::sleep(sleep);
    }

    if listener.join().is_err() {
        warn!("Edge listener panicked");
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };
        eprintln!("PANIC at {}: {}", location, message);
    }));

    sanitize_environment();
    set_secure_umask();
    disable_core_dumps();

    let Some(options) = parse_args() else {
        return Ok(());
    };
    // Resolve a relative --config before leaving the launch directory
    let config_path = options.config.map(|p| std::fs::canonicalize(&p).unwrap_or(p));
    secure_working_directory();

    let sink = init_logging();
    info!("STARTUP: helmgated {} starting", VERSION);
    info!("STARTUP: Logging to {}", sink);

    let config = match &config_path {
        Some(path) => load_config_from(path),
        None => load_config(),
    }
    .context("loading configuration")?;
    info!(checkpoint = %config.checkpoint, version = config.firmware_version, "STARTUP: Configuration loaded");

    write_pid_file(&options.pid_file).context("writing PID file")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("SIGNAL: Received SIGINT/SIGTERM - initiating shutdown");
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!("Failed to set signal handler: {}", e);
    }

    let result = run(&config, shutdown);
    remove_pid_file(&options.pid_file);

    match &result {
        Ok(()) => info!("SHUTDOWN: Daemon terminated gracefully"),
        Err(e) => error!("FATAL: {:#}", e),
    }
    result
}
