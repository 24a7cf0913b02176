//! shellcache - drive the offline cache from the command line.
//!
//! Loads the deployment config, installs the configured version into the
//! local cache, and routes individual requests through it the way the host
//! application would.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use shellcache_core::{
    CacheStorage, Config, HttpNetwork, Registration, RegistrationState, Request, VersionState,
};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable enabling a daily rolling log file in the given directory
const LOG_DIR_ENV: &str = "SHELLCACHE_LOG_DIR";

const USAGE: &str = "\
Usage: shellcache <command>

Commands:
  install               Precache the configured version and activate it
  fetch <url> [--navigate]
                        Route one GET request through the cache; body to stdout
  message <json>        Post a control message, e.g. '{\"type\":\"SKIP_WAITING\"}'
  status                Show the active version and cache stores
  --help                Show this help

Configuration is read from $SHELLCACHE_CONFIG or ~/.config/shellcache/config.json.

Each invocation is its own short-lived host with no open client sessions, so
a newly installed version never waits: `install` activates it straight away.
`message` therefore reaches the active version, where SKIP_WAITING has no
further effect.";

/// Initialize the tracing subscriber for logging.
/// The returned guard must live until exit so buffered file logs are flushed.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(LOG_DIR_ENV) {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "shellcache.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };
    if command == "--help" || command == "-h" {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load().context("Failed to load config")?;
    let registration = open_registration(&config)?;
    info!(version = %config.worker.version, command = %command, "shellcache starting");

    match command.as_str() {
        "install" => install(&config, &registration).await,
        "fetch" => {
            let url = args
                .get(1)
                .ok_or_else(|| anyhow::anyhow!("fetch requires a URL"))?;
            let navigate = args.iter().skip(2).any(|a| a == "--navigate");
            fetch(&config, &registration, url, navigate).await
        }
        "message" => {
            let raw = args
                .get(1)
                .ok_or_else(|| anyhow::anyhow!("message requires a JSON argument"))?;
            message(&config, &registration, raw).await
        }
        "status" => status(&config, &registration).await,
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    }
}

fn open_registration(config: &Config) -> Result<Registration> {
    let cache_dir = config.cache_dir()?;
    let network = HttpNetwork::with_timeout(Duration::from_secs(config.request_timeout_secs))
        .context("Failed to build HTTP client")?;
    Ok(Registration::new(CacheStorage::new(cache_dir), Arc::new(network)))
}

/// Resume the configured version if it is already active.
async fn resume(config: &Config, registration: &Registration) -> Result<bool> {
    let worker = registration.worker(config.worker.clone())?;
    Ok(registration.restore(worker).await?)
}

async fn install(config: &Config, registration: &Registration) -> Result<()> {
    if resume(config, registration).await? {
        eprintln!("Version {} is already active", config.worker.version);
        return Ok(());
    }

    let worker = registration.worker(config.worker.clone())?;
    let state = registration
        .register(worker)
        .await
        .with_context(|| format!("Failed to install version {}", config.worker.version))?;

    match state {
        VersionState::Activated => eprintln!("Version {} installed and active", config.worker.version),
        other => eprintln!("Version {} is {}", config.worker.version, other),
    }
    Ok(())
}

async fn fetch(config: &Config, registration: &Registration, raw_url: &str, navigate: bool) -> Result<()> {
    resume(config, registration).await?;

    // Relative paths resolve against the origin; absolute URLs pass through
    let url = config
        .worker
        .origin
        .join(raw_url)
        .with_context(|| format!("Invalid URL: {}", raw_url))?;
    let request = if navigate {
        Request::navigate(url)
    } else {
        Request::get(url)
    };

    let result = registration.fetch(request).await;
    // Background cache writes must land before the process exits
    registration.settle().await;
    let (response, source) = result?;

    eprintln!("{} ({:?}, {} bytes)", response.status, source, response.body.len());
    let mut stdout = io::stdout().lock();
    stdout.write_all(&response.body)?;
    stdout.flush()?;
    Ok(())
}

/// Post a control message to the configured version.
/// Only an active version can be resumed across invocations, so this never
/// finds a waiting version to release.
async fn message(config: &Config, registration: &Registration, raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("Message is not valid JSON")?;
    resume(config, registration).await?;

    if registration.active().await.is_none() {
        eprintln!("Version {} is not active; run `shellcache install` first", config.worker.version);
    }
    match registration.post_message(value).await? {
        Some(msg) => eprintln!("Delivered {:?}", msg),
        None => eprintln!("Message ignored"),
    }
    Ok(())
}

async fn status(config: &Config, registration: &Registration) -> Result<()> {
    let storage = registration.storage();
    let state = RegistrationState::load(storage.root())?;

    println!("Configured version: {}", config.worker.version);
    println!("Origin:             {}", config.worker.origin);
    println!("Cache directory:    {}", storage.root().display());
    match (&state.active_version, state.activated_at) {
        (Some(version), Some(at)) => println!("Active version:     {} (since {})", version, at.format("%Y-%m-%d %H:%M UTC")),
        (Some(version), None) => println!("Active version:     {}", version),
        _ => println!("Active version:     none"),
    }

    let names = storage.keys().await?;
    if names.is_empty() {
        println!("\nNo cache stores");
        return Ok(());
    }
    println!();
    for name in names {
        let Some(store) = storage.get(&name).await? else {
            continue;
        };
        let entries = store.entries().await?;
        let marker = if Some(&name) == state.active_version.as_ref() { "*" } else { " " };
        let newest = entries
            .last()
            .map(|e| e.age_display())
            .unwrap_or_else(|| "never".to_string());
        println!("{} {:<16} {:>4} entries, updated {}", marker, name, entries.len(), newest);
        for entry in entries {
            println!("    {:<4} {:<9} {}", entry.status, entry.age_display(), entry.url);
        }
    }
    Ok(())
}
