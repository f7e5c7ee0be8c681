use clap::Parser;
use codeintel_supervisor::logging::{LogConfig, init_logging};
use codeintel_supervisor::mediator::prefs::{feature_pref_key, mediator_pref_key};
use codeintel_supervisor::mediator::{Feature, MemoryPreferences};
use codeintel_supervisor::process::SupervisorConfigBuilder;
use codeintel_supervisor::{Codeintel, CodeintelConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// CLI arguments for the codeintel supervisor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Interpreter running the backend (overrides CODEINTEL_INTERPRETER)
    #[arg(long, value_name = "PATH")]
    interpreter: Option<PathBuf>,

    /// Backend entry script (overrides CODEINTEL_ENTRY_SCRIPT)
    #[arg(long, value_name = "PATH")]
    entry_script: Option<PathBuf>,

    /// Backend log file
    #[arg(long, value_name = "FILE")]
    backend_log: Option<PathBuf>,

    /// Backend database file
    #[arg(long, value_name = "FILE")]
    database: Option<PathBuf>,

    /// Seconds to wait for the backend's readiness handshake
    #[arg(long, value_name = "SECS")]
    startup_timeout: Option<u64>,

    /// Seconds between keepalive requests
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    keepalive: u64,

    /// Preferred mediator for a language, as LANGUAGE=MEDIATOR_ID
    #[arg(long = "prefer", value_name = "LANGUAGE=ID")]
    preferences: Vec<String>,

    /// Switch a feature off (e.g. gotodef, jumpsections)
    #[arg(long = "disable", value_name = "FEATURE")]
    disabled: Vec<Feature>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides CODEINTEL_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

fn preferences(entries: &[String], disabled: &[Feature]) -> Result<MemoryPreferences, String> {
    let prefs = MemoryPreferences::new();
    for entry in entries {
        let (language, id) = entry
            .split_once('=')
            .ok_or_else(|| format!("expected LANGUAGE=ID, got {:?}", entry))?;
        prefs.set_string(mediator_pref_key(language), id);
    }
    for feature in disabled {
        prefs.set_bool(feature_pref_key(*feature), false);
    }
    Ok(prefs)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_config =
        LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());
    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let mut builder = SupervisorConfigBuilder::from_env();
    if let Some(interpreter) = args.interpreter {
        builder = builder.interpreter(interpreter);
    }
    if let Some(script) = args.entry_script {
        builder = builder.entry_script(script);
    }
    if let Some(path) = args.backend_log {
        builder = builder.log_path(path);
    }
    if let Some(path) = args.database {
        builder = builder.db_path(path);
    }
    if let Some(secs) = args.startup_timeout {
        builder = builder.startup_timeout(Duration::from_secs(secs));
    }
    let supervisor_config = builder.build()?;

    let config =
        CodeintelConfig::default().with_keepalive_interval(Duration::from_secs(args.keepalive));
    let prefs = preferences(&args.preferences, &args.disabled)?;

    let codeintel = Codeintel::new(supervisor_config, config, Arc::new(prefs), None)?;
    codeintel.start().await?;

    let timeout = codeintel.supervisor().config().startup_timeout;
    match codeintel.wait_until_ready(timeout).await {
        Ok(()) => info!(
            "Codeintel ready on port {:?}, languages: {:?}",
            codeintel.supervisor().port(),
            codeintel.locator().languages()
        ),
        Err(e) => error!("Codeintel did not become ready: {}", e),
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    codeintel.stop().await;

    Ok(())
}
