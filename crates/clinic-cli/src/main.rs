//! `clinic`: command-line front end for the clinic record engine.
//!
//! # Usage
//!
//! ```
//! clinic register --form patient_registration --type new \
//!   --set name=Asha --set age=34 --set gender=female --set phone=0712345678
//! clinic renew 3 --start 2024-02-01 --duration 5
//! clinic --config ~/.config/clinic/clinic.toml list diet_request
//! ```

mod commands;

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use clap::Parser;
use clinic_core::forms::FormRegistry;
use clinic_engine::{EngineConfig, RecordLifecycleManager, notify::TracingSink};
use clinic_store_sqlite::SqliteStore;
use serde::Deserialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use commands::Command;

// ─── CLI args ─────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "clinic", author, version, about = "Clinic record engine")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "clinic.toml")]
  config: PathBuf,

  /// SQLite database to use instead of the configured `store_path`.
  #[arg(long, value_name = "FILE")]
  store: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

// ─── Configuration ────────────────────────────────────────────────────────────

/// Shape of `clinic.toml`. Every key may also be set through a `CLINIC_`
/// environment variable.
#[derive(Deserialize)]
#[serde(default)]
struct ClinicConfig {
  store_path: PathBuf,
  engine:     EngineConfig,
}

impl Default for ClinicConfig {
  fn default() -> Self {
    Self {
      store_path: PathBuf::from("~/.local/share/clinic/records.db"),
      engine:     EngineConfig::default(),
    }
  }
}

/// Read `path` if it exists, then overlay `CLINIC_` environment variables.
/// Nested keys use `__`, as in `CLINIC_ENGINE__DEBOUNCE_MS`.
fn load_config(path: &Path) -> anyhow::Result<ClinicConfig> {
  let settings = config::Config::builder()
    .add_source(config::File::from(path).required(false))
    .add_source(
      config::Environment::with_prefix("CLINIC")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true),
    )
    .build()
    .context("failed to read config file")?;

  settings
    .try_deserialize()
    .context("failed to deserialise ClinicConfig")
}

// ─── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();

  let clinic_cfg = load_config(&cli.config)?;

  let store_path = expand_tilde(cli.store.as_deref().unwrap_or(clinic_cfg.store_path.as_path()));
  if let Some(parent) = store_path.parent()
    && !parent.as_os_str().is_empty()
  {
    std::fs::create_dir_all(parent)
      .with_context(|| format!("failed to create {parent:?}"))?;
  }

  let store = Arc::new(
    SqliteStore::open(&store_path)
      .await
      .with_context(|| format!("failed to open store at {store_path:?}"))?,
  );
  tracing::debug!(path = ?store_path, "store opened");

  let manager = RecordLifecycleManager::new(
    Arc::clone(&store),
    store,
    FormRegistry::builtin(),
    Arc::new(TracingSink),
    clinic_cfg.engine,
  );

  commands::run(cli.command, &manager).await
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
