use std::{path::PathBuf, sync::OnceLock};

use clap::Parser;
use logger::LogConfig;
use serde::Deserialize;

/// Defaults < config file < environment < CLI flags.
#[derive(Debug, Clone, Deserialize)]
pub struct BayConfig {
  /// Directory of `<name>/bay.yaml` container definitions.
  #[serde(default = "default_catalog_dir")]
  pub catalog_dir: PathBuf,
  /// Namespace for runtime names and the default network.
  #[serde(default = "default_prefix")]
  pub prefix: String,
  /// Overrides the network the formation is scoped to.
  #[serde(default)]
  pub network: Option<String>,
  /// Registry pulls go through here.
  #[serde(default = "default_registry")]
  pub registry: String,
  #[serde(default)]
  pub logging: LogConfig,
}

fn default_catalog_dir() -> PathBuf {
  PathBuf::from("containers")
}

fn default_prefix() -> String {
  String::from("bay")
}

fn default_registry() -> String {
  String::from("localhost:5000")
}

impl Default for BayConfig {
  fn default() -> BayConfig {
    BayConfig {
      catalog_dir: default_catalog_dir(),
      prefix: default_prefix(),
      network: None,
      registry: default_registry(),
      logging: LogConfig::default(),
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct Env {
  pub bay_config_path: Option<PathBuf>,
  pub bay_catalog_dir: Option<PathBuf>,
  pub bay_prefix: Option<String>,
  pub bay_network: Option<String>,
  pub bay_registry: Option<String>,
  pub bay_log_level: Option<logger::LogLevel>,
}

#[derive(Debug, Parser)]
#[command(
  name = "bay",
  about = "Declare, pull and reconcile container formations on a local docker host"
)]
pub struct CliArgs {
  /// Path to a bay config file.
  #[arg(long)]
  pub config_path: Option<PathBuf>,
  /// Directory holding the container catalog.
  #[arg(long)]
  pub catalog_dir: Option<PathBuf>,
  #[command(subcommand)]
  pub command: Command,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
  /// Run containers by name, including any dependencies needed.
  Up {
    containers: Vec<String>,
    /// Leave running containers the formation no longer wants
    /// alone instead of stopping them.
    #[arg(long)]
    no_stop: bool,
  },
  /// Stop containers, or everything when none are named.
  Stop { containers: Vec<String> },
  /// Run a single container in the foreground with a bash shell.
  Shell { container: String },
  /// Show the formation currently running on the host.
  Ps {
    /// Limit the listing to one container.
    container: Option<String>,
  },
  /// Tail the logs of a container.
  Tail {
    container: String,
    /// Keep following the log stream.
    #[arg(long, short)]
    follow: bool,
    /// Number of trailing lines to show.
    #[arg(long, default_value_t = 10)]
    lines: u32,
    /// Show the whole log.
    #[arg(long)]
    all: bool,
  },
  /// Pull images for containers and their build ancestry from the
  /// registry.
  Pull { containers: Vec<String> },
}

pub fn cli_args() -> &'static CliArgs {
  static CLI_ARGS: OnceLock<CliArgs> = OnceLock::new();
  CLI_ARGS.get_or_init(CliArgs::parse)
}

pub fn bay_config() -> &'static BayConfig {
  static BAY_CONFIG: OnceLock<BayConfig> = OnceLock::new();
  BAY_CONFIG.get_or_init(|| {
    let env: Env = envy::from_env()
      .expect("failed to parse bay environment");
    let args = cli_args();
    let config_path = args
      .config_path
      .clone()
      .or(env.bay_config_path)
      .unwrap_or_else(|| PathBuf::from("bay.yaml"));

    let mut config = if config_path.is_file() {
      let contents = std::fs::read_to_string(&config_path)
        .expect("failed to read bay config file");
      serde_yaml_ng::from_str::<BayConfig>(&contents)
        .expect("failed to parse bay config file")
    } else {
      BayConfig::default()
    };

    if let Some(catalog_dir) =
      args.catalog_dir.clone().or(env.bay_catalog_dir)
    {
      config.catalog_dir = catalog_dir;
    }
    if let Some(prefix) = env.bay_prefix {
      config.prefix = prefix;
    }
    if let Some(network) = env.bay_network {
      config.network = Some(network);
    }
    if let Some(registry) = env.bay_registry {
      config.registry = registry;
    }
    if let Some(level) = env.bay_log_level {
      config.logging.level = level;
    }
    config
  })
}
