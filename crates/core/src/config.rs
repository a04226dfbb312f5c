use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;
use tracing::level_filters::LevelFilter;

use crate::{finalizer::FinalizerFailurePolicy, simulation::SimulationConfig};

/// Default maximum number of concurrently running chains. Every run occupies
/// one blocking thread for its whole duration.
pub const DEFAULT_MAX_BLOCKING_THREADS: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed reading configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(clap::Parser, Debug, Clone, Default)]
#[command(
    name = "stagechain",
    version,
    about = "Drives simulated peer transfers through the stage processor"
)]
pub struct ConfigArgs {
    /// Path to a TOML configuration file. Command line values take precedence.
    #[arg(long, env = "STAGECHAIN_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<LevelFilter>,

    /// Number of async worker threads.
    #[arg(long, env = "WORKER_THREADS")]
    pub worker_threads: Option<usize>,

    /// Maximum number of threads hosting chain runs.
    #[arg(long, env = "MAX_BLOCKING_THREADS")]
    pub max_blocking_threads: Option<usize>,

    /// What a failing context finalizer does to the run.
    #[arg(long, value_enum, env = "FINALIZER_FAILURE")]
    pub finalizer_failure: Option<FinalizerFailurePolicy>,

    #[command(flatten)]
    pub simulation: SimulationArgs,
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct SimulationArgs {
    /// Number of simulated peer sessions.
    #[arg(long)]
    pub transfers: Option<usize>,

    /// Pieces per simulated torrent.
    #[arg(long)]
    pub pieces: Option<u32>,

    /// Probability of a simulated fault at each fallible step.
    #[arg(long)]
    pub failure_rate: Option<f64>,

    /// Probability that a session already has the torrent metadata.
    #[arg(long)]
    pub cache_hit_rate: Option<f64>,

    /// Seed for the simulation RNG; random if not set.
    #[arg(long)]
    pub seed: Option<u64>,
}

impl ConfigArgs {
    /// Merges the arguments over the configuration file (if any) and the defaults.
    pub fn build(self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => {
                tracing::debug!(path = ?path, "reading configuration file");
                Config::read(path)?
            }
            None => Config::default(),
        };

        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(threads) = self.worker_threads {
            config.worker_threads = threads;
        }
        if let Some(threads) = self.max_blocking_threads {
            config.max_blocking_threads = threads;
        }
        if let Some(policy) = self.finalizer_failure {
            config.finalizer_failure = policy;
        }
        let sim = self.simulation;
        let cfg_sim = &mut config.simulation;
        if let Some(transfers) = sim.transfers {
            cfg_sim.transfers = transfers;
        }
        if let Some(pieces) = sim.pieces {
            cfg_sim.pieces = pieces;
        }
        if let Some(rate) = sim.failure_rate {
            cfg_sim.failure_rate = rate;
        }
        if let Some(rate) = sim.cache_hit_rate {
            cfg_sim.cache_hit_rate = rate;
        }
        if sim.seed.is_some() {
            cfg_sim.seed = sim.seed;
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    #[serde(with = "serde_log_level_filter")]
    pub log_level: LevelFilter,
    pub worker_threads: usize,
    pub max_blocking_threads: usize,
    pub finalizer_failure: FinalizerFailurePolicy,
    pub simulation: SimulationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::INFO,
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get().clamp(2, 16))
                .unwrap_or(4),
            max_blocking_threads: DEFAULT_MAX_BLOCKING_THREADS,
            finalizer_failure: FinalizerFailurePolicy::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl Config {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker-threads must be positive".into()));
        }
        if self.max_blocking_threads == 0 {
            return Err(ConfigError::Invalid(
                "max-blocking-threads must be positive".into(),
            ));
        }
        self.simulation.validate()
    }

    /// Builds the runtime hosting the processor: chain runs go to its
    /// blocking pool.
    pub fn build_runtime(&self) -> std::io::Result<Runtime> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.worker_threads)
            .max_blocking_threads(self.max_blocking_threads)
            .thread_name("stagechain")
            .enable_all()
            .build()
    }
}

mod serde_log_level_filter {
    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::level_filters::LevelFilter;

    pub fn serialize<S>(level: &LevelFilter, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level = if *level == LevelFilter::OFF {
            "off"
        } else if *level == LevelFilter::ERROR {
            "error"
        } else if *level == LevelFilter::WARN {
            "warn"
        } else if *level == LevelFilter::INFO {
            "info"
        } else if *level == LevelFilter::DEBUG {
            "debug"
        } else {
            "trace"
        };
        serializer.serialize_str(level)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = String::deserialize(deserializer)?;
        level
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("unknown log level: {level}")))
    }
}

pub fn set_logger(level: Option<LevelFilter>) {
    #[cfg(feature = "trace")]
    {
        static LOGGER_SET: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::Release,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        if let Err(error) = crate::tracing::tracer::init_tracer(level) {
            eprintln!("failed tracing initialization: {error}");
        }
    }
    #[cfg(not(feature = "trace"))]
    {
        let _ = level;
    }
}
