use common::MonitorMode;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, path::PathBuf, time::Duration};
use tracing::warn;

use crate::error::{Result, SchedError};

pub const DEFAULT_CHUNKSIZE: u64 = 100_000;
pub const DEFAULT_CHUNKS_PER_ACCUM: usize = 10;
pub const DEFAULT_RETRIES: u32 = 2;
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 5;

/// Objetivos de recursos para el chunksize dinámico. Sólo se evalúan los que
/// vienen con valor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceTargets {
    /// Segundos de pared por tarea
    pub wall_time: Option<f64>,
    /// MB por tarea
    pub memory: Option<f64>,
}

/// Recursos declarados por tarea. Los núcleos reservan slots del ejecutor;
/// memoria, disco y tiempo son límites en modo watchdog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeclaredResources {
    pub cores: Option<u32>,
    pub memory_mb: Option<f64>,
    pub disk_mb: Option<f64>,
    pub wall_time_secs: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Chunksize inicial (eventos por tarea de procesamiento)
    pub chunksize: u64,
    /// Si viene, el chunksize se ajusta con los reportes de las tareas
    pub dynamic_chunksize: Option<ResourceTargets>,
    /// Resultados que junta cada tarea de acumulación (mínimo 2)
    pub chunks_per_accum: usize,
    pub retries: u32,
    pub split_on_exhaustion: bool,
    pub wait_timeout_secs: u64,

    pub resource_monitor: MonitorMode,
    pub resources: DeclaredResources,
    /// Slots del ejecutor local; None = cantidad de CPUs
    pub max_concurrency: Option<usize>,

    /// Dónde crear el directorio de staging (default: tmp del sistema)
    pub staging_dir: Option<PathBuf>,
    /// CSV de linaje de tareas
    pub tasks_accum_log: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            chunksize: DEFAULT_CHUNKSIZE,
            dynamic_chunksize: None,
            chunks_per_accum: DEFAULT_CHUNKS_PER_ACCUM,
            retries: DEFAULT_RETRIES,
            split_on_exhaustion: true,
            wait_timeout_secs: DEFAULT_WAIT_TIMEOUT_SECS,
            resource_monitor: MonitorMode::Off,
            resources: DeclaredResources::default(),
            max_concurrency: None,
            staging_dir: None,
            tasks_accum_log: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

impl ExecutorConfig {
    /// Lee la configuración desde un JSON. Los campos que faltan toman el default.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let cfg: ExecutorConfig = serde_json::from_str(&raw)?;
        Ok(cfg)
    }

    /// Pisa valores con variables de entorno, si están definidas y parsean.
    pub fn apply_env(mut self) -> Self {
        if let Some(v) = env_parse("ACCUM_CHUNKSIZE") {
            self.chunksize = v;
        }
        if let Some(v) = env_parse("ACCUM_CHUNKS_PER_ACCUM") {
            self.chunks_per_accum = v;
        }
        if let Some(v) = env_parse("ACCUM_RETRIES") {
            self.retries = v;
        }
        if let Some(v) = env_parse("WORKER_CONCURRENCY") {
            self.max_concurrency = Some(v);
        }
        if let Ok(v) = env::var("ACCUM_STAGING_DIR") {
            self.staging_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = env::var("ACCUM_TASKS_LOG") {
            self.tasks_accum_log = Some(PathBuf::from(v));
        }
        self
    }

    /// Normaliza valores fuera de rango y rechaza combinaciones imposibles.
    pub fn validated(mut self) -> Result<Self> {
        if self.chunks_per_accum < 2 {
            warn!(
                "chunks_per_accum={} es menor que 2, usando 2",
                self.chunks_per_accum
            );
            self.chunks_per_accum = 2;
        }
        if self.chunksize < 1 {
            warn!("chunksize=0 no tiene sentido, usando 1");
            self.chunksize = 1;
        }
        if let Some(targets) = &self.dynamic_chunksize {
            for (name, v) in [("wall_time", targets.wall_time), ("memory", targets.memory)] {
                if matches!(v, Some(x) if !(x > 0.0)) {
                    return Err(SchedError::Config(format!(
                        "objetivo de chunksize dinámico {} debe ser positivo",
                        name
                    )));
                }
            }
        }
        if self.wait_timeout_secs == 0 {
            self.wait_timeout_secs = 1;
        }
        Ok(self)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}
