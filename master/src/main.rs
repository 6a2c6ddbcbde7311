use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use common::{
    wordcount::{write_counts_csv, Counts, WordCount},
    MonitorMode, WorkItem,
};
use master::{
    cancel::{watch_ctrl_c, CancelToken},
    config::{ExecutorConfig, ResourceTargets},
    source::ChunkedFiles,
    RunOutput, Session,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{info, warn};
use worker::{default_slots, LocalExecutor, WorkerLimits};

#[derive(Parser)]
#[command(name = "master")]
#[command(about = "Word count repartido en chunks con acumulación en árbol")]
struct Cli {
    /// Configuración en JSON; las variables de entorno y los flags la pisan
    #[arg(long, global = true, value_name = "ARCHIVO")]
    config: Option<PathBuf>,

    /// Nombre del dataset
    #[arg(long, global = true, default_value = "default")]
    dataset: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cuenta palabras de los archivos que matchean el patrón
    Run {
        #[arg(value_name = "PATRON")]
        pattern: String,
        /// CSV de salida (word,count)
        #[arg(long, default_value = "wordcount.csv")]
        output: PathBuf,
        #[arg(long)]
        chunksize: Option<u64>,
        #[arg(long)]
        chunks_per_accum: Option<usize>,
        #[arg(long)]
        retries: Option<u32>,
        /// Slots del ejecutor local
        #[arg(long)]
        concurrency: Option<usize>,
        /// Objetivo de segundos por tarea (activa chunksize dinámico)
        #[arg(long)]
        target_wall_time: Option<f64>,
        /// Objetivo de MB por tarea (activa chunksize dinámico)
        #[arg(long)]
        target_memory: Option<f64>,
        /// off, measure o watchdog
        #[arg(long, value_parser = parse_monitor)]
        monitor: Option<MonitorMode>,
        /// CSV de linaje de tareas
        #[arg(long)]
        tasks_log: Option<PathBuf>,
    },
    /// Sólo cuenta las entradas (líneas) de cada archivo
    Preprocess {
        #[arg(value_name = "PATRON")]
        pattern: String,
    },
}

fn parse_monitor(s: &str) -> std::result::Result<MonitorMode, String> {
    match s {
        "off" => Ok(MonitorMode::Off),
        "measure" => Ok(MonitorMode::Measure),
        "watchdog" => Ok(MonitorMode::Watchdog),
        other => Err(format!("modo de monitor desconocido: {}", other)),
    }
}

fn load_config(path: Option<&Path>) -> Result<ExecutorConfig> {
    let cfg = match path {
        Some(p) => ExecutorConfig::from_file(p)?,
        None => ExecutorConfig::default(),
    };
    Ok(cfg.apply_env())
}

/// Archivos que matchean el patrón, como items sin rango.
fn discover(pattern: &str, dataset: &str) -> Result<Vec<WorkItem>> {
    let mut items = Vec::new();
    for entry in glob::glob(pattern)? {
        match entry {
            Ok(path) if path.is_file() => {
                items.push(WorkItem::file(dataset, &path.to_string_lossy(), "lines"));
            }
            Ok(_) => {}
            Err(e) => warn!("no se pudo leer {}: {}", e.path().display(), e),
        }
    }
    if items.is_empty() {
        bail!("ningún archivo matchea {}", pattern);
    }
    Ok(items)
}

fn build_session(
    cfg: ExecutorConfig,
    cancel: CancelToken,
) -> Result<Session<LocalExecutor<WordCount>, WordCount>> {
    let processor = Arc::new(WordCount);
    let limits = WorkerLimits {
        cores: cfg.resources.cores,
        memory_mb: cfg.resources.memory_mb,
        disk_mb: cfg.resources.disk_mb,
        wall_time: cfg.resources.wall_time_secs.map(Duration::from_secs_f64),
    };
    let slots = cfg.max_concurrency.unwrap_or_else(default_slots);
    let executor = LocalExecutor::new(processor.clone(), slots, cfg.resource_monitor, limits);

    Ok(Session::new(executor, processor, cfg, cancel)?)
}

/// Preprocesa y procesa con la misma sesión. `None` si se canceló antes de
/// terminar de contar las entradas: no hay nada que procesar.
async fn count_words(
    cfg: ExecutorConfig,
    items: Vec<WorkItem>,
    cancel: CancelToken,
) -> Result<Option<RunOutput<Counts>>> {
    let chunksize = cfg.chunksize;
    let mut session = build_session(cfg, cancel.clone())?;
    let files = session.preprocess(items).await?;
    if cancel.is_cancelled() {
        warn!(
            "cancelado durante el preprocesamiento ({} archivos contados), no se procesa",
            files.len()
        );
        return Ok(None);
    }

    let source = ChunkedFiles::new(files, chunksize);
    let total = source.total_events();
    Ok(Some(session.process(source, total, None).await?))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("master=debug,worker=info")
        .init();

    let cli = Cli::parse();
    let mut cfg = load_config(cli.config.as_deref())?;

    let cancel = CancelToken::new();
    watch_ctrl_c(cancel.clone());

    match cli.command {
        Commands::Run {
            pattern,
            output,
            chunksize,
            chunks_per_accum,
            retries,
            concurrency,
            target_wall_time,
            target_memory,
            monitor,
            tasks_log,
        } => {
            // 1) flags por encima de archivo y entorno
            if let Some(v) = chunksize {
                cfg.chunksize = v;
            }
            if let Some(v) = chunks_per_accum {
                cfg.chunks_per_accum = v;
            }
            if let Some(v) = retries {
                cfg.retries = v;
            }
            if concurrency.is_some() {
                cfg.max_concurrency = concurrency;
            }
            if target_wall_time.is_some() || target_memory.is_some() {
                cfg.dynamic_chunksize = Some(ResourceTargets {
                    wall_time: target_wall_time,
                    memory: target_memory,
                });
            }
            if let Some(m) = monitor {
                cfg.resource_monitor = m;
            }
            if tasks_log.is_some() {
                cfg.tasks_accum_log = tasks_log;
            }
            let cfg = cfg.validated()?;

            // 2) preprocesar y procesar
            let items = discover(&pattern, &cli.dataset)?;
            let Some(out) = count_words(cfg, items, cancel).await? else {
                return Ok(());
            };

            // 3) resultados
            let partial = out.result.is_partial();
            let counts = out.result.into_inner();
            write_counts_csv(&counts, &output.to_string_lossy())?;
            info!(
                "{} palabras distintas escritas en {}",
                counts.len(),
                output.display()
            );
            if partial {
                warn!("resultado parcial: no se procesaron todos los eventos");
            }
            println!("{}", serde_json::to_string_pretty(&out.stats)?);
        }
        Commands::Preprocess { pattern } => {
            let cfg = cfg.validated()?;
            let items = discover(&pattern, &cli.dataset)?;
            let mut session = build_session(cfg, cancel.clone())?;

            for f in session.preprocess(items).await? {
                println!("{}\t{}", f.filename, f.len());
            }
            if cancel.is_cancelled() {
                warn!("preprocesamiento cancelado: la lista está incompleta");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input_file(lines: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("wc-{}.txt", uuid::Uuid::new_v4()));
        std::fs::write(&path, lines).unwrap();
        path
    }

    fn config() -> ExecutorConfig {
        ExecutorConfig {
            chunksize: 2,
            chunks_per_accum: 2,
            max_concurrency: Some(2),
            wait_timeout_secs: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn cuenta_palabras_de_punta_a_punta() {
        let path = input_file("hola mundo\nhola\nchau mundo\n");
        let items = vec![WorkItem::file("ds", &path.to_string_lossy(), "lines")];

        let out = count_words(config(), items, CancelToken::new())
            .await
            .unwrap()
            .unwrap();
        assert!(!out.result.is_partial());
        let counts = out.result.into_inner();
        assert_eq!(counts.get("hola"), Some(&2));
        assert_eq!(counts.get("mundo"), Some(&2));
        assert_eq!(counts.get("chau"), Some(&1));
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn cancelar_en_el_preprocesamiento_no_es_error() {
        let path = input_file("hola mundo\n");
        let items = vec![WorkItem::file("ds", &path.to_string_lossy(), "lines")];

        let cancel = CancelToken::new();
        cancel.signal();
        let out = count_words(config(), items, cancel).await.unwrap();
        assert!(out.is_none());
        std::fs::remove_file(&path).ok();
    }
}
