use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, io, path::PathBuf};

use crate::item::WorkItem;
use crate::staging::{remove_artifact, write_json, Staging};

pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Preprocessing,
    Processing,
    Accumulating,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::Preprocessing => "preprocessing",
            TaskCategory::Processing => "processing",
            TaskCategory::Accumulating => "accumulating",
        }
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recursos medidos por el servicio de ejecución para una tarea terminada.
/// `memory_mb < 0` significa "no medido".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cores: f64,
    pub memory_mb: f64,
    pub disk_mb: f64,
    pub wall_time_secs: f64,
    pub cpu_time_secs: f64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ResourceUsage {
    pub fn unmeasured() -> Self {
        let now = Utc::now();
        Self {
            cores: -1.0,
            memory_mb: -1.0,
            disk_mb: -1.0,
            wall_time_secs: 0.0,
            cpu_time_secs: 0.0,
            start: now,
            end: now,
        }
    }
}

/// Qué hace la tarea. Las tareas de acumulación guardan a sus hijos completos
/// (con sus outputs en staging) porque son quienes los consumen.
#[derive(Debug, Clone)]
pub enum TaskKind {
    Preprocessing { item: WorkItem },
    Processing { item: WorkItem },
    Accumulating { children: Vec<Task> },
}

/// Argumentos que lee el ejecutor desde `args_<label>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TaskArgs {
    Preprocess { item: WorkItem },
    Process { item: WorkItem },
    Accumulate { inputs: Vec<PathBuf> },
}

#[derive(Debug, Clone)]
pub struct Task {
    /// Id único de esta sumisión (un clon tiene id nuevo)
    pub id: TaskId,
    /// Etiqueta estable entre reintentos, ej: "p_7"
    pub label: String,
    pub kind: TaskKind,
    pub retries_to_go: u32,

    pub args_path: PathBuf,
    pub output_path: PathBuf,

    /// Tamaño (MB) de los resultados intermedios que consume
    pub fin_size: f64,
    /// Tamaño (MB) del resultado, medido al terminar con éxito
    pub fout_size: f64,

    pub resources: Option<ResourceUsage>,
    pub hostname: Option<String>,
}

impl Task {
    pub fn preprocessing(staging: &Staging, item: WorkItem, retries: u32) -> io::Result<Self> {
        Self::build(staging, "pre", TaskKind::Preprocessing { item }, retries)
    }

    pub fn processing(staging: &Staging, item: WorkItem, retries: u32) -> io::Result<Self> {
        Self::build(staging, "p", TaskKind::Processing { item }, retries)
    }

    pub fn accumulating(staging: &Staging, children: Vec<Task>, retries: u32) -> io::Result<Self> {
        let mut task = Self::build(staging, "accum", TaskKind::Accumulating { children }, retries)?;
        if let TaskKind::Accumulating { children } = &task.kind {
            task.fin_size = children.iter().map(|t| t.fout_size).sum();
        }
        Ok(task)
    }

    fn build(staging: &Staging, prefix: &str, kind: TaskKind, retries: u32) -> io::Result<Self> {
        let label = staging.next_label(prefix);
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            args_path: staging.args_path(&label),
            output_path: staging.output_path(&label),
            label,
            kind,
            retries_to_go: retries,
            fin_size: 0.0,
            fout_size: 0.0,
            resources: None,
            hostname: None,
        };
        task.write_args()?;
        Ok(task)
    }

    /// Reintento: mismo payload y etiqueta, id nuevo, un intento menos.
    pub fn retry(&self) -> io::Result<Self> {
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            retries_to_go: self.retries_to_go.saturating_sub(1),
            fout_size: 0.0,
            resources: None,
            hostname: None,
            ..self.clone()
        };
        task.write_args()?;
        Ok(task)
    }

    pub fn category(&self) -> TaskCategory {
        match self.kind {
            TaskKind::Preprocessing { .. } => TaskCategory::Preprocessing,
            TaskKind::Processing { .. } => TaskCategory::Processing,
            TaskKind::Accumulating { .. } => TaskCategory::Accumulating,
        }
    }

    /// Eventos que representa la tarea.
    pub fn size(&self) -> u64 {
        match &self.kind {
            TaskKind::Preprocessing { .. } => 1,
            TaskKind::Processing { item } => item.len(),
            TaskKind::Accumulating { children } => children.iter().map(|t| t.size()).sum(),
        }
    }

    /// Sólo el procesamiento con más de un evento se puede partir.
    pub fn is_divisible(&self) -> bool {
        matches!(self.kind, TaskKind::Processing { .. }) && self.size() > 1
    }

    pub fn item(&self) -> Option<&WorkItem> {
        match &self.kind {
            TaskKind::Preprocessing { item } | TaskKind::Processing { item } => Some(item),
            TaskKind::Accumulating { .. } => None,
        }
    }

    pub fn args(&self) -> TaskArgs {
        match &self.kind {
            TaskKind::Preprocessing { item } => TaskArgs::Preprocess { item: item.clone() },
            TaskKind::Processing { item } => TaskArgs::Process { item: item.clone() },
            TaskKind::Accumulating { children } => TaskArgs::Accumulate {
                inputs: children.iter().map(|t| t.output_path.clone()).collect(),
            },
        }
    }

    fn write_args(&self) -> io::Result<()> {
        write_json(&self.args_path, &self.args())
    }

    /// Borra el archivo de argumentos. Si es una acumulación, también los
    /// resultados de los hijos, que ya quedaron incluidos en el suyo.
    pub fn cleanup_inputs(&self, consumed: bool) {
        remove_artifact(&self.args_path);
        if consumed {
            if let TaskKind::Accumulating { children } = &self.kind {
                for child in children {
                    child.cleanup_outputs();
                }
            }
        }
    }

    pub fn cleanup_outputs(&self) {
        remove_artifact(&self.output_path);
    }

    /// Contexto para diagnósticos: ítem de origen o, para acumulaciones, sus hijos.
    pub fn debug_info(&self) -> String {
        match &self.kind {
            TaskKind::Preprocessing { item } | TaskKind::Processing { item } => {
                format!("{} {}", item.debug_tuple(), self.label)
            }
            TaskKind::Accumulating { children } => {
                let nested: Vec<String> = children.iter().map(|c| c.debug_info()).collect();
                format!("{} accumulating: [{}]", self.label, nested.join("\n"))
            }
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}
