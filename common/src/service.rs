use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};

use crate::task::{ResourceUsage, Task, TaskCategory, TaskId};

/// Resultado de ejecución reportado por el servicio, independiente del
/// código de salida del proceso remoto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecResult {
    Success,
    /// La tarea superó los cores/memoria/disco/tiempo asignados
    ResourceExhaustion,
    /// El proceso terminó pero no dejó resultado
    OutputMissing,
    Unknown,
}

/// Cómo mide (y limita) recursos el servicio de ejecución.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMode {
    #[default]
    Off,
    Measure,
    Watchdog,
}

/// Tarea devuelta por `wait`, con lo que midió el servicio.
#[derive(Debug, Clone)]
pub struct Completed {
    pub task: Task,
    pub result: ExecResult,
    pub return_status: i32,
    pub resources: ResourceUsage,
    pub hostname: String,
}

impl Completed {
    /// Éxito sólo si el servicio y el proceso remoto lo dicen.
    pub fn successful(&self) -> bool {
        self.result == ExecResult::Success && self.return_status == 0
    }

    /// Devuelve la tarea con las mediciones adjuntas.
    pub fn into_task(self) -> Task {
        let mut task = self.task;
        task.resources = Some(self.resources);
        task.hostname = Some(self.hostname);
        task
    }
}

/// Servicio que ejecuta las tareas (pool de workers).
///
/// Todas las operaciones salvo `wait` son inmediatas.
pub trait TaskExecutionService {
    fn submit(&mut self, task: Task) -> TaskId;

    /// Espera a que termine cualquier tarea, como mucho `timeout`.
    fn wait(&mut self, timeout: Duration) -> impl Future<Output = Option<Completed>>;

    /// Cancela todas las tareas en vuelo de la categoría. Las canceladas
    /// nunca vuelven por `wait`. Devuelve cuántas se cancelaron.
    fn cancel_by_category(&mut self, category: TaskCategory) -> usize;

    /// Hay capacidad para recibir más tareas.
    fn hungry(&self) -> bool;

    /// No hay tareas en vuelo.
    fn empty(&self) -> bool;
}
