use common::{Completed, ExecResult, Staging, Task, TaskKind};
use tracing::info;

use crate::error::{Result, SchedError};

/// Qué hacer con una tarea que falló.
#[derive(Debug)]
pub enum Resubmission {
    /// La tarea se partió en tareas nuevas, con el mismo presupuesto de reintentos
    Split { tasks: Vec<Task>, chunksize: u64 },
    /// Clon con un reintento menos
    Retry(Task),
}

impl Resubmission {
    pub fn into_tasks(self) -> Vec<Task> {
        match self {
            Resubmission::Split { tasks, .. } => tasks,
            Resubmission::Retry(t) => vec![t],
        }
    }
}

/// Tamaño efectivo de los pedazos al partir `total` eventos: el chunksize
/// actual si es menor que la tarea, si no la mitad. Los pedazos quedan parejos.
pub fn split_chunksize(total: u64, current_chunksize: u64) -> u64 {
    let target = if total <= current_chunksize {
        total.div_ceil(2)
    } else {
        current_chunksize
    }
    .max(1);

    let n = total.div_ceil(target).max(1);
    total.div_ceil(n)
}

/// Parte una tarea de procesamiento en sub-rangos contiguos.
pub fn split(task: &Task, staging: &Staging, current_chunksize: u64) -> Result<(Vec<Task>, u64)> {
    let item = match &task.kind {
        TaskKind::Processing { item } if item.len() >= 2 => item,
        _ => return Err(SchedError::NotDivisible(task.label.clone())),
    };

    let chunksize = split_chunksize(item.len(), current_chunksize);
    let tasks = item
        .split_range(chunksize)
        .into_iter()
        .map(|w| Task::processing(staging, w, task.retries_to_go))
        .collect::<std::io::Result<Vec<_>>>()?;

    Ok((tasks, chunksize))
}

/// Error fatal con todo el contexto de la tarea.
pub fn fatal(completed: &Completed) -> SchedError {
    let task = &completed.task;
    SchedError::FatalItemFailure {
        item: task.label.clone(),
        category: task.category(),
        size: task.size(),
        location: task.debug_info(),
        reason: format!(
            "{:?} (return status {})",
            completed.result, completed.return_status
        ),
    }
}

/// Decide el siguiente paso de una tarea fallida:
/// 1. agotamiento de recursos y divisible -> se parte
/// 2. quedan reintentos -> se clona con un intento menos
/// 3. si no -> error fatal
pub fn resubmit(
    completed: &Completed,
    staging: &Staging,
    current_chunksize: u64,
    split_on_exhaustion: bool,
) -> Result<Resubmission> {
    let task = &completed.task;

    if completed.result == ExecResult::ResourceExhaustion
        && split_on_exhaustion
        && task.is_divisible()
    {
        info!(
            "partiendo {} para reducir el consumo de recursos",
            task.label
        );
        let (tasks, chunksize) = split(task, staging, current_chunksize)?;
        return Ok(Resubmission::Split { tasks, chunksize });
    }

    if task.retries_to_go > 0 {
        return Ok(Resubmission::Retry(task.retry()?));
    }

    Err(fatal(completed))
}
