use common::{
    accumulate_result_files,
    staging::{read_json, size_mb},
    Completed, LineageLog, Processor, RunningStats, Staging, Task, TaskCategory,
    TaskExecutionService, TaskKind, TaskReport, WorkItem,
};
use rand::{rngs::StdRng, SeedableRng};
use std::{collections::VecDeque, path::PathBuf, sync::Arc};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::ExecutorConfig;
use crate::error::{Result, SchedError};
use crate::lifecycle::{self, Resubmission};
use crate::source::ItemSource;
use crate::state::RunState;

/// Resultado de una corrida. `Partial` si se drenó o no se procesó todo.
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult<O> {
    Full(O),
    Partial(O),
}

impl<O> RunResult<O> {
    pub fn is_partial(&self) -> bool {
        matches!(self, RunResult::Partial(_))
    }

    pub fn into_inner(self) -> O {
        match self {
            RunResult::Full(o) | RunResult::Partial(o) => o,
        }
    }
}

#[derive(Debug)]
pub struct RunOutput<O> {
    pub result: RunResult<O>,
    pub stats: RunningStats,
}

/// Una corrida completa sobre un servicio de ejecución: primero
/// `preprocess`, después `process`, que consume la sesión.
pub struct Session<S, P: Processor> {
    service: S,
    processor: Arc<P>,
    config: ExecutorConfig,
    staging: Staging,
    lineage: Option<LineageLog>,
    cancel: CancelToken,
    rng: StdRng,
}

impl<S: TaskExecutionService, P: Processor> Session<S, P> {
    pub fn new(
        service: S,
        processor: Arc<P>,
        config: ExecutorConfig,
        cancel: CancelToken,
    ) -> Result<Self> {
        let staging = Staging::new(config.staging_dir.as_deref())?;
        let lineage = match &config.tasks_accum_log {
            Some(path) => Some(LineageLog::create(path)?),
            None => None,
        };
        info!("staging en {}", staging.path().display());

        Ok(Self {
            service,
            processor,
            config,
            staging,
            lineage,
            cancel,
            rng: StdRng::from_entropy(),
        })
    }

    /// Fija la semilla del muestreo de chunksize.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn staging(&self) -> &Staging {
        &self.staging
    }

    fn log_lineage(&mut self, task: &Task, status: &str, parent: &str) -> Result<()> {
        if let Some(log) = self.lineage.as_mut() {
            log.record(task, status, parent)?;
        }
        Ok(())
    }

    fn cancel_all(&mut self) {
        for category in [
            TaskCategory::Preprocessing,
            TaskCategory::Processing,
            TaskCategory::Accumulating,
        ] {
            let n = self.service.cancel_by_category(category);
            if n > 0 {
                warn!("canceladas {} tareas de {}", n, category);
            }
        }
    }

    /* ================================
       Preprocesamiento
       ================================ */

    /// Cuenta las entradas de cada archivo. Devuelve los archivos con rango
    /// `[0, entradas)`, ordenados por (dataset, archivo).
    pub async fn preprocess(&mut self, items: Vec<WorkItem>) -> Result<Vec<WorkItem>> {
        match self.preprocess_files(items).await {
            Ok(files) => Ok(files),
            Err(e) => {
                self.cancel_all();
                Err(e)
            }
        }
    }

    async fn preprocess_files(&mut self, items: Vec<WorkItem>) -> Result<Vec<WorkItem>> {
        let mut queue = items
            .into_iter()
            .map(|item| Task::preprocessing(&self.staging, item, self.config.retries))
            .collect::<std::io::Result<VecDeque<_>>>()?;

        let total = queue.len();
        let timeout = self.config.wait_timeout();
        let mut files = Vec::with_capacity(total);
        info!("preprocesando {} archivos", total);

        loop {
            if self.cancel.is_aborted() {
                return Err(SchedError::Aborted);
            }
            if self.cancel.is_cancelled() {
                let n = self.service.cancel_by_category(TaskCategory::Preprocessing);
                for task in queue.drain(..) {
                    task.cleanup_inputs(false);
                }
                warn!(
                    "preprocesamiento cancelado ({} en vuelo): sólo {} de {} archivos",
                    n,
                    files.len(),
                    total
                );
                break;
            }

            while self.service.hungry() {
                match queue.pop_front() {
                    Some(task) => {
                        self.service.submit(task);
                    }
                    None => break,
                }
            }

            if queue.is_empty() && self.service.empty() {
                break;
            }

            let Some(mut completed) = self.service.wait(timeout).await else {
                continue;
            };
            settle(&mut completed);

            if !completed.successful() {
                // nunca divisibles: reintento o fatal
                let next = lifecycle::resubmit(&completed, &self.staging, 1, false)?;
                for task in next.into_tasks() {
                    self.service.submit(task);
                }
                continue;
            }

            let entries: u64 = read_json(&completed.task.output_path)?;
            let mut task = completed.into_task();
            if let TaskKind::Preprocessing { item } = &mut task.kind {
                *item = item.with_range(0, entries);
                files.push(item.clone());
            }
            task.cleanup_outputs();
            self.log_lineage(&task, "done", "")?;
        }

        files.sort_by(|a, b| (&a.dataset, &a.filename).cmp(&(&b.dataset, &b.filename)));
        Ok(files)
    }

    /* ================================
       Procesamiento
       ================================ */

    /// Procesa todo lo que dé la fuente y devuelve el resultado acumulado,
    /// mezclado con `accumulator` si viene.
    pub async fn process<Src: ItemSource>(
        mut self,
        mut source: Src,
        events_total: u64,
        accumulator: Option<P::Output>,
    ) -> Result<RunOutput<P::Output>> {
        let mut state = RunState::new(&self.config, events_total);
        info!(
            "procesando {} eventos, chunksize {}",
            events_total,
            state.chunksize.current()
        );

        if let Err(e) = self.process_events(&mut state, &mut source).await {
            self.cancel_all();
            return Err(e);
        }

        if !state.stats.all_processed() {
            warn!(
                "no se procesaron todos los items ({} de {} eventos)",
                state.stats.events_processed, state.stats.events_total
            );
        }
        info!("chunksize final {}", state.chunksize.current());

        let partial = state.draining || !state.stats.all_processed();
        let acc = self.final_accumulation(&mut state, accumulator)?;

        let result = if partial {
            RunResult::Partial(acc)
        } else {
            RunResult::Full(acc)
        };
        Ok(RunOutput {
            result,
            stats: state.stats,
        })
    }

    async fn process_events<Src: ItemSource>(
        &mut self,
        state: &mut RunState,
        source: &mut Src,
    ) -> Result<()> {
        let timeout = self.config.wait_timeout();

        loop {
            if self.cancel.is_aborted() {
                return Err(SchedError::Aborted);
            }
            if self.cancel.is_cancelled() && !state.draining {
                self.begin_drain(state)?;
            }

            // 1) mantener lleno el pool
            while state.may_submit() && self.service.hungry() {
                let hint = if state.first_pull {
                    None
                } else {
                    state.chunksize.sample(&mut self.rng)
                };
                state.first_pull = false;

                match source.next_item(hint) {
                    Some(item) if item.is_empty() => {
                        debug!("item vacío ignorado: {}", item.debug_tuple());
                    }
                    Some(item) => self.submit_processing(state, item)?,
                    None => state.source_exhausted = true,
                }
            }

            if state.finished(self.service.empty()) {
                return Ok(());
            }

            // 2) esperar cualquier tarea
            let Some(mut completed) = self.service.wait(timeout).await else {
                continue;
            };
            settle(&mut completed);

            if completed.successful() {
                self.handle_success(state, completed)?;
            } else {
                self.handle_failure(state, completed)?;
            }
        }
    }

    fn submit_processing(&mut self, state: &mut RunState, item: WorkItem) -> Result<()> {
        let task = Task::processing(&self.staging, item, self.config.retries)?;
        state.stats.events_queued += task.size();
        debug!("sometiendo {} ({} eventos)", task.label, task.size());
        self.service.submit(task);
        Ok(())
    }

    fn handle_success(&mut self, state: &mut RunState, completed: Completed) -> Result<()> {
        let task = completed.into_task();
        state.stats.observe_sizes(task.fin_size, task.fout_size);

        match &task.kind {
            TaskKind::Processing { .. } => {
                let (wall_time, memory) = task
                    .resources
                    .as_ref()
                    .map(|r| (r.wall_time_secs, r.memory_mb))
                    .unwrap_or((0.0, -1.0));
                state.chunksize.record(TaskReport {
                    events_count: task.size(),
                    wall_time,
                    memory,
                });
                state.stats.events_processed += task.size();

                let before = state.chunksize.current();
                let current = state.chunksize.update();
                state.stats.current_chunksize = current;
                if current != before {
                    info!("chunksize actual {}", current);
                }
            }
            TaskKind::Accumulating { children } => {
                state.stats.events_accumulated += leaf_events(children);
            }
            TaskKind::Preprocessing { .. } => {
                warn!("{} es de preprocesamiento, se ignora", task.label);
                task.cleanup_outputs();
                return Ok(());
            }
        }

        state.accumulator.push(task);
        self.submit_accumulations(state)
    }

    fn handle_failure(&mut self, state: &mut RunState, completed: Completed) -> Result<()> {
        if state.draining && completed.task.category() == TaskCategory::Processing {
            warn!("drenando: {} no se vuelve a someter", completed.task.label);
            return Ok(());
        }

        match lifecycle::resubmit(
            &completed,
            &self.staging,
            state.chunksize.current(),
            self.config.split_on_exhaustion,
        )? {
            Resubmission::Split { tasks, chunksize } => {
                state.stats.record_split(chunksize);
                info!(
                    "{} partida en {} tareas de hasta {} eventos",
                    completed.task.label,
                    tasks.len(),
                    chunksize
                );
                for task in tasks {
                    self.service.submit(task);
                }
            }
            Resubmission::Retry(task) => {
                state.stats.tasks_retried += 1;
                info!(
                    "reintentando {} (quedan {} reintentos)",
                    task.label, task.retries_to_go
                );
                self.service.submit(task);
            }
        }
        Ok(())
    }

    fn submit_accumulations(&mut self, state: &mut RunState) -> Result<()> {
        let force = state.force_flush();

        for group in state.accumulator.schedule(force) {
            let task = Task::accumulating(&self.staging, group, self.config.retries)?;
            if let TaskKind::Accumulating { children } = &task.kind {
                for child in children {
                    self.log_lineage(child, "done", &task.label)?;
                }
            }
            state.stats.accumulations_submitted += 1;
            debug!(
                "sometiendo {} ({} eventos, {:.3} MB de entrada)",
                task.label,
                task.size(),
                task.fin_size
            );
            self.service.submit(task);
        }
        Ok(())
    }

    fn begin_drain(&mut self, state: &mut RunState) -> Result<()> {
        state.draining = true;
        let n = self.service.cancel_by_category(TaskCategory::Processing);
        warn!(
            "drenando: {} tareas de procesamiento canceladas, esperando acumulaciones",
            n
        );
        self.submit_accumulations(state)
    }

    fn final_accumulation(
        &mut self,
        state: &mut RunState,
        accumulator: Option<P::Output>,
    ) -> Result<P::Output> {
        let pending = state.accumulator.drain();
        if pending.is_empty() {
            return Err(SchedError::NoResultsAvailable);
        }

        info!("juntando con el acumulador final");
        let files: Vec<PathBuf> = pending.iter().map(|t| t.output_path.clone()).collect();
        let acc = accumulate_result_files(self.processor.as_ref(), &files, accumulator)?
            .ok_or(SchedError::NoResultsAvailable)?;

        for task in &pending {
            if task.category() == TaskCategory::Processing {
                state.stats.events_accumulated += task.size();
            }
            task.cleanup_outputs();
            self.log_lineage(task, "accumulated", "0")?;
        }
        Ok(acc)
    }
}

/// Eventos de los hijos de procesamiento. Los hijos que son acumulaciones ya
/// se contaron cuando terminaron.
fn leaf_events(children: &[Task]) -> u64 {
    children
        .iter()
        .filter(|c| c.category() == TaskCategory::Processing)
        .map(|c| c.size())
        .sum()
}

/// Mide el resultado, reporta la tarea y borra sus argumentos. Los resultados
/// de los hijos de una acumulación sólo se borran si salió bien.
fn settle(completed: &mut Completed) {
    let ok = completed.successful();
    if ok {
        completed.task.fout_size = size_mb(&completed.task.output_path);
    }
    report(completed);
    completed.task.cleanup_inputs(ok);
}

fn report(completed: &Completed) {
    let task = &completed.task;
    if completed.successful() {
        debug!(
            "{} {} terminó: {} eventos en {} (status {})",
            task.category(),
            task.label,
            task.size(),
            completed.hostname,
            completed.return_status
        );
    } else {
        let r = &completed.resources;
        warn!(
            "{} {} falló en {}: {:?} (status {}), memoria {} MB, {:.2}s",
            task.category(),
            task.label,
            completed.hostname,
            completed.result,
            completed.return_status,
            r.memory_mb,
            r.wall_time_secs
        );
        debug!("{}", task.debug_info());
    }
}
