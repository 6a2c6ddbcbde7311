use chrono::Utc;
use common::{
    execute_task_args,
    staging::{remove_artifact, size_mb},
    Completed, ExecResult, MonitorMode, Processor, ResourceUsage, Task, TaskCategory,
    TaskExecutionService, TaskId,
};
use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use sysinfo::{get_current_pid, ProcessExt, System, SystemExt};
use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinHandle,
    time::timeout_at,
};
use tracing::{debug, info, warn};

/// Código de salida de una tarea cuyo cuerpo hizo panic.
const PANIC_STATUS: i32 = 101;

/// Recursos declarados por tarea. Los núcleos reservan slots siempre; memoria,
/// disco y tiempo de pared sólo se controlan en modo watchdog.
#[derive(Debug, Clone, Default)]
pub struct WorkerLimits {
    pub cores: Option<u32>,
    pub memory_mb: Option<f64>,
    pub disk_mb: Option<f64>,
    pub wall_time: Option<Duration>,
}

impl WorkerLimits {
    /// Qué límite se pasó, si alguno.
    fn exceeded(&self, memory_mb: f64, disk_mb: f64) -> Option<String> {
        if let Some(limit) = self.memory_mb.filter(|limit| memory_mb > *limit) {
            return Some(format!("usó {:.1} MB de memoria, el límite es {:.1}", memory_mb, limit));
        }
        if let Some(limit) = self.disk_mb.filter(|limit| disk_mb > *limit) {
            return Some(format!("escribió {:.3} MB, el límite es {:.3}", disk_mb, limit));
        }
        None
    }
}

/// Slots por defecto: uno por CPU.
pub fn default_slots() -> usize {
    let mut sys = System::new();
    sys.refresh_cpu();
    sys.cpus().len().max(1)
}

/// Memoria residente del proceso, en MB.
fn process_memory_mb() -> f64 {
    let Ok(pid) = get_current_pid() else {
        return 0.0;
    };
    let mut sys = System::new();
    sys.refresh_process(pid);
    sys.process(pid)
        .map(|p| p.memory() as f64 / 1e6)
        .unwrap_or(0.0)
}

/// Una tarea en vuelo. `settled` lo marca primero quien decide su destino:
/// el cuerpo al publicar el resultado, o el ejecutor al abandonarla.
struct Running {
    category: TaskCategory,
    handle: JoinHandle<()>,
    settled: Arc<AtomicBool>,
}

/// Servicio de ejecución en el mismo proceso: cada tarea corre en un hilo de
/// bloqueo y reserva `cores` de los `slots` hasta que su cuerpo termina.
pub struct LocalExecutor<P: Processor> {
    processor: Arc<P>,
    slots: usize,
    cores: u32,
    sem: Arc<Semaphore>,
    monitor: MonitorMode,
    limits: WorkerLimits,
    hostname: String,

    running: HashMap<TaskId, Running>,
    tx: mpsc::UnboundedSender<Completed>,
    rx: mpsc::UnboundedReceiver<Completed>,
}

impl<P: Processor> LocalExecutor<P> {
    pub fn new(processor: Arc<P>, slots: usize, monitor: MonitorMode, limits: WorkerLimits) -> Self {
        let slots = slots.max(1);
        let cores = limits.cores.unwrap_or(1).clamp(1, slots as u32);
        let hostname = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        info!(
            "ejecutor local en {} con {} slots, {} por tarea (monitor {:?})",
            hostname, slots, cores, monitor
        );

        Self {
            processor,
            slots,
            cores,
            sem: Arc::new(Semaphore::new(slots)),
            monitor,
            limits,
            hostname,
            running: HashMap::new(),
            tx,
            rx,
        }
    }

    /// Tareas que pueden correr a la vez.
    fn task_slots(&self) -> usize {
        (self.slots / self.cores as usize).max(1)
    }
}

impl<P: Processor> TaskExecutionService for LocalExecutor<P> {
    fn submit(&mut self, task: Task) -> TaskId {
        let id = task.id.clone();
        let category = task.category();
        let settled = Arc::new(AtomicBool::new(false));
        debug!("encolando {} ({})", task.label, category);

        let handle = tokio::spawn(run_task(
            self.processor.clone(),
            task,
            self.sem.clone(),
            self.cores,
            self.monitor,
            self.limits.clone(),
            self.hostname.clone(),
            settled.clone(),
            self.tx.clone(),
        ));
        self.running.insert(
            id.clone(),
            Running {
                category,
                handle,
                settled,
            },
        );
        id
    }

    async fn wait(&mut self, timeout: Duration) -> Option<Completed> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(completed)) => {
                    // las canceladas pueden haber llegado a mandar su resultado
                    if self.running.remove(&completed.task.id).is_some() {
                        return Some(completed);
                    }
                }
                Ok(None) | Err(_) => return None,
            }
        }
    }

    fn cancel_by_category(&mut self, category: TaskCategory) -> usize {
        let ids: Vec<TaskId> = self
            .running
            .iter()
            .filter(|(_, r)| r.category == category)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &ids {
            if let Some(r) = self.running.remove(id) {
                // si el cuerpo sigue corriendo, su salida se descarta
                r.settled.store(true, Ordering::SeqCst);
                r.handle.abort();
            }
        }
        ids.len()
    }

    fn hungry(&self) -> bool {
        self.running.len() < 2 * self.task_slots()
    }

    fn empty(&self) -> bool {
        self.running.is_empty()
    }
}

/// Salida a medio escribir de un intento; sólo se renombra a `output_path`
/// si nadie abandonó el intento.
fn partial_path(task: &Task) -> PathBuf {
    task.output_path.with_extension(format!("{}.part", task.id))
}

/// Corre una tarea cuando hay slots y manda el resultado por el canal.
#[allow(clippy::too_many_arguments)]
async fn run_task<P: Processor>(
    processor: Arc<P>,
    task: Task,
    sem: Arc<Semaphore>,
    cores: u32,
    monitor: MonitorMode,
    limits: WorkerLimits,
    hostname: String,
    settled: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Completed>,
) {
    // 1) esperar slots libres
    let Ok(permit) = sem.acquire_many_owned(cores).await else {
        warn!("semáforo cerrado, descartando {}", task.label);
        return;
    };

    let start = Utc::now();
    let t0 = Instant::now();
    let measure = monitor != MonitorMode::Off;
    let watchdog = monitor == MonitorMode::Watchdog;

    // 2) ejecutar en un hilo de bloqueo; el permiso vive lo que vive el cuerpo
    let args_path = task.args_path.clone();
    let output_path = task.output_path.clone();
    let partial = partial_path(&task);
    let body_limits = limits.clone();
    let body_settled = settled.clone();
    let mut handle = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        let before = if measure { process_memory_mb() } else { 0.0 };
        let res = execute_task_args(processor.as_ref(), &args_path, &partial);
        let after = if measure { process_memory_mb() } else { 0.0 };
        let mem = (after - before).max(0.0);

        let over = match (&res, watchdog) {
            (Ok(()), true) => body_limits.exceeded(mem, size_mb(&partial)),
            _ => None,
        };
        if body_settled.swap(true, Ordering::SeqCst) || res.is_err() || over.is_some() {
            remove_artifact(&partial);
            return (res, mem, over);
        }
        let res = res.and_then(|()| fs::rename(&partial, &output_path).map_err(Into::into));
        (res, mem, None)
    });

    let wall_limit = if watchdog { limits.wall_time } else { None };
    let joined = match wall_limit {
        Some(limit) => {
            let waited = tokio::time::timeout(limit, &mut handle).await;
            match waited {
                Ok(j) => Some(j),
                Err(_) if !settled.swap(true, Ordering::SeqCst) => None,
                // el cuerpo terminó justo al vencer el plazo
                Err(_) => Some(handle.await),
            }
        }
        None => Some(handle.await),
    };

    // 3) clasificar
    let (result, return_status, memory_mb) = match joined {
        None => {
            warn!("{} superó el tiempo de pared asignado", task.label);
            (ExecResult::ResourceExhaustion, 0, -1.0)
        }
        Some(Err(e)) => {
            warn!("panic o join error en {}: {:?}", task.label, e);
            remove_artifact(&partial_path(&task));
            (ExecResult::Unknown, PANIC_STATUS, -1.0)
        }
        Some(Ok((Err(e), mem, _))) => {
            warn!("error ejecutando {}: {:#}", task.label, e);
            (ExecResult::Success, 1, mem)
        }
        Some(Ok((Ok(()), mem, Some(why)))) => {
            warn!("{} {}", task.label, why);
            (ExecResult::ResourceExhaustion, 0, mem)
        }
        Some(Ok((Ok(()), mem, None))) => {
            if task.output_path.exists() {
                (ExecResult::Success, 0, mem)
            } else {
                (ExecResult::OutputMissing, 0, mem)
            }
        }
    };

    let wall_time_secs = t0.elapsed().as_secs_f64();
    let resources = if measure {
        ResourceUsage {
            cores: cores as f64,
            memory_mb,
            disk_mb: size_mb(&task.output_path),
            wall_time_secs,
            // las tareas corren en un solo hilo
            cpu_time_secs: wall_time_secs,
            start,
            end: Utc::now(),
        }
    } else {
        ResourceUsage {
            wall_time_secs,
            start,
            end: Utc::now(),
            ..ResourceUsage::unmeasured()
        }
    };

    // 4) avisar; si nadie escucha la corrida ya terminó
    let _ = tx.send(Completed {
        task,
        result,
        return_status,
        resources,
        hostname,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use common::{staging::read_json, Staging, WorkItem};
    use std::sync::atomic::AtomicUsize;

    /// Suma el rango. "boom" falla, "panic" hace panic, "lento" tarda y
    /// "gordo" deja 64 MB reservados.
    struct Toy;

    impl Processor for Toy {
        type Output = u64;

        fn preprocess(&self, _item: &WorkItem) -> Result<u64> {
            Ok(3)
        }

        fn process(&self, item: &WorkItem) -> Result<u64> {
            match item.filename.as_str() {
                "boom" => bail!("archivo roto"),
                "panic" => panic!("explotó"),
                "lento" => std::thread::sleep(Duration::from_millis(400)),
                "gordo" => std::mem::forget(vec![1u8; 64 << 20]),
                _ => {}
            }
            Ok((item.entrystart.unwrap_or(0)..item.entrystop.unwrap_or(0)).sum())
        }

        fn accumulate(&self, partial: u64, acc: u64) -> u64 {
            partial + acc
        }
    }

    /// Anota cuántos cuerpos corren a la vez. Cada uno tarda 150 ms.
    #[derive(Default)]
    struct Counting {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Processor for Counting {
        type Output = u64;

        fn preprocess(&self, _item: &WorkItem) -> Result<u64> {
            Ok(1)
        }

        fn process(&self, _item: &WorkItem) -> Result<u64> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(150));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(0)
        }

        fn accumulate(&self, partial: u64, acc: u64) -> u64 {
            partial + acc
        }
    }

    fn leftover_parts(staging: &Staging) -> usize {
        std::fs::read_dir(staging.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().extension().is_some_and(|x| x == "part"))
            .count()
    }

    fn task(staging: &Staging, name: &str) -> Task {
        let item = WorkItem::file("ds", name, "lines").with_range(0, 5);
        Task::processing(staging, item, 1).unwrap()
    }

    fn executor(slots: usize, monitor: MonitorMode, limits: WorkerLimits) -> LocalExecutor<Toy> {
        LocalExecutor::new(Arc::new(Toy), slots, monitor, limits)
    }

    #[tokio::test]
    async fn ejecuta_y_deja_el_resultado() {
        let staging = Staging::new(None).unwrap();
        let mut exec = executor(2, MonitorMode::Off, WorkerLimits::default());

        let t = task(&staging, "ok");
        let id = exec.submit(t);
        assert!(!exec.empty());

        let done = exec.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.task.id, id);
        assert!(done.successful());
        assert_eq!(done.resources.memory_mb, -1.0);
        assert!(!done.hostname.is_empty());
        assert!(exec.empty());

        let out: u64 = read_json(&done.task.output_path).unwrap();
        assert_eq!(out, 10);
    }

    #[tokio::test]
    async fn error_del_procesador_es_status_uno() {
        let staging = Staging::new(None).unwrap();
        let mut exec = executor(1, MonitorMode::Measure, WorkerLimits::default());

        exec.submit(task(&staging, "boom"));
        let done = exec.wait(Duration::from_secs(5)).await.unwrap();
        assert!(!done.successful());
        assert_eq!(done.return_status, 1);
        assert!(done.resources.memory_mb >= 0.0);
    }

    #[tokio::test]
    async fn panic_no_tira_el_ejecutor() {
        let staging = Staging::new(None).unwrap();
        let mut exec = executor(1, MonitorMode::Off, WorkerLimits::default());

        exec.submit(task(&staging, "panic"));
        exec.submit(task(&staging, "ok"));

        let first = exec.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(first.return_status, PANIC_STATUS);
        let second = exec.wait(Duration::from_secs(5)).await.unwrap();
        assert!(second.successful());
    }

    #[tokio::test]
    async fn watchdog_corta_por_tiempo() {
        let staging = Staging::new(None).unwrap();
        let limits = WorkerLimits {
            wall_time: Some(Duration::from_millis(50)),
            ..WorkerLimits::default()
        };
        let mut exec = executor(1, MonitorMode::Watchdog, limits);

        exec.submit(task(&staging, "lento"));
        let done = exec.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.result, ExecResult::ResourceExhaustion);
        assert!(!done.successful());
    }

    #[tokio::test]
    async fn measure_no_corta_por_tiempo() {
        let staging = Staging::new(None).unwrap();
        let limits = WorkerLimits {
            wall_time: Some(Duration::from_millis(50)),
            ..WorkerLimits::default()
        };
        let mut exec = executor(1, MonitorMode::Measure, limits);

        exec.submit(task(&staging, "lento"));
        let done = exec.wait(Duration::from_secs(5)).await.unwrap();
        assert!(done.successful());
        assert!(done.resources.wall_time_secs >= 0.4);
    }

    #[tokio::test]
    async fn cancelar_por_categoria_descarta_las_tareas() {
        let staging = Staging::new(None).unwrap();
        let mut exec = executor(1, MonitorMode::Off, WorkerLimits::default());

        let a = task(&staging, "lento");
        let b = task(&staging, "lento");
        let outputs = [a.output_path.clone(), b.output_path.clone()];
        exec.submit(a);
        exec.submit(b);
        assert!(!exec.hungry());

        // que el primer cuerpo llegue a arrancar
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(exec.cancel_by_category(TaskCategory::Accumulating), 0);
        assert_eq!(exec.cancel_by_category(TaskCategory::Processing), 2);
        assert!(exec.empty());
        assert!(exec.hungry());

        // lo cancelado nunca vuelve ni deja salida
        assert!(exec.wait(Duration::from_millis(600)).await.is_none());
        assert!(outputs.iter().all(|p| !p.exists()));
        assert_eq!(leftover_parts(&staging), 0);
    }

    #[tokio::test]
    async fn watchdog_retiene_el_slot_hasta_que_termina_el_cuerpo() {
        let staging = Staging::new(None).unwrap();
        let limits = WorkerLimits {
            wall_time: Some(Duration::from_millis(50)),
            ..WorkerLimits::default()
        };
        let counting = Arc::new(Counting::default());
        let mut exec = LocalExecutor::new(counting.clone(), 1, MonitorMode::Watchdog, limits);

        let tasks: Vec<Task> = (0..3).map(|i| task(&staging, &format!("t{}", i))).collect();
        let outputs: Vec<PathBuf> = tasks.iter().map(|t| t.output_path.clone()).collect();
        for t in tasks {
            exec.submit(t);
        }
        for _ in 0..3 {
            let done = exec.wait(Duration::from_secs(5)).await.unwrap();
            assert_eq!(done.result, ExecResult::ResourceExhaustion);
        }

        // los cuerpos cortados siguen hasta terminar, de a uno
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(counting.peak.load(Ordering::SeqCst), 1);
        assert_eq!(counting.active.load(Ordering::SeqCst), 0);
        assert!(outputs.iter().all(|p| !p.exists()));
        assert_eq!(leftover_parts(&staging), 0);
    }

    #[tokio::test]
    async fn watchdog_corta_por_memoria() {
        let staging = Staging::new(None).unwrap();
        let limits = WorkerLimits {
            memory_mb: Some(1.0),
            ..WorkerLimits::default()
        };
        let mut exec = executor(1, MonitorMode::Watchdog, limits);

        let t = task(&staging, "gordo");
        let output = t.output_path.clone();
        exec.submit(t);
        let done = exec.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.result, ExecResult::ResourceExhaustion);
        assert_eq!(done.return_status, 0);
        assert!(done.resources.memory_mb > 1.0);
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn measure_no_corta_por_memoria() {
        let staging = Staging::new(None).unwrap();
        let limits = WorkerLimits {
            memory_mb: Some(1.0),
            ..WorkerLimits::default()
        };
        let mut exec = executor(1, MonitorMode::Measure, limits);

        exec.submit(task(&staging, "gordo"));
        let done = exec.wait(Duration::from_secs(5)).await.unwrap();
        assert!(done.successful());
        assert!(done.task.output_path.exists());
    }

    #[tokio::test]
    async fn watchdog_corta_por_disco() {
        let staging = Staging::new(None).unwrap();
        let limits = WorkerLimits {
            disk_mb: Some(0.0),
            ..WorkerLimits::default()
        };
        let mut exec = executor(1, MonitorMode::Watchdog, limits);

        exec.submit(task(&staging, "ok"));
        let done = exec.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.result, ExecResult::ResourceExhaustion);
        assert!(!done.task.output_path.exists());
    }

    #[tokio::test]
    async fn cores_reservan_varios_slots() {
        let staging = Staging::new(None).unwrap();
        let limits = WorkerLimits {
            cores: Some(2),
            ..WorkerLimits::default()
        };
        let counting = Arc::new(Counting::default());
        let mut exec = LocalExecutor::new(counting.clone(), 2, MonitorMode::Measure, limits);

        exec.submit(task(&staging, "a"));
        assert!(exec.hungry());
        exec.submit(task(&staging, "b"));
        // una tarea a la vez, dos en vuelo como mucho
        assert!(!exec.hungry());

        for _ in 0..2 {
            let done = exec.wait(Duration::from_secs(5)).await.unwrap();
            assert!(done.successful());
            assert_eq!(done.resources.cores, 2.0);
        }
        assert_eq!(counting.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_vence_sin_tareas() {
        let mut exec = executor(1, MonitorMode::Off, WorkerLimits::default());
        assert!(exec.wait(Duration::from_millis(20)).await.is_none());
    }

    #[test]
    fn default_slots_al_menos_uno() {
        assert!(default_slots() >= 1);
    }
}
