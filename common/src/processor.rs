use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

use crate::item::WorkItem;
use crate::staging::{read_json, write_json};
use crate::task::TaskArgs;

/// Las tres funciones de usuario que corren las tareas.
///
/// `accumulate` tiene que ser asociativa: el orden y la composición de los
/// grupos de acumulación cambian de corrida a corrida.
pub trait Processor: Send + Sync + 'static {
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Cantidad de entradas (eventos) del archivo del item.
    fn preprocess(&self, item: &WorkItem) -> Result<u64>;

    fn process(&self, item: &WorkItem) -> Result<Self::Output>;

    fn accumulate(&self, partial: Self::Output, acc: Self::Output) -> Self::Output;
}

/// Lee los resultados en disco y los acumula sobre `accumulator`.
/// Devuelve `None` sólo si no había nada que acumular.
pub fn accumulate_result_files<P: Processor>(
    processor: &P,
    files: &[PathBuf],
    accumulator: Option<P::Output>,
) -> Result<Option<P::Output>> {
    let mut acc = accumulator;
    for f in files.iter().rev() {
        let result: P::Output =
            read_json(f).with_context(|| format!("leyendo resultado {}", f.display()))?;

        acc = Some(match acc {
            None => result,
            Some(a) => processor.accumulate(result, a),
        });
    }
    Ok(acc)
}

/// Lo que corre del lado del worker: lee los argumentos, ejecuta y deja el
/// resultado en `output_path`.
pub fn execute_task_args<P: Processor>(
    processor: &P,
    args_path: &Path,
    output_path: &Path,
) -> Result<()> {
    let args: TaskArgs = read_json(args_path)
        .with_context(|| format!("leyendo argumentos {}", args_path.display()))?;

    match args {
        TaskArgs::Preprocess { item } => {
            let entries = processor.preprocess(&item)?;
            write_json(output_path, &entries)?;
        }
        TaskArgs::Process { item } => {
            let out = processor.process(&item)?;
            write_json(output_path, &out)?;
        }
        TaskArgs::Accumulate { inputs } => {
            let out = accumulate_result_files(processor, &inputs, None)?
                .context("acumulación sin entradas")?;
            write_json(output_path, &out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::staging::Staging;
    use crate::task::Task;

    /// Procesador mínimo: la salida es la suma de los índices del rango.
    pub struct SumRange;

    impl Processor for SumRange {
        type Output = u64;

        fn preprocess(&self, _item: &WorkItem) -> Result<u64> {
            Ok(10)
        }

        fn process(&self, item: &WorkItem) -> Result<u64> {
            let start = item.entrystart.unwrap_or(0);
            let stop = item.entrystop.unwrap_or(0);
            Ok((start..stop).sum())
        }

        fn accumulate(&self, partial: u64, acc: u64) -> u64 {
            partial + acc
        }
    }

    #[test]
    fn execute_task_args_procesa_y_acumula() {
        let staging = Staging::new(None).unwrap();
        let base = WorkItem::file("ds", "f", "t");

        let a = Task::processing(&staging, base.with_range(0, 5), 0).unwrap();
        let b = Task::processing(&staging, base.with_range(5, 10), 0).unwrap();
        execute_task_args(&SumRange, &a.args_path, &a.output_path).unwrap();
        execute_task_args(&SumRange, &b.args_path, &b.output_path).unwrap();

        let acc = Task::accumulating(&staging, vec![a, b], 0).unwrap();
        execute_task_args(&SumRange, &acc.args_path, &acc.output_path).unwrap();

        let total: u64 = read_json(&acc.output_path).unwrap();
        assert_eq!(total, (0..10).sum::<u64>());
    }

    #[test]
    fn accumulate_result_files_usa_acumulador_inicial() {
        let staging = Staging::new(None).unwrap();
        let path = staging.output_path("x_1");
        write_json(&path, &7u64).unwrap();

        let acc = accumulate_result_files(&SumRange, &[path], Some(100)).unwrap();
        assert_eq!(acc, Some(107));

        let empty = accumulate_result_files(&SumRange, &[], None).unwrap();
        assert_eq!(empty, None);
    }

    #[test]
    fn execute_task_args_falla_sin_argumentos() {
        let staging = Staging::new(None).unwrap();
        let res = execute_task_args(
            &SumRange,
            &staging.args_path("nada"),
            &staging.output_path("nada"),
        );
        assert!(res.is_err());
    }
}
