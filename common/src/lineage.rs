use serde::Serialize;
use std::{fs::File, path::Path};

use crate::task::{Task, TaskKind};

const HEADER: [&str; 14] = [
    "id",
    "category",
    "status",
    "dataset",
    "file",
    "range_start",
    "range_stop",
    "accum_parent",
    "time_start",
    "time_end",
    "cpu_time",
    "memory",
    "fin",
    "fout",
];

/// Fila del log de linaje: qué tarea terminó y en qué acumulación quedó.
#[derive(Debug, Serialize)]
pub struct LineageRecord {
    pub id: String,
    pub category: String,
    pub status: String,
    pub dataset: String,
    pub file: String,
    pub range_start: u64,
    pub range_stop: u64,
    pub accum_parent: String,
    pub time_start: String,
    pub time_end: String,
    pub cpu_time: f64,
    pub memory: f64,
    pub fin: f64,
    pub fout: f64,
}

impl LineageRecord {
    pub fn from_task(task: &Task, status: &str, accum_parent: &str) -> Self {
        let (dataset, file, start, stop) = match &task.kind {
            TaskKind::Preprocessing { item } | TaskKind::Processing { item } => (
                item.dataset.clone(),
                item.filename.clone(),
                item.entrystart.unwrap_or(0),
                item.entrystop.unwrap_or(0),
            ),
            TaskKind::Accumulating { .. } => (String::new(), String::new(), 0, task.size()),
        };

        let (time_start, time_end, cpu_time, memory) = match &task.resources {
            Some(r) => (
                r.start.to_rfc3339(),
                r.end.to_rfc3339(),
                r.cpu_time_secs,
                r.memory_mb,
            ),
            None => (String::new(), String::new(), 0.0, -1.0),
        };

        Self {
            id: task.label.clone(),
            category: task.category().to_string(),
            status: status.to_string(),
            dataset,
            file,
            range_start: start,
            range_stop: stop,
            accum_parent: accum_parent.to_string(),
            time_start,
            time_end,
            cpu_time,
            memory,
            fin: task.fin_size,
            fout: task.fout_size,
        }
    }
}

/// Log CSV sólo de escritura. Nunca se vuelve a leer durante la corrida.
pub struct LineageLog {
    writer: csv::Writer<File>,
}

impl LineageLog {
    /// Crea (o trunca) el archivo y escribe el encabezado.
    pub fn create(path: &Path) -> csv::Result<Self> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)?;
        writer.write_record(HEADER)?;
        writer.flush()?;
        Ok(Self { writer })
    }

    pub fn record(&mut self, task: &Task, status: &str, accum_parent: &str) -> csv::Result<()> {
        self.writer
            .serialize(LineageRecord::from_task(task, status, accum_parent))?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::WorkItem;
    use crate::staging::Staging;
    use std::fs;

    #[test]
    fn escribe_encabezado_y_filas() {
        let staging = Staging::new(None).unwrap();
        let log_path = staging.path().join("lineage.csv");
        let mut log = LineageLog::create(&log_path).unwrap();

        let item = WorkItem::file("zz", "data/a.txt", "lines").with_range(10, 20);
        let t = Task::processing(&staging, item, 1).unwrap();
        log.record(&t, "done", "accum_9").unwrap();

        let content = fs::read_to_string(&log_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("id,category,status,dataset,file"));

        let cols: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(cols.len(), 14);
        assert_eq!(cols[1], "processing");
        assert_eq!(cols[2], "done");
        assert_eq!(cols[3], "zz");
        assert_eq!(cols[5], "10");
        assert_eq!(cols[6], "20");
        assert_eq!(cols[7], "accum_9");
        // sin medición: memoria centinela
        assert_eq!(cols[11], "-1.0");
    }

    #[test]
    fn acumulacion_usa_rango_cero_a_tamano() {
        let staging = Staging::new(None).unwrap();
        let base = WorkItem::file("zz", "a", "t");
        let a = Task::processing(&staging, base.with_range(0, 3), 0).unwrap();
        let b = Task::processing(&staging, base.with_range(3, 7), 0).unwrap();
        let acc = Task::accumulating(&staging, vec![a, b], 0).unwrap();

        let rec = LineageRecord::from_task(&acc, "accumulated", "0");
        assert_eq!(rec.category, "accumulating");
        assert_eq!((rec.range_start, rec.range_stop), (0, 7));
        assert!(rec.dataset.is_empty());
    }
}
