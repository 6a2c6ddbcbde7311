use serde::{Deserialize, Serialize};

/// (eventos, tiempo de pared en segundos, memoria en MB) de una tarea de
/// procesamiento exitosa. Es la ventana que alimenta al controlador de chunksize.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub events_count: u64,
    pub wall_time: f64,
    pub memory: f64,
}

/// Contadores de la corrida. Los `events_*` sólo crecen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    pub events_queued: u64,
    pub events_processed: u64,
    pub events_accumulated: u64,
    pub events_total: u64,

    pub original_chunksize: u64,
    pub current_chunksize: u64,

    pub chunks_split: u64,
    pub min_chunksize_after_split: Option<u64>,
    pub tasks_retried: u64,
    pub accumulations_submitted: u64,

    /// MB, sólo tareas que consumieron resultados intermedios
    pub size_max_input: Option<f64>,
    /// MB
    pub size_max_output: Option<f64>,
}

impl RunningStats {
    pub fn new(events_total: u64, chunksize: u64) -> Self {
        Self {
            events_total,
            original_chunksize: chunksize,
            current_chunksize: chunksize,
            ..Default::default()
        }
    }

    pub fn record_split(&mut self, chunksize: u64) {
        self.chunks_split += 1;
        keep_min(&mut self.min_chunksize_after_split, chunksize);
    }

    pub fn observe_sizes(&mut self, fin_size: f64, fout_size: f64) {
        if fin_size > 0.0 {
            keep_max(&mut self.size_max_input, fin_size);
        }
        keep_max(&mut self.size_max_output, fout_size);
    }

    pub fn all_queued(&self) -> bool {
        self.events_queued >= self.events_total
    }

    pub fn all_processed(&self) -> bool {
        self.events_processed >= self.events_total
    }
}

pub fn keep_min<T: PartialOrd + Copy>(slot: &mut Option<T>, value: T) {
    match slot {
        Some(current) if *current <= value => {}
        _ => *slot = Some(value),
    }
}

pub fn keep_max<T: PartialOrd + Copy>(slot: &mut Option<T>, value: T) {
    match slot {
        Some(current) if *current >= value => {}
        _ => *slot = Some(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_y_max_se_inicializan_con_el_primer_valor() {
        let mut s = RunningStats::new(100, 8);
        assert_eq!(s.current_chunksize, 8);
        assert_eq!(s.min_chunksize_after_split, None);

        s.record_split(4);
        s.record_split(6);
        s.record_split(2);
        assert_eq!(s.chunks_split, 3);
        assert_eq!(s.min_chunksize_after_split, Some(2));
    }

    #[test]
    fn observe_sizes_ignora_input_cero() {
        let mut s = RunningStats::default();
        s.observe_sizes(0.0, 1.5);
        assert_eq!(s.size_max_input, None);
        assert_eq!(s.size_max_output, Some(1.5));

        s.observe_sizes(3.0, 0.5);
        assert_eq!(s.size_max_input, Some(3.0));
        assert_eq!(s.size_max_output, Some(1.5));
    }

    #[test]
    fn all_queued_y_all_processed() {
        let mut s = RunningStats::new(10, 5);
        assert!(!s.all_queued());
        s.events_queued = 10;
        assert!(s.all_queued());
        s.events_processed = 12;
        assert!(s.all_processed());
    }
}
