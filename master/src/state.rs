// master/src/state.rs

use common::RunningStats;

use crate::accumulate::AccumulationScheduler;
use crate::chunksize::ChunksizeController;
use crate::config::ExecutorConfig;

/// Estado de la fase de procesamiento. Lo maneja un único hilo de control,
/// así que no lleva locks.
#[derive(Debug)]
pub struct RunState {
    pub stats: RunningStats,
    pub chunksize: ChunksizeController,
    pub accumulator: AccumulationScheduler,

    /// Cancelación pedida: no se somete más procesamiento
    pub draining: bool,
    /// La fuente de items no tiene más nada
    pub source_exhausted: bool,
    /// El primer pedido a la fuente va sin tamaño sugerido
    pub first_pull: bool,
}

impl RunState {
    pub fn new(config: &ExecutorConfig, events_total: u64) -> Self {
        Self {
            stats: RunningStats::new(events_total, config.chunksize),
            chunksize: ChunksizeController::new(
                config.chunksize,
                config.dynamic_chunksize.clone(),
            ),
            accumulator: AccumulationScheduler::new(config.chunks_per_accum),
            draining: false,
            source_exhausted: false,
            first_pull: true,
        }
    }

    /// Se pueden pedir más items a la fuente.
    pub fn may_submit(&self) -> bool {
        !self.draining && !self.source_exhausted && !self.stats.all_queued()
    }

    /// Todo lo que se va a procesar ya se procesó.
    pub fn processing_done(&self) -> bool {
        self.stats.all_processed()
            || (self.source_exhausted && self.stats.events_processed >= self.stats.events_queued)
    }

    /// Las acumulaciones pendientes salen aunque el grupo no esté completo.
    pub fn force_flush(&self) -> bool {
        self.processing_done() || self.draining
    }

    /// El loop termina cuando no queda nada en vuelo y ya no hay más que procesar
    /// (o se está drenando).
    pub fn finished(&self, service_empty: bool) -> bool {
        service_empty && (self.draining || self.processing_done())
    }
}
