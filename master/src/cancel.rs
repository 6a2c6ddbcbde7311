use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};
use tracing::warn;

/// Token de cancelación compartido. La primera señal pide drenar, la segunda
/// aborta.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    signals: Arc<AtomicU8>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra una señal y devuelve cuántas van.
    pub fn signal(&self) -> u8 {
        self.signals.fetch_add(1, Ordering::SeqCst).saturating_add(1)
    }

    pub fn is_cancelled(&self) -> bool {
        self.signals.load(Ordering::SeqCst) >= 1
    }

    pub fn is_aborted(&self) -> bool {
        self.signals.load(Ordering::SeqCst) >= 2
    }
}

/// Escucha Ctrl-C: la primera vez drena, la segunda sale del proceso.
pub fn watch_ctrl_c(token: CancelToken) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            match token.signal() {
                1 => warn!(
                    "cancelación pedida: se terminan las acumulaciones en vuelo. Ctrl-C de nuevo para salir ya"
                ),
                _ => {
                    warn!("segunda señal, saliendo");
                    std::process::exit(130);
                }
            }
        }
    });
}
