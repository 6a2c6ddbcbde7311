use serde::{Deserialize, Serialize};

/// Descriptor inmutable de una porción del dataset.
///
/// `entrystart`/`entrystop` son opcionales: un item de nivel archivo (antes del
/// preprocesamiento) no tiene rango todavía.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub dataset: String,
    /// Ruta o URL del archivo fuente
    pub filename: String,
    /// Nombre del objeto dentro del archivo (tabla, árbol, etc.)
    pub treename: String,
    pub entrystart: Option<u64>,
    pub entrystop: Option<u64>,
    /// Identificador estable del archivo, igual para todos sus chunks
    pub fileuuid: String,
    /// Metadata opaca del usuario
    #[serde(default)]
    pub usermeta: serde_json::Value,
}

impl WorkItem {
    /// Item de nivel archivo, sin rango.
    pub fn file(dataset: &str, filename: &str, treename: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            filename: filename.to_string(),
            treename: treename.to_string(),
            entrystart: None,
            entrystop: None,
            fileuuid: uuid::Uuid::new_v4().to_string(),
            usermeta: serde_json::Value::Null,
        }
    }

    /// Copia del item restringida a `[start, stop)`.
    pub fn with_range(&self, start: u64, stop: u64) -> Self {
        Self {
            entrystart: Some(start),
            entrystop: Some(stop),
            ..self.clone()
        }
    }

    /// Cantidad de eventos que representa el item (0 si no tiene rango).
    pub fn len(&self) -> u64 {
        match (self.entrystart, self.entrystop) {
            (Some(start), Some(stop)) => stop.saturating_sub(start),
            (None, Some(stop)) => stop,
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parte el rango en sub-rangos contiguos de `chunksize` eventos
    /// (el último puede quedar más chico). La unión es exactamente el rango original.
    pub fn split_range(&self, chunksize: u64) -> Vec<WorkItem> {
        let chunksize = chunksize.max(1);
        let start = self.entrystart.unwrap_or(0);
        let stop = self.entrystop.unwrap_or(start);

        let mut out = Vec::new();
        let mut lo = start;
        while lo < stop {
            let hi = stop.min(lo + chunksize);
            out.push(self.with_range(lo, hi));
            lo = hi;
        }
        out
    }

    /// Tupla legible para mensajes de error: (dataset, archivo, árbol, inicio, fin)
    pub fn debug_tuple(&self) -> String {
        format!(
            "({}, {}, {}, {}, {})",
            self.dataset,
            self.filename,
            self.treename,
            self.entrystart.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
            self.entrystop.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
        )
    }
}
