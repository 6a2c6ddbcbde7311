use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};
use tempfile::TempDir;
use tracing::warn;

/// Directorio temporal donde viven los argumentos y resultados de cada tarea.
/// Se borra solo cuando se destruye (junto con la sesión que lo creó).
pub struct Staging {
    dir: TempDir,
    counter: AtomicU64,
}

impl Staging {
    /// Crea el directorio de staging dentro de `parent` (o en el tmp del sistema).
    pub fn new(parent: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("accum-tmp-");

        let dir = match parent {
            Some(p) => {
                fs::create_dir_all(p)?;
                builder.tempdir_in(p)?
            }
            None => builder.tempdir()?,
        };

        Ok(Self {
            dir,
            counter: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Siguiente etiqueta legible para una tarea, ej: "p_12", "accum_13".
    /// El contador es compartido entre categorías, como los ids de la cola.
    pub fn next_label(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}_{}", prefix, n)
    }

    pub fn args_path(&self, label: &str) -> PathBuf {
        self.path().join(format!("args_{}.json", label))
    }

    pub fn output_path(&self, label: &str) -> PathBuf {
        self.path().join(format!("out_{}.json", label))
    }
}

/* =========================
   Helpers de archivos
   ========================= */

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, value).map_err(|e| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("error al escribir {}: {e}", path.display()),
        )
    })?;
    writer.flush()
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("error al parsear {}: {e}", path.display()),
        )
    })
}

/// Borra un artefacto. Que ya no exista no es un error.
pub fn remove_artifact(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("no se pudo borrar {}: {}", path.display(), e);
        }
    }
}

/// Tamaño del archivo en MB (0 si no existe).
pub fn size_mb(path: &Path) -> f64 {
    fs::metadata(path)
        .map(|m| m.len() as f64 / 1e6)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_son_unicos_y_con_prefijo() {
        let staging = Staging::new(None).unwrap();
        assert_eq!(staging.next_label("p"), "p_1");
        assert_eq!(staging.next_label("accum"), "accum_2");
        assert!(staging
            .args_path("p_1")
            .ends_with("args_p_1.json"));
    }

    #[test]
    fn write_y_read_json_y_borrado() {
        let staging = Staging::new(None).unwrap();
        let path = staging.output_path("x_1");

        write_json(&path, &vec![1u64, 2, 3]).unwrap();
        assert!(size_mb(&path) > 0.0);

        let back: Vec<u64> = read_json(&path).unwrap();
        assert_eq!(back, vec![1, 2, 3]);

        remove_artifact(&path);
        assert!(!path.exists());
        // segunda vez no explota
        remove_artifact(&path);
        assert_eq!(size_mb(&path), 0.0);
    }

    #[test]
    fn el_directorio_se_borra_al_soltar_staging() {
        let staging = Staging::new(None).unwrap();
        let dir = staging.path().to_path_buf();
        assert!(dir.exists());
        drop(staging);
        assert!(!dir.exists());
    }
}
