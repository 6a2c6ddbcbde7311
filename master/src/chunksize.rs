//! Chunksize dinámico.
//!
//! Con cada tarea de procesamiento que termina se guarda un `TaskReport`. A
//! partir de esos reportes se ajusta una recta eventos ~ recurso para cada
//! objetivo configurado (tiempo de pared, memoria) y se elige el chunksize que
//! respeta el objetivo más ajustado, redondeado hacia abajo a potencia de 2.

use common::TaskReport;
use rand::Rng;

use crate::config::ResourceTargets;

/// Potencia de 2 más grande que no supera `value`; 1 si `value < 1`.
pub fn floor_to_pow2(value: f64) -> u64 {
    if !(value >= 1.0) {
        return 1;
    }
    if value >= u64::MAX as f64 {
        return 1 << 63;
    }
    let v = value as u64;
    1 << (63 - v.leading_zeros())
}

/// Para explorar tamaños: 90% de las veces el chunksize actual, 10% la mitad.
/// Sirve cuando todos los archivos tienen justo un múltiplo del chunksize.
pub fn sample_chunksize<R: Rng>(rng: &mut R, chunksize: u64) -> u64 {
    if rng.gen_bool(0.1) {
        (chunksize / 2).max(1)
    } else {
        chunksize
    }
}

/// Cuantil "nearest" (índice redondeado, empates al par) sobre datos ordenados.
fn quantile_nearest(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor();
    let frac = pos - lo;
    let idx = if frac > 0.5 || (frac == 0.5 && (lo as usize) % 2 == 1) {
        lo as usize + 1
    } else {
        lo as usize
    };
    sorted[idx.min(sorted.len() - 1)]
}

/// Regresión lineal simple de `y` contra `x`. `None` con menos de dos
/// puntos; con todas las `x` iguales la pendiente queda NaN.
fn linregress(xs: &[f64], ys: &[f64]) -> Option<(f64, f64)> {
    let n = xs.len();
    if n < 2 || n != ys.len() {
        return None;
    }
    let nf = n as f64;
    let mean_x = xs.iter().sum::<f64>() / nf;
    let mean_y = ys.iter().sum::<f64>() / nf;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        sxx += (x - mean_x) * (x - mean_x);
        sxy += (x - mean_x) * (y - mean_y);
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    Some((slope, intercept))
}

/// Chunksize candidato para un objetivo, a partir de pares (recurso, eventos).
///
/// `None` si no hay datos o si el recurso no se midió (primer valor negativo).
pub fn compute_chunksize_target(target: f64, pairs: &[(f64, f64)]) -> Option<f64> {
    if pairs.is_empty() || pairs[0].0 < 0.0 {
        return None;
    }

    // eventos por unidad de recurso
    let rates: Vec<f64> = pairs.iter().map(|(r, e)| e / r.max(1.0)).collect();
    let mut sorted = rates.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let q25 = quantile_nearest(&sorted, 0.25);
    let median = quantile_nearest(&sorted, 0.5);

    // los más lentos (debajo del 25%) no entran en el ajuste
    let (xs, ys): (Vec<f64>, Vec<f64>) = pairs
        .iter()
        .zip(&rates)
        .filter(|(_, rate)| **rate >= q25)
        .map(|(p, _)| *p)
        .unzip();

    let (slope, intercept) = match linregress(&xs, &ys) {
        // eventos y recurso tienen que crecer juntos con overhead no negativo;
        // si no, el ajuste es ruido y usamos el rate mediano
        Some((s, i)) if s.is_finite() && i.is_finite() && s >= 0.0 && i <= 0.0 => (s, i),
        _ => (median, 0.0),
    };

    Some(slope * target + intercept)
}

/// Chunksize para los objetivos dados; `base` si ninguno da un candidato.
pub fn compute_chunksize(
    base: u64,
    targets: Option<&ResourceTargets>,
    reports: &[TaskReport],
) -> u64 {
    let mut candidates: Vec<f64> = Vec::new();

    if let Some(targets) = targets {
        if reports.len() > 1 {
            if let Some(t) = targets.wall_time {
                let pairs: Vec<(f64, f64)> = reports
                    .iter()
                    .map(|r| (r.wall_time, r.events_count as f64))
                    .collect();
                candidates.extend(compute_chunksize_target(t, &pairs));
            }
            if let Some(m) = targets.memory {
                let pairs: Vec<(f64, f64)> = reports
                    .iter()
                    .map(|r| (r.memory, r.events_count as f64))
                    .collect();
                candidates.extend(compute_chunksize_target(m, &pairs));
            }
        }
    }

    let chosen = candidates
        .into_iter()
        .filter(|c| *c != 0.0)
        .reduce(f64::min);

    match chosen {
        Some(c) if c.is_finite() => floor_to_pow2(c),
        Some(_) => base,
        None => floor_to_pow2(base as f64),
    }
}

/// Mantiene el chunksize actual y la ventana de reportes de la fase de
/// procesamiento.
#[derive(Debug, Clone)]
pub struct ChunksizeController {
    base: u64,
    current: u64,
    targets: Option<ResourceTargets>,
    reports: Vec<TaskReport>,
}

impl ChunksizeController {
    pub fn new(base: u64, targets: Option<ResourceTargets>) -> Self {
        let base = base.max(1);
        Self {
            base,
            current: base,
            targets,
            reports: Vec::new(),
        }
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn is_dynamic(&self) -> bool {
        self.targets.is_some()
    }

    pub fn reports(&self) -> &[TaskReport] {
        &self.reports
    }

    pub fn record(&mut self, report: TaskReport) {
        self.reports.push(report);
    }

    /// Recalcula el chunksize si es dinámico. Devuelve el valor vigente.
    pub fn update(&mut self) -> u64 {
        if self.targets.is_some() {
            self.current = compute_chunksize(self.base, self.targets.as_ref(), &self.reports);
        }
        self.current
    }

    /// Chunksize a pedirle a la fuente de items. `None` si no es dinámico.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Option<u64> {
        self.is_dynamic()
            .then(|| sample_chunksize(rng, self.current))
    }
}
