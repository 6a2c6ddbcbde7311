use common::Task;
use std::mem;

/// Decide qué resultados terminados se juntan en una tarea de acumulación.
///
/// Los grupos son de a `chunks_per_accum`, ordenados por tamaño de resultado
/// para que se junten los chicos con los chicos.
#[derive(Debug)]
pub struct AccumulationScheduler {
    chunks_per_accum: usize,
    pending: Vec<Task>,
}

impl AccumulationScheduler {
    pub fn new(chunks_per_accum: usize) -> Self {
        Self {
            chunks_per_accum: chunks_per_accum.max(2),
            pending: Vec::new(),
        }
    }

    /// Agrega un resultado listo para acumular.
    pub fn push(&mut self, task: Task) {
        self.pending.push(task);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Saca los grupos listos para acumular. Con `force` también salen los
    /// grupos incompletos (de al menos 2).
    pub fn schedule(&mut self, force: bool) -> Vec<Vec<Task>> {
        let k = self.chunks_per_accum;

        // sin fuerza esperamos a tener margen para grupos completos
        if self.pending.len() < 2 * k - 1 && !force {
            return Vec::new();
        }

        let mut pending = mem::take(&mut self.pending);
        pending.sort_by(|a, b| a.fout_size.total_cmp(&b.fout_size));

        let mut groups = Vec::new();
        let mut iter = pending.into_iter().peekable();
        while iter.peek().is_some() {
            let group: Vec<Task> = iter.by_ref().take(k).collect();
            if group.len() < 2 || (group.len() < k && !force) {
                self.pending.extend(group);
            } else {
                groups.push(group);
            }
        }
        groups
    }

    /// Vacía lo pendiente (para la acumulación final local).
    pub fn drain(&mut self) -> Vec<Task> {
        mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Staging, WorkItem};

    fn done(staging: &Staging, start: u64, size: f64) -> Task {
        let item = WorkItem::file("ds", "f", "t").with_range(start, start + 1);
        let mut t = Task::processing(staging, item, 0).unwrap();
        t.fout_size = size;
        t
    }

    #[test]
    fn no_agenda_por_debajo_del_umbral() {
        let staging = Staging::new(None).unwrap();
        let mut sched = AccumulationScheduler::new(3);
        for i in 0..4 {
            sched.push(done(&staging, i, 1.0));
        }
        // 4 < 2*3-1
        assert!(sched.schedule(false).is_empty());
        assert_eq!(sched.len(), 4);
    }

    #[test]
    fn agrupa_por_tamano_y_deja_el_resto() {
        let staging = Staging::new(None).unwrap();
        let mut sched = AccumulationScheduler::new(2);
        for (i, size) in [5.0, 1.0, 4.0, 2.0, 3.0].into_iter().enumerate() {
            sched.push(done(&staging, i as u64, size));
        }

        let groups = sched.schedule(false);
        let sizes: Vec<Vec<f64>> = groups
            .iter()
            .map(|g| g.iter().map(|t| t.fout_size).collect())
            .collect();
        assert_eq!(sizes, vec![vec![1.0, 2.0], vec![3.0, 4.0]]);

        // el más grande queda esperando compañía
        assert_eq!(sched.len(), 1);
    }

    #[test]
    fn force_emite_grupos_incompletos_pero_no_singletons() {
        let staging = Staging::new(None).unwrap();
        let mut sched = AccumulationScheduler::new(4);
        for i in 0..3 {
            sched.push(done(&staging, i, i as f64));
        }
        let groups = sched.schedule(true);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);
        assert!(sched.is_empty());

        sched.push(done(&staging, 9, 1.0));
        assert!(sched.schedule(true).is_empty());
        assert_eq!(sched.drain().len(), 1);
    }

    #[test]
    fn cada_resultado_se_acumula_una_sola_vez() {
        // simula el árbol: cada grupo emitido vuelve como un resultado nuevo
        let staging = Staging::new(None).unwrap();
        let k = 3;
        let mut sched = AccumulationScheduler::new(k);
        for i in 0..17 {
            sched.push(done(&staging, i, 1.0));
        }

        let mut emitted_leaves = 0u64;
        loop {
            let groups = sched.schedule(true);
            if groups.is_empty() {
                break;
            }
            for g in groups {
                assert!(g.len() >= 2 && g.len() <= k);
                let acc = Task::accumulating(&staging, g, 0).unwrap();
                emitted_leaves = acc.size();
                sched.push(acc);
            }
        }

        let rest = sched.drain();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].size(), 17);
        assert_eq!(emitted_leaves, 17);
    }
}
