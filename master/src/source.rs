use common::WorkItem;

/// Fuente de items reanudable. Con chunksize dinámico recibe un tamaño
/// sugerido en cada pedido; si no, es una secuencia simple.
pub trait ItemSource {
    fn next_item(&mut self, hint: Option<u64>) -> Option<WorkItem>;
}

/// Secuencia hacia adelante que ignora el tamaño sugerido.
pub struct Sequence<I> {
    inner: I,
}

impl<I: Iterator<Item = WorkItem>> Sequence<I> {
    pub fn new(inner: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            inner: inner.into_iter(),
        }
    }
}

impl<I: Iterator<Item = WorkItem>> ItemSource for Sequence<I> {
    fn next_item(&mut self, _hint: Option<u64>) -> Option<WorkItem> {
        self.inner.next()
    }
}

/// Corta archivos preprocesados (items con rango `[0, entries)`) en chunks.
///
/// Para `r` entradas restantes y objetivo `t` devuelve
/// `ceil(r / max(round(r / t), 1))`, así los chunks de un archivo salen parejos.
pub struct ChunkedFiles {
    files: Vec<WorkItem>,
    base_chunksize: u64,
    current: usize,
    offset: u64,
}

impl ChunkedFiles {
    pub fn new(files: Vec<WorkItem>, base_chunksize: u64) -> Self {
        let mut source = Self {
            files,
            base_chunksize: base_chunksize.max(1),
            current: 0,
            offset: 0,
        };
        source.offset = source.start_of(0);
        source
    }

    /// Total de eventos de todos los archivos.
    pub fn total_events(&self) -> u64 {
        self.files.iter().map(|f| f.len()).sum()
    }

    fn start_of(&self, idx: usize) -> u64 {
        self.files
            .get(idx)
            .and_then(|f| f.entrystart)
            .unwrap_or(0)
    }

    fn stop_of(&self, idx: usize) -> u64 {
        self.files
            .get(idx)
            .map(|f| f.entrystart.unwrap_or(0) + f.len())
            .unwrap_or(0)
    }
}

/// Tamaño del próximo chunk para `remaining` entradas y objetivo `target`.
pub fn even_chunk(remaining: u64, target: u64) -> u64 {
    let target = target.max(1);
    let n = ((remaining as f64 / target as f64).round() as u64).max(1);
    remaining.div_ceil(n)
}

impl ItemSource for ChunkedFiles {
    fn next_item(&mut self, hint: Option<u64>) -> Option<WorkItem> {
        // saltar archivos agotados (o vacíos)
        while self.current < self.files.len() && self.offset >= self.stop_of(self.current) {
            self.current += 1;
            self.offset = self.start_of(self.current);
        }

        let file = self.files.get(self.current)?;
        let stop = self.stop_of(self.current);
        let remaining = stop - self.offset;

        let size = even_chunk(remaining, hint.unwrap_or(self.base_chunksize));
        let item = file.with_range(self.offset, self.offset + size);
        self.offset += size;
        Some(item)
    }
}
