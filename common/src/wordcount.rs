use anyhow::Result;
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::Path,
};

use crate::item::WorkItem;
use crate::processor::Processor;

pub type Counts = BTreeMap<String, u64>;

/// Procesador de demo: cada evento es una línea de un archivo de texto.
pub struct WordCount;

impl Processor for WordCount {
    type Output = Counts;

    fn preprocess(&self, item: &WorkItem) -> Result<u64> {
        Ok(count_lines(&item.filename)?)
    }

    fn process(&self, item: &WorkItem) -> Result<Counts> {
        let start = item.entrystart.unwrap_or(0);
        let stop = item.entrystop.unwrap_or(u64::MAX);
        Ok(wordcount_range(&item.filename, start, stop)?)
    }

    fn accumulate(&self, partial: Counts, mut acc: Counts) -> Counts {
        for (word, count) in partial {
            *acc.entry(word).or_insert(0) += count;
        }
        acc
    }
}

pub fn count_lines(input_path: &str) -> io::Result<u64> {
    let reader = BufReader::new(File::open(input_path)?);
    let mut n = 0;
    for line in reader.lines() {
        line?;
        n += 1;
    }
    Ok(n)
}

/// Cuenta palabras de las líneas `[start, stop)` del archivo.
pub fn wordcount_range(input_path: &str, start: u64, stop: u64) -> io::Result<Counts> {
    let file = File::open(input_path)?;
    let reader = BufReader::new(file);

    let mut counts = Counts::new();

    for line in reader
        .lines()
        .skip(start as usize)
        .take(stop.saturating_sub(start) as usize)
    {
        let line = line?;
        for raw in line.split_whitespace() {
            // limpiar: solo alfanumérico y '_', en minúscula
            let cleaned: String = raw
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect::<String>()
                .to_lowercase();

            if !cleaned.is_empty() {
                *counts.entry(cleaned).or_insert(0) += 1;
            }
        }
    }

    Ok(counts)
}

/// Escribe "palabra,conteo" ordenado por palabra.
pub fn write_counts_csv(counts: &Counts, output_path: &str) -> io::Result<()> {
    // Crear carpeta de salida si hace falta
    if let Some(parent) = Path::new(output_path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let out_file = File::create(output_path)?;
    let mut writer = BufWriter::new(out_file);

    for (word, count) in counts {
        writeln!(writer, "{},{}", word, count)?;
    }

    writer.flush()?;
    Ok(())
}
