/*!
 * Exact-duplicate removal for filtered rows
 *
 * Two rows are duplicates only when every column holds the same string; rows
 * that merely share an NPI are kept. The first occurrence wins and order is
 * preserved. The working set is unbounded, which is fine after filtering.
 */

use std::collections::HashSet;
use std::fs::File;
use std::path::Path;

use csv::{ReaderBuilder, WriterBuilder};
use tracing::info;

use crate::data_types::RawRow;
use crate::{IngestError, Result};

/// Iterator adapter dropping rows already seen
#[derive(Debug)]
pub struct Dedup<I> {
    inner: I,
    seen: HashSet<RawRow>,
    duplicates: usize,
}

impl<I> Dedup<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            seen: HashSet::new(),
            duplicates: 0,
        }
    }

    /// Rows dropped so far
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }
}

impl<I: Iterator<Item = RawRow>> Iterator for Dedup<I> {
    type Item = RawRow;

    fn next(&mut self) -> Option<RawRow> {
        for row in self.inner.by_ref() {
            // RawRow clones share their value buffer
            if self.seen.insert(row.clone()) {
                return Some(row);
            }
            self.duplicates += 1;
        }
        None
    }
}

/// Remove exact duplicate rows, keeping first occurrences in order
pub fn dedup<I: IntoIterator<Item = RawRow>>(rows: I) -> Vec<RawRow> {
    Dedup::new(rows.into_iter()).collect()
}

/// Counters for a file-to-file dedup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub rows_before: usize,
    pub rows_after: usize,
}

/// Deduplicate a CSV file (header plus rows) into a new file
pub fn dedup_csv<P: AsRef<Path>, Q: AsRef<Path>>(input: P, output: Q) -> Result<DedupStats> {
    let input = input.as_ref();
    let output = output.as_ref();

    let file = File::open(input).map_err(|e| IngestError::io_at(e, input))?;
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
    let header = reader
        .headers()
        .map_err(|e| IngestError::from(e).with_file(input))?
        .clone();

    let out = File::create(output).map_err(|e| IngestError::io_at(e, output))?;
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(out);
    writer.write_record(&header)?;

    let mut seen = HashSet::new();
    let mut stats = DedupStats::default();
    for record in reader.records() {
        let record = record.map_err(|e| IngestError::from(e).with_file(input))?;
        stats.rows_before += 1;
        let key: Vec<String> = record.iter().map(str::to_string).collect();
        if seen.insert(key) {
            writer.write_record(&record)?;
            stats.rows_after += 1;
        }
    }
    writer.flush()?;

    info!(
        input = %input.display(),
        output = %output.display(),
        "Rows before deduplication: {}, after: {}",
        stats.rows_before,
        stats.rows_after
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_types::Header;
    use std::sync::Arc;

    fn rows(values: &[&[&str]]) -> Vec<RawRow> {
        let header = Arc::new(Header::new(["NPI", "Name", "Code"]));
        values
            .iter()
            .map(|v| RawRow::new(header.clone(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_keeps_first_occurrence_in_order() {
        let input = rows(&[
            &["1", "A", "X"],
            &["2", "B", "X"],
            &["1", "A", "X"],
            &["3", "C", "X"],
            &["2", "B", "X"],
        ]);
        let out = dedup(input.clone());
        assert_eq!(out, vec![input[0].clone(), input[1].clone(), input[3].clone()]);
    }

    #[test]
    fn test_same_npi_different_row_is_kept() {
        let out = dedup(rows(&[&["1", "A", "X"], &["1", "A", "Y"]]));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_idempotent() {
        let once = dedup(rows(&[&["1", "A", "X"], &["1", "A", "X"], &["2", "", ""]]));
        let twice = dedup(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_counts_duplicates() {
        let mut it = Dedup::new(rows(&[&["1", "A", "X"], &["1", "A", "X"], &["1", "A", "X"]]).into_iter());
        assert_eq!(it.by_ref().count(), 1);
        assert_eq!(it.duplicates(), 2);
    }

    #[test]
    fn test_dedup_csv() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("filtered.csv");
        let output = dir.path().join("deduped.csv");
        std::fs::write(&input, "NPI,Code\n1,X\n2,X\n1,X\n1,Y\n").unwrap();

        let stats = dedup_csv(&input, &output).unwrap();
        assert_eq!(stats, DedupStats { rows_before: 4, rows_after: 3 });
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "NPI,Code\n1,X\n2,X\n1,Y\n");
    }
}
