/*!
 * Chunked parallel taxonomy filter for the NPPES bulk file
 *
 * The file is read sequentially into chunks of at most `chunk_size` rows.
 * Each chunk is moved to a worker of a fixed-size pool, which keeps the rows
 * where any present taxonomy code column holds a target code. Workers finish
 * in any order; results are parked in a buffer keyed by chunk index and
 * released strictly in submission order, so the output is the same ordered
 * subsequence of the input for any worker count.
 *
 * At most `2 * workers` chunks are in flight or waiting for release, which
 * bounds memory by chunk size and worker count rather than file size.
 */

use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::{Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

#[cfg(feature = "progress")]
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::FilterConfig;
use crate::data_types::{Chunk, FilteredChunk, Header, RawRow, TaxonomyCodeSet};
use crate::schema::TaxonomyColumnList;
use crate::{IngestError, Result};

/// Counters for one pass over a source file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterStats {
    pub chunks: usize,
    pub rows_scanned: usize,
    pub rows_matched: usize,
    pub taxonomy_columns: Vec<String>,
    pub elapsed: Duration,
}

/// Membership test over the taxonomy columns of one record
#[derive(Debug)]
struct TaxonomyPredicate {
    indices: Vec<usize>,
    codes: Arc<TaxonomyCodeSet>,
}

impl TaxonomyPredicate {
    fn matches(&self, record: &StringRecord) -> bool {
        self.indices
            .iter()
            .filter_map(|&i| record.get(i))
            .any(|value| self.codes.contains(value))
    }
}

/// Runs on a pool thread; owns its chunk for its whole lifetime
fn filter_chunk(chunk: Chunk, predicate: &TaxonomyPredicate, header: &Arc<Header>) -> FilteredChunk {
    let rows_scanned = chunk.len();
    let rows = chunk
        .records
        .iter()
        .filter(|record| predicate.matches(record))
        .map(|record| RawRow::from_record(header, record))
        .collect();

    FilteredChunk {
        index: chunk.index,
        rows_scanned,
        rows,
    }
}

type WorkerMessage = (usize, std::thread::Result<FilteredChunk>);

/// Taxonomy filter over large NPPES CSV files
pub struct ChunkedFilter {
    chunk_size: usize,
    workers: usize,
    column_base: String,
    codes: Arc<TaxonomyCodeSet>,
    pool: Arc<ThreadPool>,
    #[cfg_attr(not(feature = "progress"), allow(dead_code))]
    show_progress: bool,
}

impl ChunkedFilter {
    /// Create a filter with its own worker pool
    pub fn new(config: &FilterConfig) -> Result<Self> {
        let codes = TaxonomyCodeSet::new(&config.target_codes);
        if codes.is_empty() {
            return Err(IngestError::invalid_config("No target taxonomy codes configured", None));
        }
        if config.chunk_size == 0 {
            return Err(IngestError::invalid_config("Chunk size must be greater than 0", None));
        }

        let workers = config
            .parallel_threads
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
            .max(1);

        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("nppes-filter-{}", i))
            .build()
            .map_err(|e| IngestError::Custom {
                message: format!("Failed to start filter worker pool: {}", e),
                suggestion: Some("Try a smaller filter.parallel_threads".to_string()),
            })?;

        Ok(Self {
            chunk_size: config.chunk_size,
            workers,
            column_base: config.taxonomy_column_base.clone(),
            codes: Arc::new(codes),
            pool: Arc::new(pool),
            show_progress: config.show_progress,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn target_codes(&self) -> &TaxonomyCodeSet {
        &self.codes
    }

    /// Start a pass over a CSV file
    ///
    /// Each call starts again from the first row.
    pub fn filter<P: AsRef<Path>>(&self, path: P) -> Result<FilteredRows> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(IngestError::Custom {
                message: format!("Source file not found: {}", path.display()),
                suggestion: Some("Check the path or use --download to fetch the dissemination file".to_string()),
            });
        }

        let file = File::open(path).map_err(|e| IngestError::io_at(e, path))?;

        #[cfg(feature = "progress")]
        let progress = if self.show_progress {
            let total = file.metadata().map(|m| m.len()).unwrap_or(0);
            let pb = ProgressBar::new(total);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        let rows = self.filter_reader(file, path)?;

        #[cfg(feature = "progress")]
        let rows = FilteredRows { progress, ..rows };

        Ok(rows)
    }

    /// Start a pass over any CSV byte stream; `source` is used in messages only
    pub fn filter_reader<R>(&self, reader: R, source: &Path) -> Result<FilteredRows>
    where
        R: Read + Send + 'static,
    {
        let mut csv_reader = ReaderBuilder::new()
            .has_headers(true)
            .from_reader(Box::new(reader) as Box<dyn Read + Send>);

        let header_record = csv_reader
            .headers()
            .map_err(|e| IngestError::from(e).with_file(source))?
            .clone();
        let header = Arc::new(Header::new(header_record.iter()));
        let columns = TaxonomyColumnList::resolve(&self.column_base, header.names(), source)?;

        info!(
            source = %source.display(),
            columns = columns.len(),
            chunk_size = self.chunk_size,
            workers = self.workers,
            "Filtering on taxonomy columns"
        );

        let predicate = Arc::new(TaxonomyPredicate {
            indices: columns.indices().to_vec(),
            codes: Arc::clone(&self.codes),
        });
        let (tx, rx) = channel();

        Ok(FilteredRows {
            reader: csv_reader,
            source: source.to_path_buf(),
            header,
            columns,
            predicate,
            pool: Arc::clone(&self.pool),
            chunk_size: self.chunk_size,
            max_in_flight: self.workers * 2,
            tx,
            rx,
            next_submit: 0,
            next_emit: 0,
            in_flight: 0,
            reorder: BTreeMap::new(),
            source_done: false,
            finished: false,
            pending: VecDeque::new(),
            stats: FilterStats::default(),
            started: Instant::now(),
            #[cfg(feature = "progress")]
            progress: None,
        })
    }

    /// Filter `input` into a new CSV file at `output`
    pub fn filter_to_csv<P: AsRef<Path>, Q: AsRef<Path>>(&self, input: P, output: Q) -> Result<FilterStats> {
        let output = output.as_ref();
        let file = File::create(output).map_err(|e| IngestError::io_at(e, output))?;
        let stats = self.filter_to_writer(input, std::io::BufWriter::new(file))?;
        info!(output = %output.display(), rows = stats.rows_matched, "Wrote filtered rows");
        Ok(stats)
    }

    /// Filter `input` as CSV into `writer`
    ///
    /// The header is written when the first chunk is released, and never
    /// again. An input without data rows produces empty output.
    pub fn filter_to_writer<P: AsRef<Path>, W: Write>(&self, input: P, writer: W) -> Result<FilterStats> {
        let mut rows = self.filter(input)?;
        let mut out = WriterBuilder::new().has_headers(false).from_writer(writer);
        let mut wrote_header = false;

        while let Some(chunk) = rows.next_chunk() {
            let chunk = chunk?;
            if !wrote_header {
                out.write_record(rows.header().names())?;
                wrote_header = true;
            }
            for row in &chunk.rows {
                out.write_record(row.values())?;
            }
        }

        out.flush()?;
        Ok(rows.stats().clone())
    }
}

/// Lazy, ordered stream of matching rows from one pass over a file
///
/// Iterating yields rows one at a time; [`FilteredRows::next_chunk`] yields
/// them grouped by source chunk. A parse error is returned once and ends the
/// stream.
pub struct FilteredRows {
    reader: csv::Reader<Box<dyn Read + Send>>,
    source: PathBuf,
    header: Arc<Header>,
    columns: TaxonomyColumnList,
    predicate: Arc<TaxonomyPredicate>,
    pool: Arc<ThreadPool>,
    chunk_size: usize,
    max_in_flight: usize,
    tx: Sender<WorkerMessage>,
    rx: Receiver<WorkerMessage>,
    next_submit: usize,
    next_emit: usize,
    in_flight: usize,
    reorder: BTreeMap<usize, FilteredChunk>,
    source_done: bool,
    finished: bool,
    pending: VecDeque<RawRow>,
    stats: FilterStats,
    started: Instant,
    #[cfg(feature = "progress")]
    progress: Option<ProgressBar>,
}

impl FilteredRows {
    pub fn header(&self) -> &Arc<Header> {
        &self.header
    }

    pub fn taxonomy_columns(&self) -> &TaxonomyColumnList {
        &self.columns
    }

    /// Counters for the chunks released so far
    pub fn stats(&self) -> &FilterStats {
        &self.stats
    }

    /// Next chunk of matches, in submission order
    pub fn next_chunk(&mut self) -> Option<Result<FilteredChunk>> {
        if self.finished {
            return None;
        }

        loop {
            while !self.source_done && self.in_flight + self.reorder.len() < self.max_in_flight {
                match self.read_chunk() {
                    Ok(Some(chunk)) => self.submit(chunk),
                    Ok(None) => self.source_done = true,
                    Err(e) => {
                        let err = e.with_file(&self.source);
                        return Some(Err(self.fail(err)));
                    }
                }
            }

            if let Some(chunk) = self.reorder.remove(&self.next_emit) {
                self.next_emit += 1;
                self.record(&chunk);
                return Some(Ok(chunk));
            }

            if self.in_flight == 0 {
                self.finish();
                return None;
            }

            match self.rx.recv() {
                Ok((index, Ok(chunk))) => {
                    self.in_flight -= 1;
                    debug!(chunk = index, matched = chunk.rows.len(), "Chunk filtered");
                    self.reorder.insert(index, chunk);
                }
                Ok((index, Err(_))) => {
                    let err = IngestError::Custom {
                        message: format!("Filter worker panicked on chunk {}", index),
                        suggestion: None,
                    };
                    return Some(Err(self.fail(err)));
                }
                Err(_) => {
                    let err = IngestError::Custom {
                        message: "Filter worker pool disconnected".to_string(),
                        suggestion: None,
                    };
                    return Some(Err(self.fail(err)));
                }
            }
        }
    }

    /// Drain the whole pass into memory
    pub fn collect_rows(mut self) -> Result<(Vec<RawRow>, FilterStats)> {
        let mut rows = Vec::new();
        while let Some(chunk) = self.next_chunk() {
            rows.extend(chunk?.rows);
        }
        Ok((rows, self.stats))
    }

    fn read_chunk(&mut self) -> Result<Option<Chunk>> {
        let mut records = Vec::with_capacity(self.chunk_size.min(16_384));
        let mut first_line = 0;
        let mut record = StringRecord::new();

        while records.len() < self.chunk_size {
            if !self.reader.read_record(&mut record)? {
                break;
            }
            if records.is_empty() {
                first_line = record.position().map(|p| p.line() as usize).unwrap_or(0);
            }
            records.push(std::mem::take(&mut record));
        }

        #[cfg(feature = "progress")]
        if let Some(ref pb) = self.progress {
            pb.set_position(self.reader.position().byte());
        }

        if records.is_empty() {
            return Ok(None);
        }

        let chunk = Chunk {
            index: self.next_submit,
            first_line,
            records,
        };
        self.next_submit += 1;
        Ok(Some(chunk))
    }

    fn submit(&mut self, chunk: Chunk) {
        let index = chunk.index;
        let tx = self.tx.clone();
        let predicate = Arc::clone(&self.predicate);
        let header = Arc::clone(&self.header);

        self.in_flight += 1;
        self.pool.spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(|| filter_chunk(chunk, &predicate, &header)));
            // Receiver is gone only when the stream was dropped early
            tx.send((index, result)).ok();
        });
    }

    fn record(&mut self, chunk: &FilteredChunk) {
        self.stats.chunks += 1;
        self.stats.rows_scanned += chunk.rows_scanned;
        self.stats.rows_matched += chunk.rows.len();
    }

    fn fail(&mut self, err: IngestError) -> IngestError {
        self.finished = true;
        self.reorder.clear();
        self.pending.clear();
        #[cfg(feature = "progress")]
        if let Some(pb) = self.progress.take() {
            pb.abandon();
        }
        err
    }

    fn finish(&mut self) {
        self.finished = true;
        self.stats.taxonomy_columns = self.columns.names().to_vec();
        self.stats.elapsed = self.started.elapsed();

        #[cfg(feature = "progress")]
        if let Some(pb) = self.progress.take() {
            pb.finish_with_message("Filtering complete");
        }

        let elapsed = self.stats.elapsed.as_secs_f64();
        info!(
            chunks = self.stats.chunks,
            scanned = self.stats.rows_scanned,
            matched = self.stats.rows_matched,
            "Filtered {} of {} rows in {:.2}s ({:.0} rows/sec)",
            self.stats.rows_matched,
            self.stats.rows_scanned,
            elapsed,
            if elapsed > 0.0 { self.stats.rows_scanned as f64 / elapsed } else { 0.0 }
        );
    }
}

impl Iterator for FilteredRows {
    type Item = Result<RawRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Some(Ok(row));
            }
            match self.next_chunk()? {
                Ok(chunk) => self.pending.extend(chunk.rows),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
