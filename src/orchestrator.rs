/*!
 * Ingestion orchestrator
 *
 * Runs one pipeline to completion and hands the mapped records to a
 * [`ProviderSink`] in batches:
 *
 * - file: source CSV → chunked filter → dedup → mapper → sink
 * - API: query terms → poller → mapper → sink
 *
 * Each run sits in a coarse failure envelope. A failed run is logged, the
 * orchestrator waits the configured failure delay, and the error goes back
 * to the caller, who decides whether to trigger again.
 */

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{error, info};

use crate::client::{NpiRegistryClient, RegistryApi};
use crate::config::IngestConfig;
use crate::data_types::{CanonicalRecord, TaxonomyCodeSet};
use crate::dedup::Dedup;
use crate::filter::ChunkedFilter;
use crate::mapper::{Rejected, RecordMapper};
use crate::poller::{Poller, TermSummary};
use crate::sink::ProviderSink;
use crate::{IngestError, Result};

/// Outcome of a file pipeline run
#[derive(Debug, Clone, Default)]
pub struct FileRunReport {
    pub source: PathBuf,
    pub taxonomy_columns: Vec<String>,
    pub chunks: usize,
    pub rows_scanned: usize,
    pub rows_matched: usize,
    pub duplicates_removed: usize,
    pub upserted: usize,
    pub batches: usize,
    pub elapsed: Duration,
}

/// Outcome of an API pipeline run
#[derive(Debug, Clone, Default)]
pub struct ApiRunReport {
    pub terms: Vec<TermSummary>,
    pub results_fetched: usize,
    pub upserted: usize,
    pub batches: usize,
    pub pauses: usize,
    pub elapsed: Duration,
}

/// Drives the file and API pipelines into a sink
pub struct IngestionOrchestrator<S> {
    config: IngestConfig,
    sink: S,
    taxonomy_descriptions: Arc<HashMap<String, String>>,
}

impl<S: ProviderSink> IngestionOrchestrator<S> {
    pub fn new(config: IngestConfig, sink: S) -> Self {
        Self {
            config,
            sink,
            taxonomy_descriptions: Arc::new(HashMap::new()),
        }
    }

    /// NUCC code → description map used for file rows
    pub fn with_taxonomy_descriptions(mut self, descriptions: HashMap<String, String>) -> Self {
        self.taxonomy_descriptions = Arc::new(descriptions);
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Filter, dedup, map and upsert a local source file
    pub async fn run_file_pipeline<P: AsRef<Path>>(&self, path: P) -> Result<FileRunReport> {
        let path = path.as_ref().to_path_buf();
        self.envelope("file", self.file_pipeline(path)).await
    }

    /// Download the dissemination archive, then run the file pipeline on its
    /// main data file
    pub async fn run_downloaded_file_pipeline(&self) -> Result<FileRunReport> {
        self.envelope("file", async {
            let fetcher = crate::archive::ArchiveFetcher::new(&self.config.archive)?
                .with_progress(self.config.filter.show_progress);
            let path = fetcher.fetch().await?;
            self.file_pipeline(path).await
        })
        .await
    }

    /// Poll the NPI Registry API for `terms` and upsert every result
    pub async fn run_api_pipeline<T: AsRef<str>>(&self, terms: &[T]) -> Result<ApiRunReport> {
        self.envelope("api", async {
            let client = NpiRegistryClient::new(&self.config.poller)?;
            self.api_pipeline(client, terms).await
        })
        .await
    }

    /// Same as [`run_api_pipeline`](Self::run_api_pipeline) over any
    /// [`RegistryApi`]
    pub async fn run_api_pipeline_with<A, T>(&self, api: A, terms: &[T]) -> Result<ApiRunReport>
    where
        A: RegistryApi,
        T: AsRef<str>,
    {
        self.envelope("api", self.api_pipeline(api, terms)).await
    }

    async fn envelope<T, F>(&self, pipeline: &str, run: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match run.await {
            Ok(report) => Ok(report),
            Err(err) => {
                let delay = self.config.orchestrator.failure_delay();
                error!(
                    pipeline,
                    fatal = err.is_fatal(),
                    retry_in_secs = delay.as_secs(),
                    "Ingestion run failed: {}",
                    err
                );
                tokio::time::sleep(delay).await;
                Err(err)
            }
        }
    }

    fn mapper(&self) -> RecordMapper {
        let codes = TaxonomyCodeSet::new(&self.config.filter.target_codes);
        RecordMapper::new()
            .with_taxonomy_descriptions((*self.taxonomy_descriptions).clone())
            .with_preferred_codes(Arc::new(codes))
    }

    async fn file_pipeline(&self, path: PathBuf) -> Result<FileRunReport> {
        let start = Instant::now();
        info!(source = %path.display(), "Starting file ingestion");

        let filter_config = self.config.filter.clone();
        let mapper = self.mapper();
        let source = path.clone();

        // Filtering and mapping are CPU-bound; keep them off the runtime
        let (records, mut report) = tokio::task::spawn_blocking(move || -> Result<_> {
            let filter = ChunkedFilter::new(&filter_config)?;
            let (rows, stats) = filter.filter(&source)?.collect_rows()?;

            let mut deduped = Dedup::new(rows.into_iter());
            let mut records = Vec::new();
            for (position, row) in deduped.by_ref().enumerate() {
                match mapper.map_row(&row) {
                    Ok(record) => records.push(record),
                    Err(Rejected::MissingIdentifier) => {
                        return Err(IngestError::MissingIdentifier {
                            position,
                            origin: source.display().to_string(),
                        })
                    }
                }
            }

            let report = FileRunReport {
                source,
                taxonomy_columns: stats.taxonomy_columns,
                chunks: stats.chunks,
                rows_scanned: stats.rows_scanned,
                rows_matched: stats.rows_matched,
                duplicates_removed: deduped.duplicates(),
                ..Default::default()
            };
            Ok((records, report))
        })
        .await
        .map_err(|e| IngestError::Custom {
            message: format!("File pipeline task failed: {}", e),
            suggestion: None,
        })??;

        info!(
            matched = report.rows_matched,
            duplicates = report.duplicates_removed,
            records = records.len(),
            "Filtered and mapped source file"
        );

        report.batches = self.deliver(&records).await?;
        report.upserted = records.len();
        report.elapsed = start.elapsed();
        info!(upserted = report.upserted, elapsed = ?report.elapsed, "File ingestion complete");
        Ok(report)
    }

    async fn api_pipeline<A, T>(&self, api: A, terms: &[T]) -> Result<ApiRunReport>
    where
        A: RegistryApi,
        T: AsRef<str>,
    {
        let start = Instant::now();
        info!(terms = terms.len(), "Starting API ingestion");

        let outcome = Poller::new(api, &self.config.poller).poll_all(terms).await;
        let records = map_api_results(&self.mapper(), &outcome.results)?;

        let batches = self.deliver(&records).await?;
        let report = ApiRunReport {
            results_fetched: outcome.results.len(),
            upserted: records.len(),
            batches,
            pauses: outcome.pauses,
            terms: outcome.terms,
            elapsed: start.elapsed(),
        };
        info!(
            fetched = report.results_fetched,
            upserted = report.upserted,
            elapsed = ?report.elapsed,
            "API ingestion complete"
        );
        Ok(report)
    }

    /// Upsert in configured batch sizes; returns the number of batches
    async fn deliver(&self, records: &[CanonicalRecord]) -> Result<usize> {
        let batch_size = self.config.orchestrator.batch_size.max(1);
        let mut batches = 0;
        for batch in records.chunks(batch_size) {
            self.sink.upsert(batch).await?;
            batches += 1;
        }
        self.sink.finish().await?;
        Ok(batches)
    }
}

fn map_api_results(mapper: &RecordMapper, results: &[Value]) -> Result<Vec<CanonicalRecord>> {
    results
        .iter()
        .enumerate()
        .map(|(position, result)| {
            mapper.map_api_result(result).map_err(|Rejected::MissingIdentifier| {
                IngestError::MissingIdentifier {
                    position,
                    origin: "NPI Registry API".to_string(),
                }
            })
        })
        .collect()
}
