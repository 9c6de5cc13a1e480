/*!
 * # NPPES Ingestion
 *
 * Pulls healthcare providers of interest out of the NPPES registry and hands
 * them to an upsert sink in one canonical shape.
 *
 * Two paths lead to the same records:
 *
 * - **File pipeline**: the monthly `npidata_pfile_*.csv` dissemination file
 *   (9GB+) is scanned in bounded chunks on a worker pool, rows whose taxonomy
 *   code columns hold a target code are kept in source order, exact duplicate
 *   rows are dropped, and the survivors are mapped and upserted.
 * - **API pipeline**: the NPI Registry API is paged per query term with rate
 *   limiting, fixed-delay retries and a long-running pause/resume guard, and
 *   every result is mapped and upserted.
 *
 * ## Quick Start
 *
 * ```no_run
 * use nppes_ingest::prelude::*;
 *
 * # async fn run() -> Result<()> {
 * let config = IngestConfig::load(None)?;
 * let sink = SqlUpsertSink::create("providers.sql")?;
 * let orchestrator = IngestionOrchestrator::new(config, sink);
 *
 * let report = orchestrator
 *     .run_file_pipeline("data/npidata_pfile_20050523-20250511.csv")
 *     .await?;
 * println!("Upserted {} providers", report.upserted);
 * # Ok(())
 * # }
 * ```
 *
 * ## Filtering Only
 *
 * ```no_run
 * # use nppes_ingest::prelude::*;
 * # fn main() -> Result<()> {
 * let config = ConfigBuilder::new().chunk_size(50_000).build()?;
 * let filter = ChunkedFilter::new(&config.filter)?;
 * let stats = filter.filter_to_csv(
 *     "data/npidata_pfile_20050523-20250511.csv",
 *     "filtered_npi_providers.csv",
 * )?;
 * println!("Kept {} of {} rows", stats.rows_matched, stats.rows_scanned);
 * # Ok(())
 * # }
 * ```
 *
 * ## Configuration
 *
 * Defaults are overridden by a TOML file and then by environment variables
 * such as `NPPES_INGEST__POLLER__PAGE_SIZE=100` or
 * `NPPES_INGEST__FILTER__TARGET_CODES=324500000X,3245S0500X`.
 */

// Re-export error types from root
pub use error::{IngestError, Result, ErrorContext};

// Public modules
pub mod data_types;
pub mod schema;
pub mod error;
pub mod config;
pub mod filter;
pub mod dedup;
pub mod mapper;
pub mod client;
pub mod poller;
pub mod sink;
pub mod archive;
pub mod orchestrator;

/// Prelude module for convenient imports
///
/// Import everything you need with:
/// ```
/// use nppes_ingest::prelude::*;
/// ```
pub mod prelude {
    pub use crate::data_types::*;
    pub use crate::schema::{NppesColumns, TaxonomyColumnList};
    pub use crate::error::{IngestError, Result};
    pub use crate::config::{ConfigBuilder, IngestConfig};
    pub use crate::filter::{ChunkedFilter, FilterStats, FilteredRows};
    pub use crate::dedup::{dedup, Dedup};
    pub use crate::mapper::{RecordMapper, Rejected};
    pub use crate::client::{FetchError, NpiRegistryClient, PageQuery, RegistryApi};
    pub use crate::poller::{PollLimits, PollOutcome, Poller, TermState, TermSummary};
    pub use crate::sink::{JsonLinesSink, MemorySink, ProviderSink, SqlUpsertSink};
    pub use crate::orchestrator::{ApiRunReport, FileRunReport, IngestionOrchestrator};
}

/// NPPES data constants
pub mod constants {
    /// Number of taxonomy code slots per provider row
    pub const MAX_TAXONOMY_CODES: usize = 15;

    /// Column base name of the taxonomy code slots (`<base>_1` .. `<base>_15`)
    pub const TAXONOMY_CODE_COLUMN_BASE: &str = "Healthcare Provider Taxonomy Code";

    /// Column base name of the primary taxonomy switches
    pub const PRIMARY_TAXONOMY_SWITCH_BASE: &str = "Healthcare Provider Primary Taxonomy Switch";

    /// Substance abuse rehabilitation facility codes
    pub const DEFAULT_TARGET_CODES: &[&str] = &["324500000X", "3245S0500X"];

    /// Placeholder for canonical fields that cannot be determined
    pub const SENTINEL: &str = "Unknown";

    /// Address purpose preferred when an API result lists several addresses
    pub const LOCATION_ADDRESS_PURPOSE: &str = "LOCATION";

    /// Largest `limit` the NPI Registry API accepts
    pub const MAX_API_PAGE_SIZE: usize = 200;
}
