/*!
 * Persistent sinks for canonical provider records
 *
 * A sink upserts batches keyed by `npi_number`: an existing record is
 * replaced field by field, the last write wins. Sinks provided here:
 *
 * - [`MemorySink`]: in-process map, handy for tests and dry runs
 * - [`SqlUpsertSink`]: PostgreSQL script with table DDL, indexes and
 *   `INSERT ... ON CONFLICT (npi_number) DO UPDATE` batches
 * - [`JsonLinesSink`]: one JSON object per upserted record
 */

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::data_types::{CanonicalField, CanonicalRecord};
use crate::{IngestError, Result};

/// Default table name for provider records
pub const DEFAULT_TABLE: &str = "NPIRehabs";

/// Destination for canonical records
#[async_trait]
pub trait ProviderSink: Send + Sync {
    /// Insert or replace every record of the batch by `npi_number`
    async fn upsert(&self, batch: &[CanonicalRecord]) -> Result<()>;

    /// Flush anything buffered. Called once at the end of a run.
    async fn finish(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<S: ProviderSink + ?Sized> ProviderSink for Box<S> {
    async fn upsert(&self, batch: &[CanonicalRecord]) -> Result<()> {
        (**self).upsert(batch).await
    }

    async fn finish(&self) -> Result<()> {
        (**self).finish().await
    }
}

#[async_trait]
impl<S: ProviderSink + ?Sized> ProviderSink for Arc<S> {
    async fn upsert(&self, batch: &[CanonicalRecord]) -> Result<()> {
        (**self).upsert(batch).await
    }

    async fn finish(&self) -> Result<()> {
        (**self).finish().await
    }
}

/// Keep only the last record per NPI, in order of last appearance.
/// A single upsert statement may not touch the same key twice.
pub fn collapse_last_wins(batch: &[CanonicalRecord]) -> Vec<&CanonicalRecord> {
    let mut last: HashMap<&str, usize> = HashMap::with_capacity(batch.len());
    for (i, record) in batch.iter().enumerate() {
        last.insert(record.npi_number.as_str(), i);
    }
    batch
        .iter()
        .enumerate()
        .filter(|(i, r)| last.get(r.npi_number.as_str()) == Some(i))
        .map(|(_, r)| r)
        .collect()
}

fn lock_poisoned(batch_len: usize) -> IngestError {
    IngestError::Sink {
        message: "sink lock poisoned by an earlier panic".to_string(),
        batch_len,
    }
}

/// In-memory sink keyed by NPI
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<HashMap<String, CanonicalRecord>>,
    batches: Mutex<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, npi: &str) -> Option<CanonicalRecord> {
        self.records.lock().ok()?.get(npi).cloned()
    }

    /// Snapshot of stored records sorted by NPI
    pub fn records(&self) -> Vec<CanonicalRecord> {
        let mut records: Vec<CanonicalRecord> = self
            .records
            .lock()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.npi_number.cmp(&b.npi_number));
        records
    }

    /// Number of non-empty batches received
    pub fn batches(&self) -> usize {
        self.batches.lock().map(|b| *b).unwrap_or(0)
    }
}

#[async_trait]
impl ProviderSink for MemorySink {
    async fn upsert(&self, batch: &[CanonicalRecord]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut records = self.records.lock().map_err(|_| lock_poisoned(batch.len()))?;
        for record in batch {
            records.insert(record.npi_number.clone(), record.clone());
        }
        drop(records);
        *self.batches.lock().map_err(|_| lock_poisoned(batch.len()))? += 1;
        Ok(())
    }
}

/// Writes an idempotent PostgreSQL upsert script
pub struct SqlUpsertSink<W: Write + Send = BufWriter<File>> {
    table: String,
    writer: Mutex<W>,
    statements: Mutex<usize>,
}

impl SqlUpsertSink<BufWriter<File>> {
    /// Create the script file and write the table schema
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::create_with_table(path, DEFAULT_TABLE)
    }

    pub fn create_with_table<P: AsRef<Path>>(path: P, table: &str) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| IngestError::io_at(e, path))?;
        Self::with_table(BufWriter::new(file), table)
    }
}

impl<W: Write + Send> SqlUpsertSink<W> {
    pub fn new(writer: W) -> Result<Self> {
        Self::with_table(writer, DEFAULT_TABLE)
    }

    pub fn with_table(mut writer: W, table: &str) -> Result<Self> {
        write_schema(&mut writer, table)?;
        Ok(Self {
            table: table.to_string(),
            writer: Mutex::new(writer),
            statements: Mutex::new(0),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Number of upsert statements written
    pub fn statements(&self) -> usize {
        self.statements.lock().map(|s| *s).unwrap_or(0)
    }

    /// Flush and hand back the writer
    pub fn into_inner(self) -> Result<W> {
        let mut writer = self.writer.into_inner().map_err(|_| lock_poisoned(0))?;
        writer.flush()?;
        Ok(writer)
    }
}

fn write_schema(writer: &mut dyn Write, table: &str) -> Result<()> {
    writeln!(writer, "-- NPPES provider schema for PostgreSQL\n")?;
    writeln!(writer, "CREATE TABLE IF NOT EXISTS \"{}\" (", table)?;
    let columns: Vec<String> = CanonicalField::ALL
        .iter()
        .map(|field| match field {
            CanonicalField::NpiNumber => {
                format!("  {} VARCHAR({}) PRIMARY KEY", field.name(), field.max_len())
            }
            _ => format!("  {} VARCHAR({})", field.name(), field.max_len()),
        })
        .collect();
    writeln!(writer, "{}", columns.join(",\n"))?;
    writeln!(writer, ");\n")?;

    let prefix = table.to_lowercase();
    for field in [
        CanonicalField::NpiNumber,
        CanonicalField::OrganizationName,
        CanonicalField::State,
    ] {
        writeln!(
            writer,
            "CREATE INDEX IF NOT EXISTS idx_{}_{} ON \"{}\"({});",
            prefix,
            field.name(),
            table,
            field.name()
        )?;
    }
    Ok(())
}

fn write_upsert(writer: &mut dyn Write, table: &str, records: &[&CanonicalRecord]) -> Result<()> {
    let columns: Vec<&str> = CanonicalField::ALL.iter().map(|f| f.name()).collect();
    writeln!(writer, "\nINSERT INTO \"{}\" ({}) VALUES", table, columns.join(", "))?;

    for (i, record) in records.iter().enumerate() {
        let values: Vec<String> = CanonicalField::ALL
            .iter()
            .map(|field| sql_string(record.get(*field)))
            .collect();
        let sep = if i + 1 < records.len() { "," } else { "" };
        writeln!(writer, "  ({}){}", values.join(", "), sep)?;
    }

    let updates: Vec<String> = CanonicalField::ALL
        .iter()
        .filter(|f| **f != CanonicalField::NpiNumber)
        .map(|f| format!("{0} = EXCLUDED.{0}", f.name()))
        .collect();
    writeln!(
        writer,
        "ON CONFLICT ({}) DO UPDATE SET\n  {};",
        CanonicalField::NpiNumber.name(),
        updates.join(",\n  ")
    )?;
    Ok(())
}

fn sql_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[async_trait]
impl<W: Write + Send> ProviderSink for SqlUpsertSink<W> {
    async fn upsert(&self, batch: &[CanonicalRecord]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let records = collapse_last_wins(batch);
        let mut writer = self.writer.lock().map_err(|_| lock_poisoned(batch.len()))?;
        write_upsert(&mut *writer, &self.table, &records).map_err(|e| IngestError::Sink {
            message: e.to_string(),
            batch_len: batch.len(),
        })?;
        drop(writer);

        let mut statements = self.statements.lock().map_err(|_| lock_poisoned(batch.len()))?;
        *statements += 1;
        debug!(table = %self.table, rows = records.len(), statement = *statements, "Wrote upsert");
        Ok(())
    }

    async fn finish(&self) -> Result<()> {
        let mut writer = self.writer.lock().map_err(|_| lock_poisoned(0))?;
        writer.flush()?;
        Ok(())
    }
}

/// Appends every upserted record as one JSON line
pub struct JsonLinesSink<W: Write + Send = BufWriter<File>> {
    writer: Mutex<W>,
}

impl JsonLinesSink<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| IngestError::io_at(e, path))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> Result<W> {
        let mut writer = self.writer.into_inner().map_err(|_| lock_poisoned(0))?;
        writer.flush()?;
        Ok(writer)
    }
}

#[async_trait]
impl<W: Write + Send> ProviderSink for JsonLinesSink<W> {
    async fn upsert(&self, batch: &[CanonicalRecord]) -> Result<()> {
        let mut writer = self.writer.lock().map_err(|_| lock_poisoned(batch.len()))?;
        for record in batch {
            let json = serde_json::to_string(record).map_err(|e| IngestError::Sink {
                message: e.to_string(),
                batch_len: batch.len(),
            })?;
            writeln!(writer, "{}", json)?;
        }
        Ok(())
    }

    async fn finish(&self) -> Result<()> {
        self.writer.lock().map_err(|_| lock_poisoned(0))?.flush()?;
        Ok(())
    }
}
