/*!
 * Schema definitions for NPPES data files
 *
 * Column names of the main `npidata_pfile` CSV that ingestion reads, the
 * taxonomy code slots used by the filter, and the NUCC taxonomy reference
 * file layout.
 */

use std::path::Path;

use crate::constants::MAX_TAXONOMY_CODES;
use crate::{IngestError, Result};

/// Columns of the main NPPES data file that feed the canonical record
pub struct NppesColumns;

impl NppesColumns {
    pub const NPI: &'static str = "NPI";
    pub const ORGANIZATION_NAME: &'static str = "Provider Organization Name (Legal Business Name)";
    pub const PROVIDER_LAST_NAME: &'static str = "Provider Last Name (Legal Name)";
    pub const PROVIDER_FIRST_NAME: &'static str = "Provider First Name";
    pub const PROVIDER_MIDDLE_NAME: &'static str = "Provider Middle Name";
    pub const PRACTICE_ADDRESS_LINE_1: &'static str = "Provider First Line Business Practice Location Address";
    pub const PRACTICE_CITY: &'static str = "Provider Business Practice Location Address City Name";
    pub const PRACTICE_STATE: &'static str = "Provider Business Practice Location Address State Name";
    pub const PRACTICE_POSTAL_CODE: &'static str = "Provider Business Practice Location Address Postal Code";
    pub const PRACTICE_TELEPHONE: &'static str = "Provider Business Practice Location Address Telephone Number";
    pub const LAST_UPDATE_DATE: &'static str = "Last Update Date";
    pub const OFFICIAL_LAST_NAME: &'static str = "Authorized Official Last Name";
    pub const OFFICIAL_FIRST_NAME: &'static str = "Authorized Official First Name";
    pub const OFFICIAL_MIDDLE_NAME: &'static str = "Authorized Official Middle Name";

    /// Name of a numbered slot column, e.g. `slot_column("Healthcare Provider Taxonomy Code", 3)`
    pub fn slot_column(base: &str, slot: usize) -> String {
        format!("{}_{}", base, slot)
    }

    /// All 15 slot column names for a base, in slot order
    pub fn slot_columns(base: &str) -> Vec<String> {
        (1..=MAX_TAXONOMY_CODES)
            .map(|slot| Self::slot_column(base, slot))
            .collect()
    }
}

/// Taxonomy code columns actually present in a file's header
///
/// Computed once per run from the canonical 15 slots intersected with the
/// header, keeping slot order. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxonomyColumnList {
    names: Vec<String>,
    indices: Vec<usize>,
}

impl TaxonomyColumnList {
    /// Intersect the canonical slots for `base` with `headers`
    ///
    /// Fails when none of the slots are present: there is nothing to filter on.
    pub fn resolve<S: AsRef<str>>(base: &str, headers: &[S], path: &Path) -> Result<Self> {
        let mut names = Vec::new();
        let mut indices = Vec::new();

        for candidate in NppesColumns::slot_columns(base) {
            if let Some(index) = headers.iter().position(|h| h.as_ref() == candidate) {
                names.push(candidate);
                indices.push(index);
            }
        }

        if names.is_empty() {
            return Err(IngestError::NoTaxonomyColumns {
                path: path.to_path_buf(),
                expected_base: base.to_string(),
            });
        }

        Ok(Self { names, indices })
    }

    /// Column names, in slot order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Positions of the columns in the header, in slot order
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// NUCC taxonomy reference file schema
pub struct TaxonomySchema;

impl TaxonomySchema {
    pub fn column_names() -> Vec<&'static str> {
        vec![
            "Code",
            "Grouping",
            "Classification",
            "Specialization",
            "Definition",
            "Notes",
            "Display Name",
            "Section",
        ]
    }

    /// Only `Code` and one description column are required
    pub fn validate_headers(headers: &[String]) -> Result<()> {
        let has = |name: &str| headers.iter().any(|h| h.trim() == name);
        if !has("Code") || !(has("Display Name") || has("Classification")) {
            return Err(IngestError::Custom {
                message: format!(
                    "Taxonomy reference header is missing 'Code' or a description column: {:?}",
                    headers
                ),
                suggestion: Some(
                    "Use the NUCC taxonomy CSV from https://www.nucc.org".to_string(),
                ),
            });
        }
        Ok(())
    }
}
