/*!
 * Data type definitions for NPPES ingestion
 *
 * Raw rows as read from the bulk file, the chunks they travel in, the target
 * taxonomy code set, and the canonical provider record handed to sinks.
 */

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Column names of a source file, shared by every row read from it
#[derive(Debug, PartialEq, Eq)]
pub struct Header {
    names: Vec<String>,
    positions: HashMap<String, usize>,
}

impl Header {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        // First occurrence wins on duplicate column names
        let mut positions = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            positions.entry(name.clone()).or_insert(i);
        }
        Self { names, positions }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// One data line of the source file, all values kept as strings
///
/// Equality and hashing look at every value, not just the NPI, so two rows
/// are equal only when they are exact duplicates.
#[derive(Debug, Clone)]
pub struct RawRow {
    header: Arc<Header>,
    values: Arc<[String]>,
}

impl RawRow {
    pub fn new(header: Arc<Header>, values: Vec<String>) -> Self {
        Self {
            header,
            values: values.into(),
        }
    }

    pub fn from_record(header: &Arc<Header>, record: &csv::StringRecord) -> Self {
        Self {
            header: Arc::clone(header),
            values: record.iter().map(str::to_string).collect(),
        }
    }

    /// Value of a column; `None` when the column is missing or the cell is blank
    pub fn get(&self, column: &str) -> Option<&str> {
        self.header
            .position(column)
            .and_then(|i| self.values.get(i))
            .map(|s| s.as_str())
            .filter(|s| !s.trim().is_empty())
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn header(&self) -> &Arc<Header> {
        &self.header
    }
}

impl PartialEq for RawRow {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Eq for RawRow {}

impl Hash for RawRow {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.values.hash(state);
    }
}

/// A bounded slice of consecutive source rows, the unit of parallel work
#[derive(Debug)]
pub struct Chunk {
    /// Submission order, starting at 0
    pub index: usize,
    /// Source line number of the first record (header is line 1)
    pub first_line: usize,
    pub records: Vec<csv::StringRecord>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Rows that survived filtering, tagged with the chunk they came from
#[derive(Debug)]
pub struct FilteredChunk {
    pub index: usize,
    pub rows_scanned: usize,
    pub rows: Vec<RawRow>,
}

/// Target taxonomy codes, read-only for the lifetime of a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaxonomyCodeSet(HashSet<String>);

impl TaxonomyCodeSet {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            codes
                .into_iter()
                .map(|c| c.as_ref().trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
        )
    }

    pub fn contains(&self, code: &str) -> bool {
        self.0.contains(code)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|s| s.as_str())
    }
}

/// Fields of the canonical provider record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalField {
    NpiNumber,
    OrganizationName,
    Address,
    City,
    State,
    PostalCode,
    Phone,
    TaxonomyCode,
    TaxonomyDesc,
    AuthorizedOfficial,
    LastUpdated,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 11] = [
        CanonicalField::NpiNumber,
        CanonicalField::OrganizationName,
        CanonicalField::Address,
        CanonicalField::City,
        CanonicalField::State,
        CanonicalField::PostalCode,
        CanonicalField::Phone,
        CanonicalField::TaxonomyCode,
        CanonicalField::TaxonomyDesc,
        CanonicalField::AuthorizedOfficial,
        CanonicalField::LastUpdated,
    ];

    /// Column name in the sink
    pub fn name(&self) -> &'static str {
        match self {
            CanonicalField::NpiNumber => "npi_number",
            CanonicalField::OrganizationName => "organization_name",
            CanonicalField::Address => "address",
            CanonicalField::City => "city",
            CanonicalField::State => "state",
            CanonicalField::PostalCode => "postal_code",
            CanonicalField::Phone => "phone",
            CanonicalField::TaxonomyCode => "taxonomy_code",
            CanonicalField::TaxonomyDesc => "taxonomy_desc",
            CanonicalField::AuthorizedOfficial => "authorized_official",
            CanonicalField::LastUpdated => "last_updated",
        }
    }

    /// Maximum length in characters
    pub fn max_len(&self) -> usize {
        match self {
            CanonicalField::NpiNumber => 10,
            CanonicalField::City => 100,
            CanonicalField::State => 50,
            CanonicalField::PostalCode => 20,
            CanonicalField::Phone => 20,
            CanonicalField::TaxonomyCode => 10,
            CanonicalField::LastUpdated => 32,
            CanonicalField::OrganizationName
            | CanonicalField::Address
            | CanonicalField::TaxonomyDesc
            | CanonicalField::AuthorizedOfficial => 255,
        }
    }
}

impl std::fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Normalized provider handed to the sink, keyed by `npi_number`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub npi_number: String,
    pub organization_name: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub phone: String,
    pub taxonomy_code: String,
    pub taxonomy_desc: String,
    pub authorized_official: String,
    pub last_updated: String,
}

impl CanonicalRecord {
    pub fn get(&self, field: CanonicalField) -> &str {
        match field {
            CanonicalField::NpiNumber => &self.npi_number,
            CanonicalField::OrganizationName => &self.organization_name,
            CanonicalField::Address => &self.address,
            CanonicalField::City => &self.city,
            CanonicalField::State => &self.state,
            CanonicalField::PostalCode => &self.postal_code,
            CanonicalField::Phone => &self.phone,
            CanonicalField::TaxonomyCode => &self.taxonomy_code,
            CanonicalField::TaxonomyDesc => &self.taxonomy_desc,
            CanonicalField::AuthorizedOfficial => &self.authorized_official,
            CanonicalField::LastUpdated => &self.last_updated,
        }
    }

    /// Build a record from already-normalized values
    pub fn from_fn<F>(mut value: F) -> Self
    where
        F: FnMut(CanonicalField) -> String,
    {
        Self {
            npi_number: value(CanonicalField::NpiNumber),
            organization_name: value(CanonicalField::OrganizationName),
            address: value(CanonicalField::Address),
            city: value(CanonicalField::City),
            state: value(CanonicalField::State),
            postal_code: value(CanonicalField::PostalCode),
            phone: value(CanonicalField::Phone),
            taxonomy_code: value(CanonicalField::TaxonomyCode),
            taxonomy_desc: value(CanonicalField::TaxonomyDesc),
            authorized_official: value(CanonicalField::AuthorizedOfficial),
            last_updated: value(CanonicalField::LastUpdated),
        }
    }
}

/// Keep at most `max_chars` characters of `value`
pub fn truncate_chars(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &value[..byte_idx],
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn header() -> Arc<Header> {
        Arc::new(Header::new(["NPI", "Name", "Code"]))
    }

    fn hash_of(row: &RawRow) -> u64 {
        let mut h = DefaultHasher::new();
        row.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_raw_row_lookup_treats_blank_as_absent() {
        let row = RawRow::new(header(), vec!["1234567890".into(), "  ".into(), "324500000X".into()]);
        assert_eq!(row.get("NPI"), Some("1234567890"));
        assert_eq!(row.get("Name"), None);
        assert_eq!(row.get("Missing"), None);
    }

    #[test]
    fn test_raw_row_equality_is_full_row() {
        let h = header();
        let a = RawRow::new(h.clone(), vec!["1".into(), "A".into(), "X".into()]);
        let b = RawRow::new(h.clone(), vec!["1".into(), "A".into(), "X".into()]);
        let c = RawRow::new(h, vec!["1".into(), "B".into(), "X".into()]);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(a, c);
    }

    #[test]
    fn test_code_set_trims_and_skips_blank() {
        let set = TaxonomyCodeSet::new([" 324500000X ", "", "3245S0500X"]);
        assert_eq!(set.len(), 2);
        assert!(set.contains("324500000X"));
        assert!(!set.contains("261QM0801X"));
    }

    #[test]
    fn test_truncate_chars_is_prefix_on_char_boundary() {
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("ñandú", 2), "ña");
        assert_eq!(truncate_chars("", 0), "");
    }

    #[test]
    fn test_field_caps() {
        assert_eq!(CanonicalField::NpiNumber.max_len(), 10);
        assert_eq!(CanonicalField::OrganizationName.max_len(), 255);
        for field in CanonicalField::ALL {
            assert!(field.max_len() >= crate::constants::SENTINEL.len() || field == CanonicalField::NpiNumber);
        }
    }
}
