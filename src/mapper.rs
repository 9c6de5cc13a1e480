/*!
 * Canonical record mapping
 *
 * Turns a filtered bulk-file row or an NPI Registry API result into a
 * [`CanonicalRecord`]. Mapping never fails on missing or odd optional data:
 * such fields become [`SENTINEL`]. Every value is trimmed and cut to its
 * field's maximum length. The only rejection is a missing NPI number, since
 * it is the sink's upsert key.
 */

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use csv::ReaderBuilder;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::constants::{
    LOCATION_ADDRESS_PURPOSE, MAX_TAXONOMY_CODES, PRIMARY_TAXONOMY_SWITCH_BASE, SENTINEL,
    TAXONOMY_CODE_COLUMN_BASE,
};
use crate::data_types::{truncate_chars, CanonicalField, CanonicalRecord, RawRow, TaxonomyCodeSet};
use crate::schema::{NppesColumns, TaxonomySchema};
use crate::{IngestError, Result};

/// Why a source record could not become a canonical record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejected {
    #[error("missing NPI number")]
    MissingIdentifier,
}

/// Bulk-file columns renamed one-to-one onto canonical fields
const FILE_FIELD_MAP: &[(CanonicalField, &str)] = &[
    (CanonicalField::NpiNumber, NppesColumns::NPI),
    (CanonicalField::OrganizationName, NppesColumns::ORGANIZATION_NAME),
    (CanonicalField::Address, NppesColumns::PRACTICE_ADDRESS_LINE_1),
    (CanonicalField::City, NppesColumns::PRACTICE_CITY),
    (CanonicalField::State, NppesColumns::PRACTICE_STATE),
    (CanonicalField::PostalCode, NppesColumns::PRACTICE_POSTAL_CODE),
    (CanonicalField::Phone, NppesColumns::PRACTICE_TELEPHONE),
    (CanonicalField::LastUpdated, NppesColumns::LAST_UPDATE_DATE),
];

/// Maps source records onto the canonical schema
#[derive(Debug, Clone, Default)]
pub struct RecordMapper {
    taxonomy_descriptions: HashMap<String, String>,
    preferred_codes: Option<Arc<TaxonomyCodeSet>>,
}

impl RecordMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use NUCC descriptions for bulk-file rows, which only carry codes
    pub fn with_taxonomy_descriptions(mut self, descriptions: HashMap<String, String>) -> Self {
        self.taxonomy_descriptions = descriptions;
        self
    }

    /// Prefer these codes when a row has no primary taxonomy marked
    pub fn with_preferred_codes(mut self, codes: Arc<TaxonomyCodeSet>) -> Self {
        self.preferred_codes = Some(codes);
        self
    }

    /// Map a bulk-file row
    pub fn map_row(&self, row: &RawRow) -> std::result::Result<CanonicalRecord, Rejected> {
        let mut fields: HashMap<CanonicalField, String> = FILE_FIELD_MAP
            .iter()
            .filter_map(|(field, column)| row.get(column).map(|v| (*field, v.to_string())))
            .collect();

        if !fields.contains_key(&CanonicalField::OrganizationName) {
            if let Some(name) = join_name_parts(&[
                row.get(NppesColumns::PROVIDER_FIRST_NAME),
                row.get(NppesColumns::PROVIDER_MIDDLE_NAME),
                row.get(NppesColumns::PROVIDER_LAST_NAME),
            ]) {
                fields.insert(CanonicalField::OrganizationName, name);
            }
        }

        if let Some(code) = self.row_taxonomy_code(row) {
            if let Some(desc) = self.taxonomy_descriptions.get(code) {
                fields.insert(CanonicalField::TaxonomyDesc, desc.clone());
            }
            fields.insert(CanonicalField::TaxonomyCode, code.to_string());
        }

        if let Some(official) = join_name_parts(&[
            row.get(NppesColumns::OFFICIAL_FIRST_NAME),
            row.get(NppesColumns::OFFICIAL_MIDDLE_NAME),
            row.get(NppesColumns::OFFICIAL_LAST_NAME),
        ]) {
            fields.insert(CanonicalField::AuthorizedOfficial, official);
        }

        finalize(|field| fields.remove(&field))
    }

    /// Map one element of an API response's `results` list
    pub fn map_api_result(&self, result: &Value) -> std::result::Result<CanonicalRecord, Rejected> {
        let basic = result.get("basic").unwrap_or(&Value::Null);
        let str_at = |v: &Value, key: &str| v.get(key).and_then(value_to_string);

        let taxonomy = pick_entry(result.get("taxonomies"), |t| {
            t.get("primary").and_then(Value::as_bool).unwrap_or(false)
        });
        let address = pick_entry(result.get("addresses"), |a| {
            a.get("address_purpose").and_then(Value::as_str) == Some(LOCATION_ADDRESS_PURPOSE)
        });

        let organization_name = str_at(basic, "organization_name")
            .or_else(|| str_at(basic, "name"))
            .or_else(|| {
                join_name_parts(&[
                    basic.get("first_name").and_then(Value::as_str),
                    basic.get("middle_name").and_then(Value::as_str),
                    basic.get("last_name").and_then(Value::as_str),
                ])
            });
        let official = join_name_parts(&[
            basic.get("authorized_official_first_name").and_then(Value::as_str),
            basic.get("authorized_official_middle_name").and_then(Value::as_str),
            basic.get("authorized_official_last_name").and_then(Value::as_str),
        ]);

        finalize(|field| match field {
            CanonicalField::NpiNumber => str_at(result, "number"),
            CanonicalField::OrganizationName => organization_name.clone(),
            CanonicalField::Address => address.and_then(|a| str_at(a, "address_1")),
            CanonicalField::City => address.and_then(|a| str_at(a, "city")),
            CanonicalField::State => address.and_then(|a| str_at(a, "state")),
            CanonicalField::PostalCode => address.and_then(|a| str_at(a, "postal_code")),
            CanonicalField::Phone => address.and_then(|a| str_at(a, "telephone_number")),
            CanonicalField::TaxonomyCode => taxonomy.and_then(|t| str_at(t, "code")),
            CanonicalField::TaxonomyDesc => taxonomy.and_then(|t| str_at(t, "desc")),
            CanonicalField::AuthorizedOfficial => official.clone(),
            CanonicalField::LastUpdated => str_at(basic, "last_updated"),
        })
    }

    /// Primary slot first, then a preferred code, then the first filled slot
    fn row_taxonomy_code<'a>(&self, row: &'a RawRow) -> Option<&'a str> {
        let slots: Vec<(Option<&str>, bool)> = (1..=MAX_TAXONOMY_CODES)
            .map(|slot| {
                let code = row.get(&NppesColumns::slot_column(TAXONOMY_CODE_COLUMN_BASE, slot));
                let primary = row
                    .get(&NppesColumns::slot_column(PRIMARY_TAXONOMY_SWITCH_BASE, slot))
                    .map(|s| s.trim().eq_ignore_ascii_case("Y"))
                    .unwrap_or(false);
                (code, primary)
            })
            .collect();

        slots
            .iter()
            .find_map(|(code, primary)| code.filter(|_| *primary))
            .or_else(|| {
                let preferred = self.preferred_codes.as_ref()?;
                slots.iter().find_map(|(code, _)| code.filter(|c| preferred.contains(c)))
            })
            .or_else(|| slots.iter().find_map(|(code, _)| *code))
    }
}

/// Apply defaults and length caps; reject when there is no NPI
fn finalize<F>(mut value: F) -> std::result::Result<CanonicalRecord, Rejected>
where
    F: FnMut(CanonicalField) -> Option<String>,
{
    let npi = value(CanonicalField::NpiNumber)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(Rejected::MissingIdentifier)?;
    let npi = truncate_chars(&npi, CanonicalField::NpiNumber.max_len()).to_string();

    Ok(CanonicalRecord::from_fn(|field| {
        if field == CanonicalField::NpiNumber {
            return npi.clone();
        }
        let raw = value(field)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let raw = match (field, raw) {
            (CanonicalField::LastUpdated, Some(v)) => Some(normalize_date(&v)),
            (_, raw) => raw,
        };
        let raw = raw.unwrap_or_else(|| SENTINEL.to_string());
        truncate_chars(&raw, field.max_len()).to_string()
    }))
}

/// Join name parts with single spaces; `None` when nothing is left
pub fn join_name_parts(parts: &[Option<&str>]) -> Option<String> {
    let joined = parts
        .iter()
        .map(|p| p.unwrap_or(""))
        .collect::<Vec<_>>()
        .join(" ");
    let collapsed = joined.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Bulk file dates are `MM/DD/YYYY`; the API already uses ISO
fn normalize_date(value: &str) -> String {
    NaiveDate::parse_from_str(value, "%m/%d/%Y")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|_| value.to_string())
}

/// First entry matching `preferred`, else the first entry
fn pick_entry<F>(list: Option<&Value>, preferred: F) -> Option<&Value>
where
    F: Fn(&Value) -> bool,
{
    let entries = list?.as_array()?;
    entries
        .iter()
        .find(|e| preferred(e))
        .or_else(|| entries.first())
}

/// String form of a scalar JSON value
fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Load `code -> description` from a NUCC taxonomy reference CSV
///
/// Uses `Display Name`, falling back to `Classification` and
/// `Specialization`.
pub fn load_taxonomy_descriptions<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| IngestError::io_at(e, path))?;
    let mut reader = ReaderBuilder::new().has_headers(true).flexible(true).from_reader(file);

    let headers: Vec<String> = reader
        .byte_headers()?
        .iter()
        .map(|h| String::from_utf8_lossy(h).trim().to_string())
        .collect();
    TaxonomySchema::validate_headers(&headers)?;

    let position = |name: &str| headers.iter().position(|h| h == name);
    let code_idx = position("Code");
    let display_idx = position("Display Name");
    let class_idx = position("Classification");
    let spec_idx = position("Specialization");

    let mut descriptions = HashMap::new();
    for record in reader.byte_records() {
        let record = record.map_err(|e| IngestError::from(e).with_file(path))?;
        let field = |idx: Option<usize>| {
            idx.and_then(|i| record.get(i))
                .map(|b| String::from_utf8_lossy(b).trim().to_string())
                .filter(|s| !s.is_empty())
        };

        let Some(code) = field(code_idx) else { continue };
        let description = field(display_idx).or_else(|| {
            match (field(class_idx), field(spec_idx)) {
                (Some(c), Some(s)) => Some(format!("{} - {}", c, s)),
                (c, _) => c,
            }
        });
        if let Some(description) = description {
            descriptions.insert(code, description);
        }
    }

    info!(path = %path.display(), codes = descriptions.len(), "Loaded taxonomy descriptions");
    Ok(descriptions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_types::Header;
    use serde_json::json;

    fn row(pairs: &[(&str, &str)]) -> RawRow {
        let header = Arc::new(Header::new(pairs.iter().map(|(k, _)| *k)));
        RawRow::new(header, pairs.iter().map(|(_, v)| v.to_string()).collect())
    }

    #[test]
    fn test_map_row_renames_and_defaults() {
        let row = row(&[
            ("NPI", "1234567893"),
            ("Provider Organization Name (Legal Business Name)", "Hope Recovery Center"),
            ("Provider Business Practice Location Address City Name", "DENVER"),
            ("Healthcare Provider Taxonomy Code_1", "324500000X"),
            ("Healthcare Provider Primary Taxonomy Switch_1", "Y"),
            ("Last Update Date", "07/08/2024"),
            ("Unmapped Column", "dropped"),
        ]);
        let mapper = RecordMapper::new().with_taxonomy_descriptions(HashMap::from([(
            "324500000X".to_string(),
            "Substance Abuse Rehabilitation Facility".to_string(),
        )]));

        let rec = mapper.map_row(&row).unwrap();
        assert_eq!(rec.npi_number, "1234567893");
        assert_eq!(rec.organization_name, "Hope Recovery Center");
        assert_eq!(rec.city, "DENVER");
        assert_eq!(rec.taxonomy_code, "324500000X");
        assert_eq!(rec.taxonomy_desc, "Substance Abuse Rehabilitation Facility");
        assert_eq!(rec.last_updated, "2024-07-08");
        assert_eq!(rec.address, SENTINEL);
        assert_eq!(rec.authorized_official, SENTINEL);
    }

    #[test]
    fn test_authorized_official_concatenation() {
        let row = row(&[
            ("NPI", "1234567893"),
            ("Authorized Official First Name", " JANE "),
            ("Authorized Official Middle Name", ""),
            ("Authorized Official Last Name", "DOE"),
        ]);
        let rec = RecordMapper::new().map_row(&row).unwrap();
        assert_eq!(rec.authorized_official, "JANE DOE");
    }

    #[test]
    fn test_taxonomy_code_prefers_primary_then_target() {
        let codes = Arc::new(TaxonomyCodeSet::new(["3245S0500X"]));
        let no_primary = row(&[
            ("NPI", "1"),
            ("Healthcare Provider Taxonomy Code_1", "207Q00000X"),
            ("Healthcare Provider Taxonomy Code_2", "3245S0500X"),
        ]);
        let mapper = RecordMapper::new().with_preferred_codes(codes);
        assert_eq!(mapper.map_row(&no_primary).unwrap().taxonomy_code, "3245S0500X");
        assert_eq!(RecordMapper::new().map_row(&no_primary).unwrap().taxonomy_code, "207Q00000X");

        let primary = row(&[
            ("NPI", "1"),
            ("Healthcare Provider Taxonomy Code_1", "207Q00000X"),
            ("Healthcare Provider Primary Taxonomy Switch_1", "N"),
            ("Healthcare Provider Taxonomy Code_2", "261QM0801X"),
            ("Healthcare Provider Primary Taxonomy Switch_2", "Y"),
        ]);
        assert_eq!(mapper.map_row(&primary).unwrap().taxonomy_code, "261QM0801X");
    }

    #[test]
    fn test_missing_identifier_is_rejected() {
        let row = row(&[("NPI", "  "), ("Provider Organization Name (Legal Business Name)", "X")]);
        assert_eq!(RecordMapper::new().map_row(&row), Err(Rejected::MissingIdentifier));
        assert_eq!(
            RecordMapper::new().map_api_result(&json!({"basic": {"name": "X"}})),
            Err(Rejected::MissingIdentifier)
        );
    }

    #[test]
    fn test_truncation_is_prefix_and_bounded() {
        let long = "A".repeat(300);
        let row = row(&[
            ("NPI", "12345678901234"),
            ("Provider Organization Name (Legal Business Name)", long.as_str()),
            ("Provider Business Practice Location Address Postal Code", "802021234567890123456789"),
        ]);
        let rec = RecordMapper::new().map_row(&row).unwrap();
        for field in CanonicalField::ALL {
            assert!(rec.get(field).chars().count() <= field.max_len(), "{} too long", field);
        }
        assert_eq!(rec.npi_number, "1234567890");
        assert!(long.starts_with(&rec.organization_name));
        assert!("802021234567890123456789".starts_with(&rec.postal_code));
    }

    #[test]
    fn test_map_api_result_prefers_primary_and_location() {
        let result = json!({
            "number": 1234567893u64,
            "basic": {
                "organization_name": "Mountain View Treatment",
                "last_updated": "2023-01-15",
                "authorized_official_first_name": "Sam",
                "authorized_official_last_name": "Lee"
            },
            "taxonomies": [
                {"code": "207Q00000X", "desc": "Family Medicine", "primary": false},
                {"code": "324500000X", "desc": "Substance Abuse Rehabilitation Facility", "primary": true}
            ],
            "addresses": [
                {"address_purpose": "MAILING", "address_1": "PO BOX 1", "city": "BOULDER", "state": "CO"},
                {"address_purpose": "LOCATION", "address_1": "1 MAIN ST", "city": "DENVER", "state": "CO",
                 "postal_code": "802021234", "telephone_number": "303-555-0100"}
            ]
        });

        let rec = RecordMapper::new().map_api_result(&result).unwrap();
        assert_eq!(rec.npi_number, "1234567893");
        assert_eq!(rec.organization_name, "Mountain View Treatment");
        assert_eq!(rec.taxonomy_code, "324500000X");
        assert_eq!(rec.taxonomy_desc, "Substance Abuse Rehabilitation Facility");
        assert_eq!(rec.address, "1 MAIN ST");
        assert_eq!(rec.city, "DENVER");
        assert_eq!(rec.phone, "303-555-0100");
        assert_eq!(rec.authorized_official, "Sam Lee");
        assert_eq!(rec.last_updated, "2023-01-15");
    }

    #[test]
    fn test_map_api_result_falls_back_to_first_entries() {
        let result = json!({
            "number": "1234567893",
            "basic": {"first_name": "ANA", "last_name": "RUIZ"},
            "taxonomies": [{"code": "101YM0800X", "desc": "Counselor, Mental Health"}],
            "addresses": [{"address_purpose": "MAILING", "city": "AUSTIN"}]
        });

        let rec = RecordMapper::new().map_api_result(&result).unwrap();
        assert_eq!(rec.organization_name, "ANA RUIZ");
        assert_eq!(rec.taxonomy_code, "101YM0800X");
        assert_eq!(rec.city, "AUSTIN");
        assert_eq!(rec.state, SENTINEL);
        assert_eq!(rec.authorized_official, SENTINEL);
    }

    #[test]
    fn test_load_taxonomy_descriptions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nucc_taxonomy_250.csv");
        std::fs::write(
            &path,
            "Code,Grouping,Classification,Specialization,Definition,Notes,Display Name,Section\n\
             324500000X,Suppliers,Substance Abuse Rehabilitation Facility,,,,Substance Abuse Rehabilitation Facility,Non-Individual\n\
             3245S0500X,Suppliers,Substance Abuse Rehabilitation Facility,\"Substance Abuse Treatment, Children\",,,,Non-Individual\n",
        )
        .unwrap();

        let map = load_taxonomy_descriptions(&path).unwrap();
        assert_eq!(map["324500000X"], "Substance Abuse Rehabilitation Facility");
        assert_eq!(
            map["3245S0500X"],
            "Substance Abuse Rehabilitation Facility - Substance Abuse Treatment, Children"
        );
    }
}
