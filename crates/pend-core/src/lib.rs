//! Core domain model and provenance types for pendency ingestion.

use std::fmt;
use std::path::PathBuf;

use chrono::{NaiveDateTime, DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pend-core";

/// Timestamp layout used for every persisted date-time column.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// One typed spreadsheet cell value. Empty cells are represented as `None` in [`RawRow`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Integer(i64),
    Number(f64),
    Bool(bool),
    DateTime(NaiveDateTime),
    Text(String),
}

impl CellValue {
    pub fn to_json(&self) -> JsonValue {
        match self {
            CellValue::Integer(v) => JsonValue::from(*v),
            CellValue::Number(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(v.to_string())),
            CellValue::Bool(v) => JsonValue::Bool(*v),
            CellValue::DateTime(v) => JsonValue::String(v.format(TIMESTAMP_FORMAT).to_string()),
            CellValue::Text(v) => JsonValue::String(v.clone()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Integer(v) => Some(*v as f64),
            CellValue::Number(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Integer(v) => write!(f, "{v}"),
            CellValue::Number(v) if v.fract() == 0.0 && v.abs() < 1e15 => write!(f, "{v:.0}"),
            CellValue::Number(v) => write!(f, "{v}"),
            CellValue::Bool(v) => write!(f, "{v}"),
            CellValue::DateTime(v) => write!(f, "{}", v.format(TIMESTAMP_FORMAT)),
            CellValue::Text(v) => f.write_str(v.trim()),
        }
    }
}

/// One extracted spreadsheet row: ordered column-name to optional-value pairs plus the
/// sheet and 1-based row number it was read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub sheet: String,
    pub row_number: u32,
    pub cells: Vec<(String, Option<CellValue>)>,
}

impl RawRow {
    pub fn new(sheet: impl Into<String>, row_number: u32) -> Self {
        Self {
            sheet: sheet.into(),
            row_number,
            cells: Vec::new(),
        }
    }

    pub fn push(&mut self, column: impl Into<String>, value: Option<CellValue>) {
        self.cells.push((column.into(), value));
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .and_then(|(_, value)| value.as_ref())
    }

    /// True when every column is empty (or whitespace-only text).
    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|(_, value)| match value {
            None => true,
            Some(CellValue::Text(text)) => text.trim().is_empty(),
            Some(_) => false,
        })
    }

    /// Verbatim audit snapshot stored alongside the classified record.
    pub fn to_payload_json(&self) -> String {
        let mut row = Map::new();
        for (column, value) in &self.cells {
            row.insert(
                column.clone(),
                value.as_ref().map(CellValue::to_json).unwrap_or(JsonValue::Null),
            );
        }
        serde_json::json!({
            "aba": self.sheet,
            "linha": self.row_number,
            "row": JsonValue::Object(row),
        })
        .to_string()
    }
}

/// Semantic fields produced by the normalizer for one row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CanonicalFields {
    pub cnpj: Option<String>,
    pub cgf: Option<String>,
    pub razao: Option<String>,
    pub tipo_pendencia: Option<String>,
    pub period: Option<String>,
    pub amount: Option<f64>,
    pub detail: Option<String>,
    pub reference_date: Option<String>,
}

/// Row-level fact. Identity is the provenance fingerprint, never the row content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendencyRecord {
    pub fingerprint: String,
    pub source: Option<String>,
    pub file_name: String,
    pub sheet_name: String,
    pub row_number: u32,
    pub fields: CanonicalFields,
    pub collected_at: NaiveDateTime,
    pub raw_payload: String,
}

/// Outcome of ingesting one distinct (file name, content hash) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileImportEntry {
    pub file_name: String,
    pub content_hash: String,
    pub imported_at: NaiveDateTime,
    pub rows_read: u64,
    pub rows_inserted: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    Ok,
    Skipped,
    Error,
    CopiedOnLock,
    MoveFailed,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Ok => "OK",
            FileStatus::Skipped => "SKIPPED",
            FileStatus::Error => "ERROR",
            FileStatus::CopiedOnLock => "COPIED_ON_LOCK",
            FileStatus::MoveFailed => "MOVE_FAILED",
        }
    }

    /// Statuses whose rows were committed to the store.
    pub fn is_committed(self) -> bool {
        matches!(
            self,
            FileStatus::Ok | FileStatus::CopiedOnLock | FileStatus::MoveFailed
        )
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-file line of a [`BatchReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDetail {
    pub file_name: String,
    pub status: FileStatus,
    pub content_hash: Option<String>,
    pub rows_read: u64,
    pub rows_inserted: u64,
    pub destination: Option<PathBuf>,
    pub error: Option<String>,
}

impl FileDetail {
    pub fn new(file_name: impl Into<String>, status: FileStatus) -> Self {
        Self {
            file_name: file_name.into(),
            status,
            content_hash: None,
            rows_read: 0,
            rows_inserted: 0,
            destination: None,
            error: None,
        }
    }
}

/// Sole output contract of one ingestion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files_total: usize,
    pub files_imported: usize,
    pub rows_read: u64,
    pub rows_inserted: u64,
    pub details: Vec<FileDetail>,
}

impl BatchReport {
    pub fn begin(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            files_total: 0,
            files_imported: 0,
            rows_read: 0,
            rows_inserted: 0,
            details: Vec::new(),
        }
    }

    pub fn push(&mut self, detail: FileDetail) {
        if detail.status.is_committed() {
            self.files_imported += 1;
            self.rows_read += detail.rows_read;
            self.rows_inserted += detail.rows_inserted;
        }
        self.details.push(detail);
    }

    pub fn detail_for(&self, file_name: &str) -> Option<&FileDetail> {
        self.details.iter().find(|d| d.file_name == file_name)
    }

    pub fn count_status(&self, status: FileStatus) -> usize {
        self.details.iter().filter(|d| d.status == status).count()
    }
}

/// Aggregate reporting row grouped by taxpayer, kind and period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub cnpj: String,
    pub cgf: String,
    pub razao: String,
    pub tipo_pendencia: String,
    pub period: String,
    pub count: i64,
    pub total_amount: f64,
    pub last_collected: String,
}

/// One classified row as shown in the detail view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailRow {
    pub cnpj: String,
    pub cgf: String,
    pub razao: String,
    pub tipo_pendencia: String,
    pub period: String,
    pub amount: f64,
    pub detail: String,
    pub reference_date: String,
    pub file_name: String,
    pub sheet_name: String,
    pub row_number: i64,
    pub collected_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: Vec<(&str, Option<CellValue>)>) -> RawRow {
        let mut raw = RawRow::new("Débitos", 2);
        for (column, value) in cells {
            raw.push(column, value);
        }
        raw
    }

    #[test]
    fn whitespace_only_rows_are_blank() {
        let blank = row(vec![
            ("CNPJ", None),
            ("Razão Social", Some(CellValue::Text("   ".into()))),
        ]);
        assert!(blank.is_blank());

        let zero = row(vec![("Valor", Some(CellValue::Integer(0)))]);
        assert!(!zero.is_blank());
    }

    #[test]
    fn payload_keeps_sheet_row_and_nulls() {
        let raw = row(vec![
            ("CNPJ", Some(CellValue::Text("07.123.456/0001-99".into()))),
            ("Valor", Some(CellValue::Number(10.5))),
            ("Obs", None),
        ]);
        let payload: JsonValue = serde_json::from_str(&raw.to_payload_json()).unwrap();
        assert_eq!(payload["aba"], "Débitos");
        assert_eq!(payload["linha"], 2);
        assert_eq!(payload["row"]["CNPJ"], "07.123.456/0001-99");
        assert_eq!(payload["row"]["Valor"], 10.5);
        assert!(payload["row"]["Obs"].is_null());
    }

    #[test]
    fn whole_numbers_render_without_decimals() {
        assert_eq!(CellValue::Number(7123456000199.0).to_string(), "7123456000199");
        assert_eq!(CellValue::Number(1.25).to_string(), "1.25");
    }

    #[test]
    fn report_only_counts_committed_files() {
        let mut report = BatchReport::begin(Uuid::new_v4(), Utc::now());
        let mut ok = FileDetail::new("a.xlsx", FileStatus::Ok);
        ok.rows_read = 3;
        ok.rows_inserted = 2;
        report.push(ok);
        report.push(FileDetail::new("b.xlsx", FileStatus::Skipped));
        let mut copied = FileDetail::new("c.xlsx", FileStatus::CopiedOnLock);
        copied.rows_read = 1;
        copied.rows_inserted = 1;
        report.push(copied);

        assert_eq!(report.files_imported, 2);
        assert_eq!(report.rows_read, 4);
        assert_eq!(report.rows_inserted, 3);
        assert_eq!(report.count_status(FileStatus::Skipped), 1);
    }

    #[test]
    fn status_tags_serialize_as_contract_strings() {
        let tags = [
            FileStatus::Ok,
            FileStatus::Skipped,
            FileStatus::Error,
            FileStatus::CopiedOnLock,
            FileStatus::MoveFailed,
        ]
        .map(|s| serde_json::to_string(&s).unwrap());
        assert_eq!(
            tags,
            [
                "\"OK\"",
                "\"SKIPPED\"",
                "\"ERROR\"",
                "\"COPIED_ON_LOCK\"",
                "\"MOVE_FAILED\""
            ]
        );
    }
}
