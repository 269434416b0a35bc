//! Workbook reader and row normalizer contracts, plus the calamine, fixture and rule-based
//! implementations used by the importer.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Range, Reader};
use chrono::{NaiveDate, NaiveDateTime};
use pend_core::{CanonicalFields, CellValue, RawRow, TIMESTAMP_FORMAT};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "pend-adapters";

/// Accepted sheet names and the pendency kind each one reports.
pub const DEFAULT_SHEET_KINDS: &[(&str, &str)] = &[
    ("Omissões de EFD", "OMISSAO_EFD"),
    ("Débitos", "DEBITO"),
    ("Omissões e divergências de NFE", "OMISSAO_DIVERGENCIA_NFE"),
    ("NFe inexistente declarada", "NFE_INEXISTENTE"),
    ("Omissões e Divergências CFe", "OMISSAO_DIVERGENCIA_CFE"),
    ("CTE escriturado com divergência", "CTE_DIVERGENCIA"),
    ("NFe sem REG_PAS", "NFE_SEM_REG_PAS"),
    ("Outros limitadores", "OUTROS_LIMITADORES"),
];

pub fn default_accepted_sheets() -> Vec<String> {
    DEFAULT_SHEET_KINDS
        .iter()
        .map(|(name, _)| name.to_string())
        .collect()
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("reading workbook {path}: {message}")]
    Workbook { path: PathBuf, message: String },
    #[error("no normalization rule for sheet {0:?}")]
    UnknownSheet(String),
    #[error("sheet {sheet:?} row {row}: {message}")]
    Classification {
        sheet: String,
        row: u32,
        message: String,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Rows extracted from one accepted sheet, in sheet order.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetRows {
    pub sheet: String,
    pub rows: Vec<RawRow>,
}

pub trait WorkbookReader: Send + Sync {
    fn list_sheets(&self, path: &Path) -> Result<Vec<String>, AdapterError>;

    fn read_rows(&self, path: &Path, sheet: &str) -> Result<Vec<RawRow>, AdapterError>;

    /// Read every sheet on the allow-list, in workbook order. Other sheets are ignored.
    fn read_accepted(&self, path: &Path, accepted: &[String]) -> Result<Vec<SheetRows>, AdapterError> {
        let mut out = Vec::new();
        for sheet in self.list_sheets(path)? {
            if !is_accepted(&sheet, accepted) {
                debug!(file = %path.display(), sheet = %sheet, "ignoring sheet outside allow-list");
                continue;
            }
            let rows = self.read_rows(path, &sheet)?;
            out.push(SheetRows { sheet, rows });
        }
        Ok(out)
    }
}

fn is_accepted(sheet: &str, accepted: &[String]) -> bool {
    accepted.iter().any(|name| name.trim() == sheet.trim())
}

/// `.xlsx`/`.xls`/`.ods` reader backed by calamine.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalamineWorkbookReader;

impl CalamineWorkbookReader {
    fn open(
        path: &Path,
    ) -> Result<calamine::Sheets<std::io::BufReader<fs::File>>, AdapterError> {
        open_workbook_auto(path).map_err(|e| AdapterError::Workbook {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

impl WorkbookReader for CalamineWorkbookReader {
    fn list_sheets(&self, path: &Path) -> Result<Vec<String>, AdapterError> {
        Ok(Self::open(path)?.sheet_names())
    }

    fn read_rows(&self, path: &Path, sheet: &str) -> Result<Vec<RawRow>, AdapterError> {
        let mut workbook = Self::open(path)?;
        let range = workbook
            .worksheet_range(sheet)
            .map_err(|e| AdapterError::Workbook {
                path: path.to_path_buf(),
                message: format!("sheet {sheet:?}: {e}"),
            })?;
        Ok(rows_from_range(sheet, &range))
    }

    fn read_accepted(&self, path: &Path, accepted: &[String]) -> Result<Vec<SheetRows>, AdapterError> {
        let mut workbook = Self::open(path)?;
        let mut out = Vec::new();
        for sheet in workbook.sheet_names() {
            if !is_accepted(&sheet, accepted) {
                debug!(file = %path.display(), sheet = %sheet, "ignoring sheet outside allow-list");
                continue;
            }
            let range = workbook
                .worksheet_range(&sheet)
                .map_err(|e| AdapterError::Workbook {
                    path: path.to_path_buf(),
                    message: format!("sheet {sheet:?}: {e}"),
                })?;
            let rows = rows_from_range(&sheet, &range);
            out.push(SheetRows { sheet, rows });
        }
        Ok(out)
    }
}

/// First row of the used range is the header; data rows carry their real sheet row number.
pub fn rows_from_range(sheet: &str, range: &Range<Data>) -> Vec<RawRow> {
    let first_row = range.start().map(|(row, _)| row).unwrap_or(0);
    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Vec::new();
    };
    let columns = header_names(header.iter().map(|cell| cell_from_data(cell).map(|v| v.to_string())));

    rows.enumerate()
        .map(|(offset, cells)| {
            let row_number = first_row + 2 + offset as u32;
            let mut raw = RawRow::new(sheet, row_number);
            for (idx, column) in columns.iter().enumerate() {
                raw.push(column.clone(), cells.get(idx).and_then(cell_from_data));
            }
            raw
        })
        .collect()
}

pub fn cell_from_data(cell: &Data) -> Option<CellValue> {
    match cell {
        Data::Empty => None,
        Data::String(s) if s.trim().is_empty() => None,
        Data::String(s) => Some(CellValue::Text(s.clone())),
        Data::Int(v) => Some(CellValue::Integer(*v)),
        Data::Float(v) => Some(CellValue::Number(*v)),
        Data::Bool(v) => Some(CellValue::Bool(*v)),
        Data::DateTime(dt) => Some(
            dt.as_datetime()
                .map(CellValue::DateTime)
                .unwrap_or_else(|| CellValue::Number(dt.as_f64())),
        ),
        Data::DateTimeIso(s) => Some(
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .map(CellValue::DateTime)
                .unwrap_or_else(|_| CellValue::Text(s.clone())),
        ),
        Data::DurationIso(s) => Some(CellValue::Text(s.clone())),
        Data::Error(e) => Some(CellValue::Text(e.to_string())),
    }
}

/// Trimmed header names; blanks become `coluna_N`, repeats get a `_N` suffix.
pub fn header_names<I>(cells: I) -> Vec<String>
where
    I: IntoIterator<Item = Option<String>>,
{
    let mut seen = BTreeSet::new();
    let mut names = Vec::new();
    for (idx, cell) in cells.into_iter().enumerate() {
        let base = cell
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("coluna_{}", idx + 1));
        let mut name = base.clone();
        let mut n = 2;
        while !seen.insert(name.clone()) {
            name = format!("{base}_{n}");
            n += 1;
        }
        names.push(name);
    }
    names
}

/// JSON stand-in for a workbook: `{"sheets":[{"name":..,"rows":[[header..],[..]]}]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureWorkbook {
    pub sheets: Vec<FixtureSheet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureSheet {
    pub name: String,
    /// 1-based sheet row holding the header.
    #[serde(default = "default_header_row")]
    pub header_row: u32,
    #[serde(default)]
    pub rows: Vec<Vec<JsonValue>>,
}

fn default_header_row() -> u32 {
    1
}

/// Reads [`FixtureWorkbook`] JSON regardless of the file's extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixtureWorkbookReader;

impl FixtureWorkbookReader {
    fn load(path: &Path) -> Result<FixtureWorkbook, AdapterError> {
        read_json_file(path).map_err(|e| AdapterError::Workbook {
            path: path.to_path_buf(),
            message: format!("{e:#}"),
        })
    }
}

impl WorkbookReader for FixtureWorkbookReader {
    fn list_sheets(&self, path: &Path) -> Result<Vec<String>, AdapterError> {
        Ok(Self::load(path)?.sheets.into_iter().map(|s| s.name).collect())
    }

    fn read_rows(&self, path: &Path, sheet: &str) -> Result<Vec<RawRow>, AdapterError> {
        let workbook = Self::load(path)?;
        let fixture = workbook
            .sheets
            .iter()
            .find(|s| s.name == sheet)
            .ok_or_else(|| AdapterError::Workbook {
                path: path.to_path_buf(),
                message: format!("sheet {sheet:?} not found"),
            })?;
        Ok(fixture_rows(fixture))
    }
}

fn fixture_rows(sheet: &FixtureSheet) -> Vec<RawRow> {
    let mut rows = sheet.rows.iter();
    let Some(header) = rows.next() else {
        return Vec::new();
    };
    let columns = header_names(header.iter().map(|v| cell_from_json(v).map(|c| c.to_string())));
    rows.enumerate()
        .map(|(offset, cells)| {
            let row_number = sheet.header_row + 1 + offset as u32;
            let mut raw = RawRow::new(&sheet.name, row_number);
            for (idx, column) in columns.iter().enumerate() {
                raw.push(column.clone(), cells.get(idx).and_then(cell_from_json));
            }
            raw
        })
        .collect()
}

fn cell_from_json(value: &JsonValue) -> Option<CellValue> {
    match value {
        JsonValue::Null => None,
        JsonValue::Bool(v) => Some(CellValue::Bool(*v)),
        JsonValue::Number(n) => n
            .as_i64()
            .map(CellValue::Integer)
            .or_else(|| n.as_f64().map(CellValue::Number)),
        JsonValue::String(s) if s.trim().is_empty() => None,
        JsonValue::String(s) => Some(CellValue::Text(s.clone())),
        other => Some(CellValue::Text(other.to_string())),
    }
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Maps one raw row plus its sheet to the canonical pendency fields.
pub trait Normalizer: Send + Sync {
    fn classify(&self, sheet: &str, row: &RawRow) -> Result<CanonicalFields, AdapterError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnAliases {
    #[serde(default)]
    pub cnpj: Vec<String>,
    #[serde(default)]
    pub cgf: Vec<String>,
    #[serde(default)]
    pub razao: Vec<String>,
    #[serde(default)]
    pub period: Vec<String>,
    #[serde(default)]
    pub amount: Vec<String>,
    #[serde(default)]
    pub detail: Vec<String>,
    #[serde(default)]
    pub reference_date: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Canonical {
    Cnpj,
    Cgf,
    Razao,
    Period,
    Amount,
    Detail,
    ReferenceDate,
}

const CANONICAL_ORDER: [Canonical; 7] = [
    Canonical::Cnpj,
    Canonical::Cgf,
    Canonical::Razao,
    Canonical::Period,
    Canonical::Amount,
    Canonical::Detail,
    Canonical::ReferenceDate,
];

impl ColumnAliases {
    fn for_column(&self, column: Canonical) -> &[String] {
        match column {
            Canonical::Cnpj => &self.cnpj,
            Canonical::Cgf => &self.cgf,
            Canonical::Razao => &self.razao,
            Canonical::Period => &self.period,
            Canonical::Amount => &self.amount,
            Canonical::Detail => &self.detail,
            Canonical::ReferenceDate => &self.reference_date,
        }
    }

    fn builtin() -> Self {
        fn list(items: &[&str]) -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        }
        Self {
            cnpj: list(&["CNPJ", "CNPJ/CPF", "CPF/CNPJ", "CNPJ Contribuinte", "CNPJ Estabelecimento"]),
            cgf: list(&["CGF", "Inscrição Estadual", "IE", "CGF Contribuinte"]),
            razao: list(&["Razão Social", "Nome Empresarial", "Contribuinte", "Nome"]),
            period: list(&["Período", "Competência", "Mês/Ano", "Período de Apuração"]),
            amount: list(&["Valor", "Valor Total", "Saldo Devedor", "Valor do Débito", "Valor ICMS"]),
            detail: list(&["Detalhe", "Descrição", "Observação", "Motivo", "Situação"]),
            reference_date: list(&["Data de Referência", "Data Referência", "Data", "Data de Emissão", "Vencimento"]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetRule {
    pub name: String,
    pub kind: String,
    /// Sheet-specific aliases, tried before the global ones.
    #[serde(default)]
    pub columns: ColumnAliases,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizerRules {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default)]
    pub columns: ColumnAliases,
    #[serde(default)]
    pub sheets: Vec<SheetRule>,
}

fn default_similarity_threshold() -> f64 {
    0.93
}

impl Default for NormalizerRules {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            columns: ColumnAliases::builtin(),
            sheets: DEFAULT_SHEET_KINDS
                .iter()
                .map(|(name, kind)| SheetRule {
                    name: name.to_string(),
                    kind: kind.to_string(),
                    columns: ColumnAliases::default(),
                })
                .collect(),
        }
    }
}

/// Alias-driven classifier. Headers match after accent and case folding, then by
/// Jaro-Winkler similarity above the configured threshold.
#[derive(Debug, Clone)]
pub struct RuleNormalizer {
    rules: NormalizerRules,
}

impl Default for RuleNormalizer {
    fn default() -> Self {
        Self::new(NormalizerRules::default())
    }
}

impl RuleNormalizer {
    pub fn new(rules: NormalizerRules) -> Self {
        Self { rules }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let rules: NormalizerRules = serde_yaml::from_str(text).context("parsing normalizer rules")?;
        Ok(Self::new(rules))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let rules: NormalizerRules =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(rules))
    }

    /// Rules from `path` when it exists, built-in rules otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            info!(path = %path.display(), "loading normalizer rules");
            Self::from_path(path)
        } else {
            debug!(path = %path.display(), "no rules file; using built-in normalizer rules");
            Ok(Self::default())
        }
    }

    pub fn rules(&self) -> &NormalizerRules {
        &self.rules
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.rules.sheets.iter().map(|s| s.name.clone()).collect()
    }

    fn rule_for(&self, sheet: &str) -> Option<&SheetRule> {
        let wanted = fold_text(sheet);
        self.rules
            .sheets
            .iter()
            .find(|rule| rule.name.trim() == sheet.trim())
            .or_else(|| self.rules.sheets.iter().find(|rule| fold_text(&rule.name) == wanted))
    }

    fn aliases<'a>(&'a self, rule: &'a SheetRule, column: Canonical) -> impl Iterator<Item = &'a String> {
        rule.columns
            .for_column(column)
            .iter()
            .chain(self.rules.columns.for_column(column).iter())
    }

    fn resolve_columns(&self, rule: &SheetRule, headers: &[String]) -> BTreeMap<Canonical, usize> {
        let folded: Vec<String> = headers.iter().map(|h| fold_text(h)).collect();
        let mut claimed = BTreeSet::new();
        let mut resolved = BTreeMap::new();

        for column in CANONICAL_ORDER {
            let hit = self.aliases(rule, column).find_map(|alias| {
                let alias = fold_text(alias);
                folded
                    .iter()
                    .enumerate()
                    .find(|(idx, header)| **header == alias && !claimed.contains(idx))
                    .map(|(idx, _)| idx)
            });
            if let Some(idx) = hit {
                claimed.insert(idx);
                resolved.insert(column, idx);
            }
        }

        for column in CANONICAL_ORDER {
            if resolved.contains_key(&column) {
                continue;
            }
            let mut best: Option<(usize, f64)> = None;
            for alias in self.aliases(rule, column) {
                let alias = fold_text(alias);
                for (idx, header) in folded.iter().enumerate() {
                    if claimed.contains(&idx) {
                        continue;
                    }
                    let score = jaro_winkler(header, &alias);
                    if score >= self.rules.similarity_threshold
                        && best.map_or(true, |(_, s)| score > s)
                    {
                        best = Some((idx, score));
                    }
                }
            }
            if let Some((idx, _)) = best {
                claimed.insert(idx);
                resolved.insert(column, idx);
            }
        }
        resolved
    }
}

impl Normalizer for RuleNormalizer {
    fn classify(&self, sheet: &str, row: &RawRow) -> Result<CanonicalFields, AdapterError> {
        let rule = self
            .rule_for(sheet)
            .ok_or_else(|| AdapterError::UnknownSheet(sheet.to_string()))?;
        let headers: Vec<String> = row.cells.iter().map(|(name, _)| name.clone()).collect();
        let resolved = self.resolve_columns(rule, &headers);
        let value = |column: Canonical| {
            resolved
                .get(&column)
                .and_then(|idx| row.cells.get(*idx))
                .and_then(|(_, v)| v.as_ref())
        };

        let amount = match value(Canonical::Amount) {
            None => None,
            Some(cell) => Some(cell_amount(cell).ok_or_else(|| AdapterError::Classification {
                sheet: sheet.to_string(),
                row: row.row_number,
                message: format!("unreadable amount {cell}"),
            })?),
        };

        let detail = match value(Canonical::Detail) {
            Some(cell) => text_or_none(cell.to_string()),
            None => {
                let used: BTreeSet<usize> = resolved.values().copied().collect();
                let folded: Vec<String> = row
                    .cells
                    .iter()
                    .enumerate()
                    .filter(|(idx, _)| !used.contains(idx))
                    .filter_map(|(_, (name, v))| {
                        v.as_ref()
                            .and_then(|v| text_or_none(v.to_string()))
                            .map(|v| format!("{name}: {v}"))
                    })
                    .collect();
                text_or_none(folded.join(" | "))
            }
        };

        Ok(CanonicalFields {
            cnpj: value(Canonical::Cnpj).and_then(cnpj_digits),
            cgf: value(Canonical::Cgf).and_then(|c| digits_or_none(&c.to_string())),
            razao: value(Canonical::Razao).and_then(|c| text_or_none(c.to_string())),
            tipo_pendencia: Some(rule.kind.clone()),
            period: value(Canonical::Period).and_then(period_text),
            amount,
            detail,
            reference_date: value(Canonical::ReferenceDate).and_then(date_text),
        })
    }
}

/// Lowercase, strip Portuguese diacritics, collapse non-alphanumerics to single spaces.
pub fn fold_text(input: &str) -> String {
    input
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            'ñ' => 'n',
            other if other.is_ascii_alphanumeric() => other,
            _ => ' ',
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn digits_or_none(text: &str) -> Option<String> {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Numeric cells lose leading zeros, so they are padded back to 14 digits.
fn cnpj_digits(cell: &CellValue) -> Option<String> {
    match cell {
        CellValue::Integer(v) if *v >= 0 => Some(format!("{v:014}")),
        CellValue::Number(v) if *v >= 0.0 && v.fract() == 0.0 && *v < 1e15 => {
            Some(format!("{:014}", *v as i64))
        }
        other => digits_or_none(&other.to_string()),
    }
}

fn cell_amount(cell: &CellValue) -> Option<f64> {
    match cell {
        CellValue::Text(text) => parse_brl_amount(text),
        other => other.as_f64(),
    }
}

/// Parses `R$ 1.234,56`, `-1.234,56`, `(1.234,56)` and plain `1234.56`.
pub fn parse_brl_amount(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let negative = trimmed.starts_with('-') || (trimmed.starts_with('(') && trimmed.ends_with(')'));
    let kept: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();
    if !kept.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let normalized = if kept.contains(',') {
        kept.replace('.', "").replace(',', ".")
    } else if kept.matches('.').count() > 1 {
        kept.replace('.', "")
    } else if let Some((_, frac)) = kept.split_once('.') {
        if frac.len() == 3 {
            kept.replace('.', "")
        } else {
            kept
        }
    } else {
        kept
    };

    let value: f64 = normalized.parse().ok()?;
    Some(if negative { -value } else { value })
}

fn period_text(cell: &CellValue) -> Option<String> {
    match cell {
        CellValue::DateTime(dt) => Some(dt.format("%m/%Y").to_string()),
        other => text_or_none(other.to_string()),
    }
}

fn date_text(cell: &CellValue) -> Option<String> {
    match cell {
        CellValue::DateTime(dt) => Some(dt.format("%Y-%m-%d").to_string()),
        CellValue::Text(text) => {
            let text = text.trim();
            NaiveDate::parse_from_str(text, "%d/%m/%Y")
                .map(|d| d.format("%Y-%m-%d").to_string())
                .ok()
                .or_else(|| {
                    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
                        .map(|d| d.format("%Y-%m-%d").to_string())
                        .ok()
                })
                .or_else(|| text_or_none(text.to_string()))
        }
        other => text_or_none(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(sheet: &str, cells: Vec<(&str, Option<CellValue>)>) -> RawRow {
        let mut raw = RawRow::new(sheet, 2);
        for (column, value) in cells {
            raw.push(column, value);
        }
        raw
    }

    fn text(v: &str) -> Option<CellValue> {
        Some(CellValue::Text(v.to_string()))
    }

    #[test]
    fn fixture_reader_numbers_rows_from_the_sheet() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pendencias.xlsx");
        std::fs::write(
            &path,
            serde_json::json!({
                "sheets": [
                    {"name": "Débitos", "rows": [
                        ["CNPJ", "Valor"],
                        ["07.123.456/0001-99", 10.5],
                        [null, ""],
                        ["11.222.333/0001-44", 3]
                    ]},
                    {"name": "Instruções", "rows": [["texto"], ["leia-me"]]}
                ]
            })
            .to_string(),
        )
        .unwrap();

        let sheets = FixtureWorkbookReader
            .read_accepted(&path, &default_accepted_sheets())
            .unwrap();
        assert_eq!(sheets.len(), 1);
        let rows = &sheets[0].rows;
        assert_eq!(rows.iter().map(|r| r.row_number).collect::<Vec<_>>(), vec![2, 3, 4]);
        assert!(rows[1].is_blank());
        assert_eq!(rows[2].get("Valor"), Some(&CellValue::Integer(3)));
    }

    #[test]
    fn unreadable_fixture_is_a_workbook_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quebrado.xlsx");
        std::fs::write(&path, b"PK\x03\x04 not json").unwrap();
        let err = FixtureWorkbookReader.list_sheets(&path).unwrap_err();
        assert!(matches!(err, AdapterError::Workbook { .. }));
    }

    #[test]
    fn range_rows_use_real_sheet_positions() {
        let mut range = Range::new((2, 0), (4, 1));
        range.set_value((2, 0), Data::String("CNPJ".into()));
        range.set_value((2, 1), Data::String("CNPJ".into()));
        range.set_value((3, 0), Data::Float(7123456000199.0));
        range.set_value((4, 1), Data::String("x".into()));

        let rows = rows_from_range("Débitos", &range);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].row_number, 4);
        assert_eq!(rows[1].row_number, 5);
        assert_eq!(rows[0].cells[1].0, "CNPJ_2");
        assert_eq!(rows[0].get("CNPJ"), Some(&CellValue::Number(7123456000199.0)));
    }

    #[test]
    fn header_names_fill_blanks_and_dedupe() {
        let names = header_names(vec![Some(" Valor ".into()), None, Some("Valor".into())]);
        assert_eq!(names, vec!["Valor", "coluna_2", "Valor_2"]);
    }

    #[test]
    fn classifies_known_sheet_with_accent_and_case_folding() {
        let normalizer = RuleNormalizer::default();
        let raw = row(
            "Débitos",
            vec![
                ("cnpj", text("07.123.456/0001-99")),
                ("RAZAO SOCIAL", text(" ACME LTDA ")),
                ("Periodo", text("01/2026")),
                ("Valor", text("R$ 1.234,56")),
                ("Data de Referencia", text("15/02/2026")),
            ],
        );
        let fields = normalizer.classify("Débitos", &raw).unwrap();
        assert_eq!(fields.cnpj.as_deref(), Some("07123456000199"));
        assert_eq!(fields.razao.as_deref(), Some("ACME LTDA"));
        assert_eq!(fields.tipo_pendencia.as_deref(), Some("DEBITO"));
        assert_eq!(fields.period.as_deref(), Some("01/2026"));
        assert_eq!(fields.amount, Some(1234.56));
        assert_eq!(fields.reference_date.as_deref(), Some("2026-02-15"));
    }

    #[test]
    fn fuzzy_header_match_and_numeric_cnpj_padding() {
        let normalizer = RuleNormalizer::default();
        let raw = row(
            "Outros limitadores",
            vec![
                ("CNPJ", Some(CellValue::Number(7123456000199.0))),
                ("Razão Socail", text("ACME")),
            ],
        );
        let fields = normalizer.classify("Outros limitadores", &raw).unwrap();
        assert_eq!(fields.cnpj.as_deref(), Some("07123456000199"));
        assert_eq!(fields.razao.as_deref(), Some("ACME"));
        assert_eq!(fields.tipo_pendencia.as_deref(), Some("OUTROS_LIMITADORES"));
    }

    #[test]
    fn unmapped_columns_fold_into_detail() {
        let normalizer = RuleNormalizer::default();
        let raw = row(
            "NFe sem REG_PAS",
            vec![
                ("CNPJ", text("07123456000199")),
                ("Chave NFe", text("3526")),
                ("Vazio", None),
                ("Emitente", text("XYZ")),
            ],
        );
        let fields = normalizer.classify("NFe sem REG_PAS", &raw).unwrap();
        assert_eq!(fields.detail.as_deref(), Some("Chave NFe: 3526 | Emitente: XYZ"));
        assert_eq!(fields.amount, None);
    }

    #[test]
    fn unknown_sheet_and_bad_amount_are_errors() {
        let normalizer = RuleNormalizer::default();
        let raw = row("Débitos", vec![("Valor", text("abc"))]);
        assert!(matches!(
            normalizer.classify("Resumo", &raw),
            Err(AdapterError::UnknownSheet(_))
        ));
        assert!(matches!(
            normalizer.classify("Débitos", &raw),
            Err(AdapterError::Classification { row: 2, .. })
        ));
    }

    #[test]
    fn brl_amounts_parse() {
        assert_eq!(parse_brl_amount("R$ 1.234,56"), Some(1234.56));
        assert_eq!(parse_brl_amount("-10,5"), Some(-10.5));
        assert_eq!(parse_brl_amount("(2.000,00)"), Some(-2000.0));
        assert_eq!(parse_brl_amount("1234.56"), Some(1234.56));
        assert_eq!(parse_brl_amount("1.234.567"), Some(1234567.0));
        assert_eq!(parse_brl_amount("—"), None);
    }

    #[test]
    fn yaml_rules_override_sheets_and_aliases() {
        let normalizer = RuleNormalizer::from_yaml_str(
            r#"
similarity_threshold: 0.95
columns:
  cnpj: ["Documento"]
sheets:
  - name: "Parcelamentos"
    kind: "PARCELAMENTO"
    columns:
      amount: ["Saldo a Pagar"]
"#,
        )
        .unwrap();
        assert_eq!(normalizer.sheet_names(), vec!["Parcelamentos".to_string()]);
        let raw = row(
            "Parcelamentos",
            vec![("Documento", text("07.123.456/0001-99")), ("Saldo a Pagar", text("5,00"))],
        );
        let fields = normalizer.classify("Parcelamentos", &raw).unwrap();
        assert_eq!(fields.cnpj.as_deref(), Some("07123456000199"));
        assert_eq!(fields.amount, Some(5.0));
        assert_eq!(fields.tipo_pendencia.as_deref(), Some("PARCELAMENTO"));
        assert!(normalizer.classify("Débitos", &raw).is_err());
    }

    #[test]
    fn missing_rules_file_uses_builtin_rules() {
        let dir = tempdir().unwrap();
        let normalizer = RuleNormalizer::load_or_default(&dir.path().join("nope.yaml")).unwrap();
        assert_eq!(normalizer.sheet_names(), default_accepted_sheets());
    }
}
