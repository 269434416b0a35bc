//! Batch import orchestration: discovery, per-file commit, relocation, organizer pass,
//! view export and the optional cron schedule.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{Local, NaiveDateTime, SubsecRound, Utc};
use parquet::arrow::ArrowWriter;
use pend_adapters::{
    default_accepted_sheets, AdapterError, CalamineWorkbookReader, Normalizer, RuleNormalizer,
    WorkbookReader,
};
use pend_core::{
    BatchReport, DetailRow, FileDetail, FileImportEntry, FileStatus, PendencyRecord, SummaryRow,
    TIMESTAMP_FORMAT,
};
use pend_storage::{
    ContentHasher, FileRelocator, Ledger, LedgerError, RelocationOutcome, RetryPolicy,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pend-import";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakeDirs {
    pub intake: PathBuf,
    pub processed: PathBuf,
    pub errors: PathBuf,
}

impl IntakeDirs {
    pub async fn ensure(&self) -> Result<(), ImportError> {
        for dir in [&self.intake, &self.processed, &self.errors] {
            fs::create_dir_all(dir)
                .await
                .map_err(|source| ImportError::Directory {
                    path: dir.clone(),
                    source,
                })?;
        }
        Ok(())
    }
}

/// Loaded once per run and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub dirs: IntakeDirs,
    pub database_path: PathBuf,
    pub reports_dir: PathBuf,
    pub accepted_extension: String,
    pub accepted_sheets: Vec<String>,
    pub source_label: Option<String>,
    pub retry: RetryPolicy,
    pub rules_path: PathBuf,
    pub summary_max_rows: usize,
    pub detail_max_rows: usize,
    pub scheduler_enabled: bool,
    pub import_cron: String,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl ImportConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = |key: &str, default: &str| {
            lookup(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default))
        };
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        let retry_defaults = RetryPolicy::default();
        Self {
            dirs: IntakeDirs {
                intake: path("PEND_INTAKE_DIR", "./entrada"),
                processed: path("PEND_PROCESSED_DIR", "./processados"),
                errors: path("PEND_ERROR_DIR", "./erros"),
            },
            database_path: path("PEND_DATABASE_PATH", "./banco/pendencias.db"),
            reports_dir: path("PEND_REPORTS_DIR", "./reports"),
            accepted_extension: lookup("PEND_ACCEPTED_EXTENSION")
                .map(|v| v.trim().trim_start_matches('.').to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "xlsx".to_string()),
            accepted_sheets: lookup("PEND_ACCEPTED_SHEETS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect::<Vec<_>>()
                })
                .filter(|sheets| !sheets.is_empty())
                .unwrap_or_else(default_accepted_sheets),
            source_label: Some(lookup("PEND_SOURCE_LABEL").unwrap_or_else(|| "planilha".to_string()))
                .filter(|s| !s.trim().is_empty()),
            retry: RetryPolicy {
                max_attempts: number("PEND_MOVE_ATTEMPTS", retry_defaults.max_attempts as u64).max(1)
                    as usize,
                base_delay: Duration::from_millis(number("PEND_MOVE_BACKOFF_MS", 350)),
                max_delay: retry_defaults.max_delay,
            },
            rules_path: path("PEND_RULES_PATH", "./rules/normalizer.yaml"),
            summary_max_rows: number("PEND_SUMMARY_MAX_ROWS", 50_000) as usize,
            detail_max_rows: number("PEND_DETAIL_MAX_ROWS", 200_000) as usize,
            scheduler_enabled: lookup("PEND_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            import_cron: lookup("PEND_IMPORT_CRON").unwrap_or_else(|| "0 6 * * *".to_string()),
        }
    }
}

/// Errors that end a run. Per-file input problems never surface here.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("preparing directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("listing intake directory {path}: {source}")]
    Discovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Eligible intake files sorted by name. Office lock files (`~$...`) are ignored.
pub async fn discover(intake: &Path, extension: &str) -> Result<Vec<PathBuf>, ImportError> {
    let discovery_error = |source| ImportError::Discovery {
        path: intake.to_path_buf(),
        source,
    };
    let mut entries = fs::read_dir(intake).await.map_err(discovery_error)?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(discovery_error)? {
        let path = entry.path();
        let file_type = entry.file_type().await.map_err(discovery_error)?;
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("~$") {
            continue;
        }
        let matches_ext = path
            .extension()
            .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(extension))
            .unwrap_or(false);
        if matches_ext {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

pub struct BatchImporter {
    config: ImportConfig,
    reader: Arc<dyn WorkbookReader>,
    normalizer: Arc<dyn Normalizer>,
    relocator: FileRelocator,
}

impl BatchImporter {
    /// Calamine reader plus the rules at `config.rules_path` (built-in rules when absent).
    pub fn new(config: ImportConfig) -> Result<Self> {
        let normalizer = RuleNormalizer::load_or_default(&config.rules_path)?;
        Ok(Self::with_collaborators(
            config,
            Arc::new(CalamineWorkbookReader),
            Arc::new(normalizer),
        ))
    }

    pub fn with_collaborators(
        config: ImportConfig,
        reader: Arc<dyn WorkbookReader>,
        normalizer: Arc<dyn Normalizer>,
    ) -> Self {
        let relocator = FileRelocator::new(config.retry);
        Self {
            config,
            reader,
            normalizer,
            relocator,
        }
    }

    pub fn with_relocator(mut self, relocator: FileRelocator) -> Self {
        self.relocator = relocator;
        self
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Import every eligible file in `dirs.intake`. Only store and directory failures abort
    /// the run; everything else is reported per file.
    pub async fn run(&self, dirs: &IntakeDirs, ledger: &Ledger) -> Result<BatchReport, ImportError> {
        let run_id = Uuid::new_v4();
        self.run_files(run_id, dirs, ledger)
            .instrument(info_span!("import_run", %run_id))
            .await
    }

    async fn run_files(
        &self,
        run_id: Uuid,
        dirs: &IntakeDirs,
        ledger: &Ledger,
    ) -> Result<BatchReport, ImportError> {
        let mut report = BatchReport::begin(run_id, Utc::now());
        dirs.ensure().await?;
        let files = discover(&dirs.intake, &self.config.accepted_extension).await?;
        report.files_total = files.len();
        info!(files = files.len(), intake = %dirs.intake.display(), "import run started");

        let collected_at = Local::now().naive_local().trunc_subsecs(0);
        for path in &files {
            let detail = self.import_file(path, dirs, ledger, collected_at).await?;
            report.push(detail);
        }

        report.finished_at = Utc::now();
        info!(
            files_total = report.files_total,
            files_imported = report.files_imported,
            rows_read = report.rows_read,
            rows_inserted = report.rows_inserted,
            "import run finished"
        );
        Ok(report)
    }

    async fn import_file(
        &self,
        path: &Path,
        dirs: &IntakeDirs,
        ledger: &Ledger,
        collected_at: NaiveDateTime,
    ) -> Result<FileDetail, ImportError> {
        let file_name = display_name(path);

        let digest = match ContentHasher::hash_file_with(path, ledger.schema().file_digest()).await {
            Ok(digest) => digest,
            Err(err) => {
                let detail = FileDetail::new(&file_name, FileStatus::Error);
                return Ok(self.quarantine(path, &dirs.errors, detail, format!("{err:#}")).await);
            }
        };

        if ledger.has_file(&file_name, &digest).await? {
            info!(file = %file_name, digest = %digest, "already imported; skipping");
            let mut detail = FileDetail::new(&file_name, FileStatus::Skipped);
            detail.content_hash = Some(digest);
            return Ok(detail);
        }

        let records = match self.stage_records(path, &file_name, collected_at).await {
            Ok(records) => records,
            Err(err) => {
                let mut detail = FileDetail::new(&file_name, FileStatus::Error);
                detail.content_hash = Some(digest);
                return Ok(self.quarantine(path, &dirs.errors, detail, err.to_string()).await);
            }
        };

        let rows_read = records.len() as u64;
        let rows_inserted = match commit_file(ledger, &file_name, &digest, &records, collected_at).await {
            Ok(inserted) => inserted,
            Err(err) => {
                let detail = FileDetail::new(&file_name, FileStatus::Error);
                self.quarantine(path, &dirs.errors, detail, err.to_string()).await;
                return Err(err.into());
            }
        };
        info!(
            file = %file_name,
            digest = %digest,
            rows_read,
            rows_inserted,
            "file committed"
        );

        let relocation = self.relocator.relocate(path, &dirs.processed).await;
        let status = match relocation.outcome {
            RelocationOutcome::Moved => FileStatus::Ok,
            RelocationOutcome::Copied => FileStatus::CopiedOnLock,
            RelocationOutcome::Failed => FileStatus::MoveFailed,
        };
        debug!(file = %file_name, outcome = ?relocation.outcome, attempts = relocation.attempts, "relocation finished");

        let mut detail = FileDetail::new(&file_name, status);
        detail.content_hash = Some(digest);
        detail.rows_read = rows_read;
        detail.rows_inserted = rows_inserted;
        detail.destination = relocation.final_path;
        detail.error = relocation.error;
        Ok(detail)
    }

    /// Extract accepted sheets off the async runtime, drop blank rows and classify the rest.
    async fn stage_records(
        &self,
        path: &Path,
        file_name: &str,
        collected_at: NaiveDateTime,
    ) -> Result<Vec<PendencyRecord>, AdapterError> {
        let reader = Arc::clone(&self.reader);
        let accepted = self.config.accepted_sheets.clone();
        let owned = path.to_path_buf();
        let sheets = tokio::task::spawn_blocking(move || reader.read_accepted(&owned, &accepted))
            .await
            .map_err(|e| AdapterError::Message(format!("workbook reader task failed: {e}")))??;

        let mut records = Vec::new();
        for sheet in &sheets {
            for row in sheet.rows.iter().filter(|row| !row.is_blank()) {
                let fields = self.normalizer.classify(&sheet.sheet, row)?;
                records.push(PendencyRecord {
                    fingerprint: ContentHasher::fingerprint(file_name, &sheet.sheet, row.row_number),
                    source: self.config.source_label.clone(),
                    file_name: file_name.to_string(),
                    sheet_name: sheet.sheet.clone(),
                    row_number: row.row_number,
                    fields,
                    collected_at,
                    raw_payload: row.to_payload_json(),
                });
            }
        }
        Ok(records)
    }

    async fn quarantine(
        &self,
        path: &Path,
        errors_dir: &Path,
        mut detail: FileDetail,
        message: String,
    ) -> FileDetail {
        warn!(file = %detail.file_name, error = %message, "quarantining file");
        match self.relocator.copy_into(path, errors_dir).await {
            Ok(destination) => detail.destination = Some(destination),
            Err(err) => warn!(file = %detail.file_name, error = %format!("{err:#}"), "quarantine copy failed"),
        }
        detail.error = Some(message);
        detail
    }

    /// Move files whose content is already ledgered out of the intake directory.
    pub async fn organize(&self, dirs: &IntakeDirs, ledger: &Ledger) -> Result<OrganizeReport, ImportError> {
        dirs.ensure().await?;
        let mut report = OrganizeReport::default();
        for path in discover(&dirs.intake, &self.config.accepted_extension).await? {
            let file_name = display_name(&path);
            let digest = match ContentHasher::hash_file_with(&path, ledger.schema().file_digest()).await {
                Ok(digest) => digest,
                Err(err) => {
                    warn!(file = %file_name, error = %format!("{err:#}"), "could not hash intake file");
                    report.failed += 1;
                    continue;
                }
            };
            if !ledger.has_file(&file_name, &digest).await? {
                report.pending += 1;
                continue;
            }
            match self.relocator.relocate(&path, &dirs.processed).await.outcome {
                RelocationOutcome::Moved => report.moved += 1,
                RelocationOutcome::Copied => report.copied += 1,
                RelocationOutcome::Failed => report.failed += 1,
            }
        }
        info!(
            moved = report.moved,
            copied = report.copied,
            pending = report.pending,
            failed = report.failed,
            "organize pass finished"
        );
        Ok(report)
    }
}

async fn commit_file(
    ledger: &Ledger,
    file_name: &str,
    digest: &str,
    records: &[PendencyRecord],
    imported_at: NaiveDateTime,
) -> Result<u64, LedgerError> {
    let mut tx = ledger.begin().await?;
    let mut inserted = 0u64;
    for record in records {
        if tx.insert_record(record).await? {
            inserted += 1;
        } else {
            debug!(file = %file_name, sheet = %record.sheet_name, row = record.row_number, "row already stored");
        }
    }
    tx.record_file(&FileImportEntry {
        file_name: file_name.to_string(),
        content_hash: digest.to_string(),
        imported_at,
        rows_read: records.len() as u64,
        rows_inserted: inserted,
    })
    .await?;
    tx.commit().await?;
    Ok(inserted)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizeReport {
    pub moved: usize,
    pub copied: usize,
    pub pending: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub reports_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub summary_rows: usize,
    pub detail_rows: usize,
    pub status_line: String,
}

pub fn status_line(report: &BatchReport, summary_rows: usize, detail_rows: usize) -> String {
    format!(
        "{} | files: {} | imported: {} | rows read: {} | rows inserted: {} | summary: {} | details: {}",
        report.finished_at.with_timezone(&Local).format(TIMESTAMP_FORMAT),
        report.files_total,
        report.files_imported,
        report.rows_read,
        report.rows_inserted,
        summary_rows,
        detail_rows
    )
}

/// Write `batch_report.json`, `status.md` and parquet snapshots of both views under
/// `<reports_dir>/<run_id>/`.
pub async fn export_views(
    report: &BatchReport,
    ledger: &Ledger,
    config: &ImportConfig,
) -> Result<ExportSummary> {
    let reports_dir = config.reports_dir.join(report.run_id.to_string());
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let summary = ledger
        .summary_view(config.summary_max_rows)
        .await
        .context("loading summary view")?;
    let details = ledger
        .detail_view(config.detail_max_rows)
        .await
        .context("loading detail view")?;

    let report_json = serde_json::to_vec_pretty(report).context("serializing batch report")?;
    fs::write(reports_dir.join("batch_report.json"), report_json)
        .await
        .context("writing batch_report.json")?;

    let line = status_line(report, summary.len(), details.len());
    fs::write(reports_dir.join("status.md"), status_markdown(&line, report))
        .await
        .context("writing status.md")?;

    let summary_path = snapshot_dir.join("summary.parquet");
    let details_path = snapshot_dir.join("details.parquet");
    write_summary_parquet(&summary_path, &summary)?;
    write_details_parquet(&details_path, &details)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("summary", &reports_dir, &summary_path)?,
            manifest_entry("details", &reports_dir, &details_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(reports_dir = %reports_dir.display(), summary = summary.len(), details = details.len(), "views exported");
    Ok(ExportSummary {
        reports_dir,
        manifest_path,
        summary_rows: summary.len(),
        detail_rows: details.len(),
        status_line: line,
    })
}

fn status_markdown(line: &str, report: &BatchReport) -> String {
    let mut lines = vec![
        "# Pendências Import Status".to_string(),
        String::new(),
        format!("`{line}`"),
        String::new(),
        "| file | status | rows read | rows inserted | note |".to_string(),
        "|---|---|---|---|---|".to_string(),
    ];
    for detail in &report.details {
        lines.push(format!(
            "| {} | {} | {} | {} | {} |",
            detail.file_name,
            detail.status,
            detail.rows_read,
            detail.rows_inserted,
            detail.error.as_deref().unwrap_or("").replace('|', "/")
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn string_column<'a, T: 'a>(rows: &'a [T], get: impl Fn(&'a T) -> &'a str) -> StringArray {
    StringArray::from(rows.iter().map(|r| Some(get(r))).collect::<Vec<_>>())
}

fn write_summary_parquet(path: &Path, rows: &[SummaryRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("cnpj", DataType::Utf8, false),
        ArrowField::new("cgf", DataType::Utf8, false),
        ArrowField::new("razao", DataType::Utf8, false),
        ArrowField::new("tipo_pendencia", DataType::Utf8, false),
        ArrowField::new("periodo", DataType::Utf8, false),
        ArrowField::new("qtd", DataType::Int64, false),
        ArrowField::new("valor_total", DataType::Float64, false),
        ArrowField::new("ultima_coleta", DataType::Utf8, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(string_column(rows, |r| r.cnpj.as_str())),
            Arc::new(string_column(rows, |r| r.cgf.as_str())),
            Arc::new(string_column(rows, |r| r.razao.as_str())),
            Arc::new(string_column(rows, |r| r.tipo_pendencia.as_str())),
            Arc::new(string_column(rows, |r| r.period.as_str())),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.count).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.total_amount).collect::<Vec<_>>())),
            Arc::new(string_column(rows, |r| r.last_collected.as_str())),
        ],
    )
    .context("building summary record batch")?;
    write_parquet(path, batch)
}

fn write_details_parquet(path: &Path, rows: &[DetailRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("cnpj", DataType::Utf8, false),
        ArrowField::new("cgf", DataType::Utf8, false),
        ArrowField::new("razao", DataType::Utf8, false),
        ArrowField::new("tipo_pendencia", DataType::Utf8, false),
        ArrowField::new("periodo", DataType::Utf8, false),
        ArrowField::new("valor", DataType::Float64, false),
        ArrowField::new("detalhe", DataType::Utf8, false),
        ArrowField::new("data_referencia", DataType::Utf8, false),
        ArrowField::new("arquivo_origem", DataType::Utf8, false),
        ArrowField::new("aba_origem", DataType::Utf8, false),
        ArrowField::new("linha_origem", DataType::Int64, false),
        ArrowField::new("data_coleta", DataType::Utf8, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(string_column(rows, |r| r.cnpj.as_str())),
            Arc::new(string_column(rows, |r| r.cgf.as_str())),
            Arc::new(string_column(rows, |r| r.razao.as_str())),
            Arc::new(string_column(rows, |r| r.tipo_pendencia.as_str())),
            Arc::new(string_column(rows, |r| r.period.as_str())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.amount).collect::<Vec<_>>())),
            Arc::new(string_column(rows, |r| r.detail.as_str())),
            Arc::new(string_column(rows, |r| r.reference_date.as_str())),
            Arc::new(string_column(rows, |r| r.file_name.as_str())),
            Arc::new(string_column(rows, |r| r.sheet_name.as_str())),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.row_number).collect::<Vec<_>>())),
            Arc::new(string_column(rows, |r| r.collected_at.as_str())),
        ],
    )
    .context("building details record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: ContentHasher::sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

#[derive(Debug, Clone)]
pub struct ImportRun {
    pub report: BatchReport,
    pub export: ExportSummary,
}

/// One full run: open the store, import the intake directory, export the views.
pub async fn run_import_once(config: &ImportConfig) -> Result<ImportRun> {
    let ledger = Ledger::open(&config.database_path)
        .await
        .with_context(|| format!("opening store {}", config.database_path.display()))?;
    let importer = BatchImporter::new(config.clone())?;
    let outcome = async {
        let report = importer.run(&config.dirs, &ledger).await?;
        let export = export_views(&report, &ledger, config).await?;
        Ok::<_, anyhow::Error>(ImportRun { report, export })
    }
    .await;
    ledger.close().await;
    outcome
}

pub async fn organize_once(config: &ImportConfig) -> Result<OrganizeReport> {
    let ledger = Ledger::open(&config.database_path)
        .await
        .with_context(|| format!("opening store {}", config.database_path.display()))?;
    let importer = BatchImporter::new(config.clone())?;
    let outcome = importer.organize(&config.dirs, &ledger).await;
    ledger.close().await;
    Ok(outcome?)
}

/// Registers the import+export run on `config.import_cron` when scheduling is enabled.
pub async fn build_scheduler(config: &ImportConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let shared = Arc::new(config.clone());
    let cron = config.import_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = Arc::clone(&shared);
        Box::pin(async move {
            match run_import_once(&config).await {
                Ok(run) => info!(status = %run.export.status_line, "scheduled import finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled import failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Markdown digest of the most recent `runs` exported batch reports.
pub fn report_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join("batch_report.json").exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Pendências Import Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let report_path = dir.path().join("batch_report.json");
        let report: BatchReport = serde_json::from_str(
            &std::fs::read_to_string(&report_path)
                .with_context(|| format!("reading {}", report_path.display()))?,
        )
        .with_context(|| format!("parsing {}", report_path.display()))?;

        lines.push(format!("## Run `{}`", report.run_id));
        lines.push(format!("- finished: {}", report.finished_at));
        lines.push(format!(
            "- files: {} total, {} imported",
            report.files_total, report.files_imported
        ));
        lines.push(format!(
            "- rows: {} read, {} inserted",
            report.rows_read, report.rows_inserted
        ));
        for status in [
            FileStatus::Skipped,
            FileStatus::Error,
            FileStatus::CopiedOnLock,
            FileStatus::MoveFailed,
        ] {
            let count = report.count_status(status);
            if count > 0 {
                lines.push(format!("- {status}: {count}"));
            }
        }
        let manifest_path = dir.path().join("snapshots").join("manifest.json");
        if manifest_path.exists() {
            lines.push(format!("- snapshot manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
