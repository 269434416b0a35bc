//! Content hashing, intake file relocation and the SQLite ingestion ledger.

use std::collections::BTreeSet;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use pend_core::{DetailRow, FileImportEntry, PendencyRecord, SummaryRow, TIMESTAMP_FORMAT};
use sha2::{Digest, Sha256};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, Transaction};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pend-storage";

pub const HASH_CHUNK_SIZE: usize = 1024 * 1024;

const FINGERPRINT_SEPARATOR: char = '\u{1f}';

pub const RECORDS_TABLE: &str = "pendencias_raw";
pub const FILE_LOG_TABLE: &str = "import_log";

#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHasher;

impl ContentHasher {
    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Digest an arbitrary reader in fixed-size chunks.
    pub fn hash_reader<R: Read>(reader: &mut R) -> std::io::Result<String> {
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    pub async fn hash_file(path: &Path) -> anyhow::Result<String> {
        Self::hash_file_with(path, DigestKind::Sha256).await
    }

    /// Stream `path` through the requested digest; both kinds yield lowercase hex.
    pub async fn hash_file_with(path: &Path, kind: DigestKind) -> anyhow::Result<String> {
        let mut file = fs::File::open(path)
            .await
            .with_context(|| format!("opening {} for hashing", path.display()))?;
        let mut hasher = StreamingDigest::new(kind);
        let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
        loop {
            let read = file
                .read(&mut buffer)
                .await
                .with_context(|| format!("reading {} for hashing", path.display()))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(hasher.finish())
    }

    /// Provenance identity of one spreadsheet row. Content never participates.
    pub fn fingerprint(file_name: &str, sheet_name: &str, row_number: u32) -> String {
        let base = format!(
            "{}{sep}{}{sep}{}",
            file_name.trim(),
            sheet_name.trim(),
            row_number,
            sep = FINGERPRINT_SEPARATOR
        );
        Self::sha256_hex(base.as_bytes())
    }
}

/// Whole-file digest written to the file log. Stores created by older importers keep MD5.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DigestKind {
    #[default]
    Sha256,
    Md5,
}

enum StreamingDigest {
    Sha256(Sha256),
    Md5(md5::Context),
}

impl StreamingDigest {
    fn new(kind: DigestKind) -> Self {
        match kind {
            DigestKind::Sha256 => Self::Sha256(Sha256::new()),
            DigestKind::Md5 => Self::Md5(md5::Context::new()),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(hasher) => hasher.update(bytes),
            Self::Md5(context) => context.consume(bytes),
        }
    }

    fn finish(self) -> String {
        match self {
            Self::Sha256(hasher) => hex::encode(hasher.finalize()),
            Self::Md5(context) => format!("{:x}", context.compute()),
        }
    }
}

/// Bounded, linearly increasing wait between move attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(350),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Wait after the given 1-based failed attempt.
    pub fn delay_after_attempt(&self, attempt: usize) -> Duration {
        let factor = u32::try_from(attempt.max(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[cfg(windows)]
const CROSS_DEVICE_OS_ERROR: i32 = 17; // ERROR_NOT_SAME_DEVICE
#[cfg(not(windows))]
const CROSS_DEVICE_OS_ERROR: i32 = 18; // EXDEV

/// True when a rename failed only because source and destination live on different
/// filesystems. Retrying such a rename can never succeed.
pub fn crosses_devices(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(CROSS_DEVICE_OS_ERROR)
}

/// Filesystem primitives used by [`FileRelocator`]. `rename` and `copy` must refuse to
/// replace an existing destination and report [`std::io::ErrorKind::AlreadyExists`];
/// a failed `copy` leaves no partial destination behind.
#[async_trait]
pub trait FileOps: Send + Sync {
    async fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()>;
    async fn copy(&self, from: &Path, to: &Path) -> std::io::Result<u64>;

    async fn remove_file(&self, path: &Path) -> std::io::Result<()> {
        fs::remove_file(path).await
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFileOps;

#[async_trait]
impl FileOps for TokioFileOps {
    async fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        match fs::hard_link(from, to).await {
            Ok(()) => {
                if let Err(err) = fs::remove_file(from).await {
                    let _ = fs::remove_file(to).await;
                    return Err(err);
                }
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists || crosses_devices(&err) => Err(err),
            // Filesystems without hard links: last existence check, then a plain rename.
            Err(_) => {
                if fs::try_exists(to).await? {
                    return Err(std::io::Error::new(
                        ErrorKind::AlreadyExists,
                        format!("{} already exists", to.display()),
                    ));
                }
                fs::rename(from, to).await
            }
        }
    }

    async fn copy(&self, from: &Path, to: &Path) -> std::io::Result<u64> {
        let mut source = fs::File::open(from).await?;
        let mut target = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(to)
            .await?;
        let copied = async {
            let bytes = tokio::io::copy(&mut source, &mut target).await?;
            target.sync_all().await?;
            Ok::<_, std::io::Error>(bytes)
        }
        .await;
        if copied.is_err() {
            let _ = fs::remove_file(to).await;
        }
        copied
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationOutcome {
    Moved,
    Copied,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub outcome: RelocationOutcome,
    pub error: Option<String>,
    pub final_path: Option<PathBuf>,
    pub attempts: usize,
}

impl Relocation {
    fn failed(error: String, attempts: usize) -> Self {
        Self {
            outcome: RelocationOutcome::Failed,
            error: Some(error),
            final_path: None,
            attempts,
        }
    }
}

#[derive(Clone)]
pub struct FileRelocator {
    ops: Arc<dyn FileOps>,
    policy: RetryPolicy,
    max_suffix: u32,
}

const COPY_NAME_ATTEMPTS: usize = 5;

impl std::fmt::Debug for FileRelocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRelocator")
            .field("policy", &self.policy)
            .field("max_suffix", &self.max_suffix)
            .finish()
    }
}

impl Default for FileRelocator {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl FileRelocator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_ops(Arc::new(TokioFileOps), policy)
    }

    pub fn with_ops(ops: Arc<dyn FileOps>, policy: RetryPolicy) -> Self {
        Self {
            ops,
            policy,
            max_suffix: 9999,
        }
    }

    /// Highest ` (n)` suffix tried before falling back to a timestamped name.
    pub fn with_max_suffix(mut self, max_suffix: u32) -> Self {
        self.max_suffix = max_suffix.max(2);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// First free name among `name.ext`, `name (2).ext`, ... then a timestamped name.
    pub async fn unique_destination(&self, dir: &Path, file_name: &str) -> anyhow::Result<PathBuf> {
        let candidate = dir.join(file_name);
        if !path_exists(&candidate).await? {
            return Ok(candidate);
        }

        let as_path = Path::new(file_name);
        let stem = as_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| file_name.to_string());
        let ext = as_path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        for n in 2..=self.max_suffix {
            let candidate = dir.join(format!("{stem} ({n}){ext}"));
            if !path_exists(&candidate).await? {
                return Ok(candidate);
            }
        }

        let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
        let candidate = dir.join(format!("{stem} ({stamp}){ext}"));
        if !path_exists(&candidate).await? {
            return Ok(candidate);
        }
        Ok(dir.join(format!("{stem} ({}){ext}", Uuid::new_v4().simple())))
    }

    /// Move `file` into `target_dir`, retrying transient failures, then fall back to a copy
    /// that leaves the original in place. Never returns an error: the outcome says what happened.
    pub async fn relocate(&self, file: &Path, target_dir: &Path) -> Relocation {
        let Some(file_name) = file.file_name().map(|n| n.to_string_lossy().to_string()) else {
            return Relocation::failed(format!("{} has no file name", file.display()), 0);
        };
        if let Err(err) = fs::create_dir_all(target_dir).await {
            return Relocation::failed(format!("creating {}: {err}", target_dir.display()), 0);
        }

        let attempts = self.policy.max_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let destination = match self.unique_destination(target_dir, &file_name).await {
                Ok(destination) => destination,
                Err(err) => {
                    last_error = Some(format!("{err:#}"));
                    break;
                }
            };
            match self.ops.rename(file, &destination).await {
                Ok(()) => {
                    return Relocation {
                        outcome: RelocationOutcome::Moved,
                        error: None,
                        final_path: Some(destination),
                        attempts: attempt,
                    };
                }
                Err(err) if crosses_devices(&err) => {
                    debug!(file = %file.display(), target = %target_dir.display(), "target on another device; moving by copy");
                    return self.move_across_devices(file, target_dir, attempt).await;
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    debug!(file = %file.display(), destination = %destination.display(), "destination taken; choosing another name");
                    last_error = Some(err.to_string());
                }
                Err(err) => {
                    debug!(file = %file.display(), attempt, error = %err, "move attempt failed");
                    last_error = Some(err.to_string());
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.delay_after_attempt(attempt)).await;
                    }
                }
            }
        }

        let move_error = last_error.unwrap_or_else(|| "move not attempted".to_string());
        match self.copy_into(file, target_dir).await {
            Ok(destination) => {
                warn!(
                    file = %file.display(),
                    destination = %destination.display(),
                    error = %move_error,
                    "file still locked; copied and left original in place"
                );
                Relocation {
                    outcome: RelocationOutcome::Copied,
                    error: Some(move_error),
                    final_path: Some(destination),
                    attempts,
                }
            }
            Err(copy_err) => {
                warn!(file = %file.display(), error = %move_error, "file could not be moved or copied");
                Relocation::failed(format!("{move_error} | copy: {copy_err:#}"), attempts)
            }
        }
    }

    /// Copy then remove the source. The copy is synced before the source goes away.
    async fn move_across_devices(&self, file: &Path, target_dir: &Path, attempts: usize) -> Relocation {
        let destination = match self.copy_into(file, target_dir).await {
            Ok(destination) => destination,
            Err(err) => {
                warn!(file = %file.display(), error = %format!("{err:#}"), "cross-device copy failed");
                return Relocation::failed(format!("cross-device copy: {err:#}"), attempts);
            }
        };
        match self.ops.remove_file(file).await {
            Ok(()) => Relocation {
                outcome: RelocationOutcome::Moved,
                error: None,
                final_path: Some(destination),
                attempts,
            },
            Err(err) => {
                warn!(
                    file = %file.display(),
                    destination = %destination.display(),
                    error = %err,
                    "copied across devices but the source could not be removed"
                );
                Relocation {
                    outcome: RelocationOutcome::Copied,
                    error: Some(format!("removing source after cross-device copy: {err}")),
                    final_path: Some(destination),
                    attempts,
                }
            }
        }
    }

    /// Copy `file` under a collision-free name in `target_dir`, leaving the source untouched.
    pub async fn copy_into(&self, file: &Path, target_dir: &Path) -> anyhow::Result<PathBuf> {
        let file_name = file
            .file_name()
            .with_context(|| format!("{} has no file name", file.display()))?
            .to_string_lossy()
            .to_string();
        fs::create_dir_all(target_dir)
            .await
            .with_context(|| format!("creating {}", target_dir.display()))?;

        let mut last_taken = None;
        for _ in 0..COPY_NAME_ATTEMPTS {
            let destination = self.unique_destination(target_dir, &file_name).await?;
            match self.ops.copy(file, &destination).await {
                Ok(_) => return Ok(destination),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => last_taken = Some(destination),
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("copying {} -> {}", file.display(), destination.display())
                    });
                }
            }
        }
        anyhow::bail!(
            "copying {}: destination names kept being taken (last {})",
            file.display(),
            last_taken.map(|p| p.display().to_string()).unwrap_or_default()
        )
    }
}

async fn path_exists(path: &Path) -> anyhow::Result<bool> {
    fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("store error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("preparing store location {path}: {source}")]
    Location {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// How the file log recognizes an already-imported file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileIdentity {
    /// `(arquivo_origem, hash_arquivo)`.
    NameAndDigest,
    /// `hash_md5` alone, as written by the first importer.
    Md5,
    /// `arquivo_origem` alone; content changes go unnoticed.
    NameOnly,
}

/// Column sets found in the opened store. Older stores may lack provenance columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSchema {
    file_columns: BTreeSet<String>,
    record_columns: BTreeSet<String>,
}

impl LedgerSchema {
    pub async fn inspect(pool: &SqlitePool) -> LedgerResult<Self> {
        Ok(Self {
            file_columns: table_columns(pool, FILE_LOG_TABLE).await?,
            record_columns: table_columns(pool, RECORDS_TABLE).await?,
        })
    }

    pub fn from_columns<I, J, S, T>(file_columns: I, record_columns: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            file_columns: file_columns.into_iter().map(Into::into).collect(),
            record_columns: record_columns.into_iter().map(Into::into).collect(),
        }
    }

    /// File dedup keyed by (name, SHA-256 digest) in `hash_arquivo`.
    pub fn tracks_file_hash(&self) -> bool {
        self.file_columns.contains("hash_arquivo")
    }

    pub fn file_identity(&self) -> FileIdentity {
        if self.tracks_file_hash() {
            FileIdentity::NameAndDigest
        } else if self.file_columns.contains("hash_md5") {
            FileIdentity::Md5
        } else {
            FileIdentity::NameOnly
        }
    }

    /// Digest callers must pass to [`Ledger::has_file`] and [`Ledger::record_file`].
    pub fn file_digest(&self) -> DigestKind {
        match self.file_identity() {
            FileIdentity::Md5 => DigestKind::Md5,
            FileIdentity::NameAndDigest | FileIdentity::NameOnly => DigestKind::Sha256,
        }
    }

    pub fn tracks_file_counts(&self) -> bool {
        self.file_columns.contains("linhas_lidas") && self.file_columns.contains("linhas_inseridas")
    }

    /// Row dedup via the unique fingerprint; otherwise via a provenance lookup.
    pub fn tracks_record_fingerprint(&self) -> bool {
        self.record_columns.contains("hash_registro")
    }

    pub fn has_record_column(&self, column: &str) -> bool {
        self.record_columns.contains(column)
    }

    pub fn has_file_column(&self, column: &str) -> bool {
        self.file_columns.contains(column)
    }
}

async fn table_columns(pool: &SqlitePool, table: &str) -> LedgerResult<BTreeSet<String>> {
    let names: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info(?)")
        .bind(table)
        .fetch_all(pool)
        .await?;
    Ok(names.into_iter().collect())
}

const CREATE_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pendencias_raw (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  hash_registro TEXT NOT NULL,
  fonte TEXT,
  arquivo_origem TEXT,
  aba_origem TEXT,
  linha_origem INTEGER,
  cnpj TEXT,
  cgf TEXT,
  razao TEXT,
  tipo_pendencia TEXT,
  periodo TEXT,
  detalhe TEXT,
  valor NUMERIC,
  data_referencia TEXT,
  data_coleta TEXT NOT NULL,
  raw_json TEXT
)"#;

const CREATE_FILE_LOG_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS import_log (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  arquivo_origem TEXT NOT NULL,
  hash_arquivo TEXT NOT NULL,
  data_importacao TEXT NOT NULL,
  linhas_lidas INTEGER NOT NULL,
  linhas_inseridas INTEGER NOT NULL,
  UNIQUE(arquivo_origem, hash_arquivo)
)"#;

const SECONDARY_INDEXES: &[(&str, &str)] = &[
    ("idx_raw_cnpj", "cnpj"),
    ("idx_raw_cgf", "cgf"),
    ("idx_raw_tipo", "tipo_pendencia"),
    ("idx_raw_periodo", "periodo"),
    ("idx_raw_fonte", "fonte"),
    ("idx_raw_arquivo", "arquivo_origem"),
];

/// Persistent record of ingested files and stored rows.
#[derive(Debug, Clone)]
pub struct Ledger {
    pool: SqlitePool,
    schema: LedgerSchema,
}

impl Ledger {
    /// Open (creating if needed) the store at `path` with single-writer settings.
    pub async fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| LedgerError::Location {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> LedgerResult<Self> {
        sqlx::query(CREATE_RECORDS_TABLE).execute(&pool).await?;
        sqlx::query(CREATE_FILE_LOG_TABLE).execute(&pool).await?;

        let schema = LedgerSchema::inspect(&pool).await?;
        if schema.tracks_record_fingerprint() {
            sqlx::query(
                "CREATE UNIQUE INDEX IF NOT EXISTS ux_raw_hash_registro ON pendencias_raw(hash_registro)",
            )
            .execute(&pool)
            .await?;
        }
        for (index, column) in SECONDARY_INDEXES {
            if schema.has_record_column(column) {
                let sql = format!("CREATE INDEX IF NOT EXISTS {index} ON pendencias_raw({column})");
                sqlx::query(&sql).execute(&pool).await?;
            }
        }

        match schema.file_identity() {
            FileIdentity::NameAndDigest => {}
            FileIdentity::Md5 => {
                info!("import_log keyed by hash_md5; file dedup uses MD5 content digests");
            }
            FileIdentity::NameOnly => {
                warn!("import_log has no content hash column; file dedup falls back to file name only");
            }
        }
        if !schema.tracks_record_fingerprint() {
            warn!("pendencias_raw has no hash_registro column; row dedup falls back to provenance lookup");
        }
        info!(
            file_identity = ?schema.file_identity(),
            record_fingerprint = schema.tracks_record_fingerprint(),
            "ledger opened"
        );
        Ok(Self { pool, schema })
    }

    pub fn schema(&self) -> &LedgerSchema {
        &self.schema
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// `content_hash` must be computed with [`LedgerSchema::file_digest`].
    pub async fn has_file(&self, file_name: &str, content_hash: &str) -> LedgerResult<bool> {
        let found = match self.schema.file_identity() {
            FileIdentity::NameAndDigest => {
                sqlx::query(
                    "SELECT 1 FROM import_log WHERE arquivo_origem = ? AND hash_arquivo = ? LIMIT 1",
                )
                .bind(file_name)
                .bind(content_hash)
                .fetch_optional(&self.pool)
                .await?
            }
            FileIdentity::Md5 => {
                sqlx::query("SELECT 1 FROM import_log WHERE hash_md5 = ? LIMIT 1")
                    .bind(content_hash)
                    .fetch_optional(&self.pool)
                    .await?
            }
            FileIdentity::NameOnly => {
                sqlx::query("SELECT 1 FROM import_log WHERE arquivo_origem = ? LIMIT 1")
                    .bind(file_name)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        Ok(found.is_some())
    }

    /// Add the `fonte` column older stores lack. Returns the columns added.
    pub async fn upgrade(&mut self) -> LedgerResult<Vec<&'static str>> {
        let mut added = Vec::new();
        if !self.schema.has_record_column("fonte") {
            sqlx::query("ALTER TABLE pendencias_raw ADD COLUMN fonte TEXT")
                .execute(&self.pool)
                .await?;
            sqlx::query("CREATE INDEX IF NOT EXISTS idx_raw_fonte ON pendencias_raw(fonte)")
                .execute(&self.pool)
                .await?;
            added.push("fonte");
        }
        if !added.is_empty() {
            self.schema = LedgerSchema::inspect(&self.pool).await?;
            info!(columns = ?added, "store upgraded");
        }
        Ok(added)
    }

    /// Record a file entry outside any batch transaction. Existing entries are left as is.
    pub async fn record_file(&self, entry: &FileImportEntry) -> LedgerResult<bool> {
        let mut conn = self.pool.acquire().await?;
        record_file_on(&mut conn, &self.schema, entry).await
    }

    /// Insert one record outside any batch transaction. `false` means already present.
    pub async fn insert_record(&self, record: &PendencyRecord) -> LedgerResult<bool> {
        let mut conn = self.pool.acquire().await?;
        insert_record_on(&mut conn, &self.schema, record).await
    }

    pub async fn begin(&self) -> LedgerResult<LedgerTx<'_>> {
        Ok(LedgerTx {
            tx: self.pool.begin().await?,
            schema: &self.schema,
        })
    }

    pub async fn record_count(&self) -> LedgerResult<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM pendencias_raw")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn record_count_for_file(&self, file_name: &str) -> LedgerResult<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM pendencias_raw WHERE arquivo_origem = ?")
                .bind(file_name)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    pub async fn file_entries(&self) -> LedgerResult<Vec<FileImportEntry>> {
        let hash = match self.schema.file_identity() {
            FileIdentity::NameAndDigest => "COALESCE(hash_arquivo, '')",
            FileIdentity::Md5 => "COALESCE(hash_md5, '')",
            FileIdentity::NameOnly => "''",
        };
        let counts = if self.schema.tracks_file_counts() {
            "COALESCE(linhas_lidas, 0), COALESCE(linhas_inseridas, 0)"
        } else {
            "0, 0"
        };
        let sql = format!(
            "SELECT COALESCE(arquivo_origem, ''), {hash}, COALESCE(data_importacao, ''), {counts} \
             FROM import_log ORDER BY id"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let imported_at: String = row.try_get(2)?;
            let rows_read: i64 = row.try_get(3)?;
            let rows_inserted: i64 = row.try_get(4)?;
            entries.push(FileImportEntry {
                file_name: row.try_get(0)?,
                content_hash: row.try_get(1)?,
                imported_at: NaiveDateTime::parse_from_str(&imported_at, TIMESTAMP_FORMAT)
                    .unwrap_or_default(),
                rows_read: u64::try_from(rows_read).unwrap_or_default(),
                rows_inserted: u64::try_from(rows_inserted).unwrap_or_default(),
            });
        }
        Ok(entries)
    }

    /// Aggregate view grouped by taxpayer, kind and period, newest collection first.
    pub async fn summary_view(&self, limit: usize) -> LedgerResult<Vec<SummaryRow>> {
        let rows = sqlx::query(
            r#"
            SELECT
              CAST(COALESCE(cnpj, '') AS TEXT) AS cnpj,
              CAST(COALESCE(cgf, '') AS TEXT) AS cgf,
              CAST(COALESCE(razao, '') AS TEXT) AS razao,
              CAST(COALESCE(tipo_pendencia, '') AS TEXT) AS tipo_pendencia,
              CAST(COALESCE(periodo, '') AS TEXT) AS periodo,
              COUNT(*) AS qtd,
              CAST(ROUND(SUM(COALESCE(valor, 0)), 2) AS REAL) AS valor_total,
              CAST(COALESCE(MAX(data_coleta), '') AS TEXT) AS ultima_coleta
            FROM pendencias_raw
            WHERE COALESCE(tipo_pendencia, '') <> ''
            GROUP BY 1, 2, 3, 4, 5
            ORDER BY ultima_coleta DESC, qtd DESC
            LIMIT ?
            "#,
        )
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> LedgerResult<SummaryRow> {
                Ok(SummaryRow {
                    cnpj: row.try_get("cnpj")?,
                    cgf: row.try_get("cgf")?,
                    razao: row.try_get("razao")?,
                    tipo_pendencia: row.try_get("tipo_pendencia")?,
                    period: row.try_get("periodo")?,
                    count: row.try_get("qtd")?,
                    total_amount: row.try_get("valor_total")?,
                    last_collected: row.try_get("ultima_coleta")?,
                })
            })
            .collect()
    }

    /// Every classified row, newest collection first, then by provenance.
    pub async fn detail_view(&self, limit: usize) -> LedgerResult<Vec<DetailRow>> {
        let rows = sqlx::query(
            r#"
            SELECT
              CAST(COALESCE(cnpj, '') AS TEXT) AS cnpj,
              CAST(COALESCE(cgf, '') AS TEXT) AS cgf,
              CAST(COALESCE(razao, '') AS TEXT) AS razao,
              CAST(COALESCE(tipo_pendencia, '') AS TEXT) AS tipo_pendencia,
              CAST(COALESCE(periodo, '') AS TEXT) AS periodo,
              CAST(COALESCE(valor, 0) AS REAL) AS valor,
              CAST(COALESCE(detalhe, '') AS TEXT) AS detalhe,
              CAST(COALESCE(data_referencia, '') AS TEXT) AS data_referencia,
              CAST(COALESCE(arquivo_origem, '') AS TEXT) AS arquivo_origem,
              CAST(COALESCE(aba_origem, '') AS TEXT) AS aba_origem,
              CAST(COALESCE(linha_origem, 0) AS INTEGER) AS linha_origem,
              CAST(COALESCE(data_coleta, '') AS TEXT) AS data_coleta
            FROM pendencias_raw
            WHERE COALESCE(tipo_pendencia, '') <> ''
            ORDER BY data_coleta DESC, arquivo_origem, aba_origem, linha_origem
            LIMIT ?
            "#,
        )
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> LedgerResult<DetailRow> {
                Ok(DetailRow {
                    cnpj: row.try_get("cnpj")?,
                    cgf: row.try_get("cgf")?,
                    razao: row.try_get("razao")?,
                    tipo_pendencia: row.try_get("tipo_pendencia")?,
                    period: row.try_get("periodo")?,
                    amount: row.try_get("valor")?,
                    detail: row.try_get("detalhe")?,
                    reference_date: row.try_get("data_referencia")?,
                    file_name: row.try_get("arquivo_origem")?,
                    sheet_name: row.try_get("aba_origem")?,
                    row_number: row.try_get("linha_origem")?,
                    collected_at: row.try_get("data_coleta")?,
                })
            })
            .collect()
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// One file's rows and ledger entry. Dropping without [`LedgerTx::commit`] rolls back.
pub struct LedgerTx<'a> {
    tx: Transaction<'static, Sqlite>,
    schema: &'a LedgerSchema,
}

impl LedgerTx<'_> {
    pub async fn insert_record(&mut self, record: &PendencyRecord) -> LedgerResult<bool> {
        insert_record_on(&mut self.tx, self.schema, record).await
    }

    pub async fn record_file(&mut self, entry: &FileImportEntry) -> LedgerResult<bool> {
        record_file_on(&mut self.tx, self.schema, entry).await
    }

    pub async fn commit(self) -> LedgerResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> LedgerResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

enum SqlValue {
    Text(Option<String>),
    Integer(i64),
    Real(Option<f64>),
}

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_values(mut query: SqliteQuery<'_>, values: Vec<SqlValue>) -> SqliteQuery<'_> {
    for value in values {
        query = match value {
            SqlValue::Text(v) => query.bind(v),
            SqlValue::Integer(v) => query.bind(v),
            SqlValue::Real(v) => query.bind(v),
        };
    }
    query
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn record_values(record: &PendencyRecord) -> Vec<(&'static str, SqlValue)> {
    let fields = &record.fields;
    vec![
        ("hash_registro", SqlValue::Text(Some(record.fingerprint.clone()))),
        ("fonte", SqlValue::Text(record.source.clone())),
        ("arquivo_origem", SqlValue::Text(Some(record.file_name.clone()))),
        ("aba_origem", SqlValue::Text(Some(record.sheet_name.clone()))),
        ("linha_origem", SqlValue::Integer(i64::from(record.row_number))),
        ("cnpj", SqlValue::Text(fields.cnpj.clone())),
        ("cgf", SqlValue::Text(fields.cgf.clone())),
        ("razao", SqlValue::Text(fields.razao.clone())),
        ("tipo_pendencia", SqlValue::Text(fields.tipo_pendencia.clone())),
        ("periodo", SqlValue::Text(fields.period.clone())),
        ("detalhe", SqlValue::Text(fields.detail.clone())),
        ("valor", SqlValue::Real(fields.amount)),
        ("data_referencia", SqlValue::Text(fields.reference_date.clone())),
        (
            "data_coleta",
            SqlValue::Text(Some(record.collected_at.format(TIMESTAMP_FORMAT).to_string())),
        ),
        ("raw_json", SqlValue::Text(Some(record.raw_payload.clone()))),
    ]
}

async fn insert_record_on(
    conn: &mut SqliteConnection,
    schema: &LedgerSchema,
    record: &PendencyRecord,
) -> LedgerResult<bool> {
    let (columns, mut values): (Vec<_>, Vec<_>) = record_values(record)
        .into_iter()
        .filter(|(column, _)| schema.has_record_column(column))
        .unzip();
    let column_list = columns.join(", ");
    let marks = placeholders(columns.len());

    // One write statement either way: a read followed by a write cannot take the lock
    // from a concurrent writer.
    let sql = if schema.tracks_record_fingerprint() {
        format!(
            "INSERT INTO pendencias_raw ({column_list}) VALUES ({marks}) \
             ON CONFLICT(hash_registro) DO NOTHING"
        )
    } else {
        values.push(SqlValue::Text(Some(record.file_name.clone())));
        values.push(SqlValue::Text(Some(record.sheet_name.clone())));
        values.push(SqlValue::Integer(i64::from(record.row_number)));
        format!(
            "INSERT INTO pendencias_raw ({column_list}) SELECT {marks} \
             WHERE NOT EXISTS (SELECT 1 FROM pendencias_raw \
             WHERE arquivo_origem = ? AND aba_origem = ? AND linha_origem = ?)"
        )
    };

    let result = bind_values(sqlx::query(&sql), values)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

async fn record_file_on(
    conn: &mut SqliteConnection,
    schema: &LedgerSchema,
    entry: &FileImportEntry,
) -> LedgerResult<bool> {
    let identity = schema.file_identity();
    let mut columns = vec!["arquivo_origem"];
    let mut values = vec![SqlValue::Text(Some(entry.file_name.clone()))];
    match identity {
        FileIdentity::NameAndDigest => columns.push("hash_arquivo"),
        FileIdentity::Md5 => columns.push("hash_md5"),
        FileIdentity::NameOnly => {}
    }
    if identity != FileIdentity::NameOnly {
        values.push(SqlValue::Text(Some(entry.content_hash.clone())));
    }
    if schema.has_file_column("data_importacao") {
        columns.push("data_importacao");
        values.push(SqlValue::Text(Some(
            entry.imported_at.format(TIMESTAMP_FORMAT).to_string(),
        )));
    }
    if schema.tracks_file_counts() {
        columns.push("linhas_lidas");
        values.push(SqlValue::Integer(i64::try_from(entry.rows_read).unwrap_or(i64::MAX)));
        columns.push("linhas_inseridas");
        values.push(SqlValue::Integer(
            i64::try_from(entry.rows_inserted).unwrap_or(i64::MAX),
        ));
    }

    let guard = match identity {
        FileIdentity::NameAndDigest => {
            values.push(SqlValue::Text(Some(entry.file_name.clone())));
            values.push(SqlValue::Text(Some(entry.content_hash.clone())));
            "arquivo_origem = ? AND hash_arquivo = ?"
        }
        FileIdentity::Md5 => {
            values.push(SqlValue::Text(Some(entry.content_hash.clone())));
            "hash_md5 = ?"
        }
        FileIdentity::NameOnly => {
            values.push(SqlValue::Text(Some(entry.file_name.clone())));
            "arquivo_origem = ?"
        }
    };

    let sql = format!(
        "INSERT OR IGNORE INTO import_log ({}) SELECT {} \
         WHERE NOT EXISTS (SELECT 1 FROM import_log WHERE {guard})",
        columns.join(", "),
        placeholders(columns.len())
    );
    let result = bind_values(sqlx::query(&sql), values)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pend_core::CanonicalFields;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn collected_at() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2026-02-24T12:00:00", TIMESTAMP_FORMAT).expect("ts")
    }

    fn record(file: &str, sheet: &str, row: u32) -> PendencyRecord {
        PendencyRecord {
            fingerprint: ContentHasher::fingerprint(file, sheet, row),
            source: Some("planilha".into()),
            file_name: file.into(),
            sheet_name: sheet.into(),
            row_number: row,
            fields: CanonicalFields {
                cnpj: Some("07123456000199".into()),
                razao: Some("ACME LTDA".into()),
                tipo_pendencia: Some("DEBITO".into()),
                period: Some("01/2026".into()),
                amount: Some(10.0),
                ..CanonicalFields::default()
            },
            collected_at: collected_at(),
            raw_payload: "{}".into(),
        }
    }

    fn entry(file: &str, hash: &str) -> FileImportEntry {
        FileImportEntry {
            file_name: file.into(),
            content_hash: hash.into(),
            imported_at: collected_at(),
            rows_read: 3,
            rows_inserted: 3,
        }
    }

    struct LockedFileOps {
        copy_fails: bool,
        renames: AtomicUsize,
    }

    #[async_trait]
    impl FileOps for LockedFileOps {
        async fn rename(&self, _from: &Path, _to: &Path) -> std::io::Result<()> {
            self.renames.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "file is being used by another process",
            ))
        }

        async fn copy(&self, from: &Path, to: &Path) -> std::io::Result<u64> {
            if self.copy_fails {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "copy denied",
                ));
            }
            fs::copy(from, to).await
        }
    }

    struct CrossDeviceFileOps {
        renames: AtomicUsize,
    }

    #[async_trait]
    impl FileOps for CrossDeviceFileOps {
        async fn rename(&self, _from: &Path, _to: &Path) -> std::io::Result<()> {
            self.renames.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::from_raw_os_error(CROSS_DEVICE_OS_ERROR))
        }

        async fn copy(&self, from: &Path, to: &Path) -> std::io::Result<u64> {
            TokioFileOps.copy(from, to).await
        }
    }

    /// Another writer claims the first destination just before the move lands.
    struct ClaimedDestinationOps {
        claimed: AtomicBool,
    }

    #[async_trait]
    impl FileOps for ClaimedDestinationOps {
        async fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()> {
            if !self.claimed.swap(true, Ordering::SeqCst) {
                std::fs::write(to, b"other writer")?;
            }
            TokioFileOps.rename(from, to).await
        }

        async fn copy(&self, from: &Path, to: &Path) -> std::io::Result<u64> {
            TokioFileOps.copy(from, to).await
        }
    }

    async fn legacy_pool(path: &Path, import_log_ddl: &str) -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new().filename(path).create_if_missing(true))
            .await
            .unwrap();
        sqlx::query(import_log_ddl).execute(&pool).await.unwrap();
        sqlx::query(
            "CREATE TABLE pendencias_raw (id INTEGER PRIMARY KEY AUTOINCREMENT, \
             cnpj TEXT, cgf TEXT, razao TEXT, tipo_pendencia TEXT, periodo TEXT, valor REAL, \
             detalhe TEXT, data_referencia TEXT, arquivo_origem TEXT, aba_origem TEXT, \
             linha_origem INTEGER, data_coleta TEXT, raw_json TEXT)",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            ContentHasher::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn chunked_reader_matches_one_shot_digest() {
        let data: Vec<u8> = (0..(HASH_CHUNK_SIZE * 2 + 17)).map(|i| (i % 251) as u8).collect();
        let streamed = ContentHasher::hash_reader(&mut Cursor::new(&data)).expect("hash");
        assert_eq!(streamed, ContentHasher::sha256_hex(&data));
    }

    #[tokio::test]
    async fn file_digest_matches_bytes_digest() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("a.xlsx");
        std::fs::write(&path, b"hello world").expect("write");
        assert_eq!(
            ContentHasher::hash_file(&path).await.expect("hash"),
            ContentHasher::sha256_hex(b"hello world")
        );
    }

    #[tokio::test]
    async fn file_digest_can_be_md5() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("a.xlsx");
        std::fs::write(&path, b"hello world").expect("write");
        assert_eq!(
            ContentHasher::hash_file_with(&path, DigestKind::Md5).await.expect("hash"),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
    }

    #[test]
    fn fingerprint_trims_and_separates_fields() {
        let a = ContentHasher::fingerprint(" relatorio.xlsx ", "Débitos ", 2);
        let b = ContentHasher::fingerprint("relatorio.xlsx", "Débitos", 2);
        assert_eq!(a, b);
        assert_ne!(b, ContentHasher::fingerprint("relatorio.xlsx", "Débitos", 3));
        assert_ne!(
            ContentHasher::fingerprint("ab", "c", 1),
            ContentHasher::fingerprint("a", "bc", 1)
        );
    }

    #[test]
    fn retry_delay_is_linear_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(350),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay_after_attempt(1), Duration::from_millis(350));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_millis(700));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_millis(1000));
        assert_eq!(policy.delay_after_attempt(6), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn destination_names_never_collide() {
        let dir = tempdir().expect("tempdir");
        let relocator = FileRelocator::new(fast_policy()).with_max_suffix(3);

        let first = relocator.unique_destination(dir.path(), "base.xlsx").await.unwrap();
        assert_eq!(first, dir.path().join("base.xlsx"));
        std::fs::write(&first, b"1").unwrap();

        let second = relocator.unique_destination(dir.path(), "base.xlsx").await.unwrap();
        assert_eq!(second, dir.path().join("base (2).xlsx"));
        std::fs::write(&second, b"2").unwrap();
        std::fs::write(dir.path().join("base (3).xlsx"), b"3").unwrap();

        let fallback = relocator.unique_destination(dir.path(), "base.xlsx").await.unwrap();
        assert!(!fallback.exists());
        let name = fallback.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("base (") && name.ends_with(").xlsx"), "{name}");
    }

    #[tokio::test]
    async fn same_named_files_are_both_kept() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("processados");
        let relocator = FileRelocator::new(fast_policy());

        for (sub, body) in [("a", b"first".as_slice()), ("b", b"second".as_slice())] {
            let src_dir = dir.path().join(sub);
            std::fs::create_dir_all(&src_dir).unwrap();
            let src = src_dir.join("pendencias.xlsx");
            std::fs::write(&src, body).unwrap();
            let moved = relocator.relocate(&src, &target).await;
            assert_eq!(moved.outcome, RelocationOutcome::Moved);
            assert!(!src.exists());
        }

        assert_eq!(std::fs::read(target.join("pendencias.xlsx")).unwrap(), b"first");
        assert_eq!(std::fs::read(target.join("pendencias (2).xlsx")).unwrap(), b"second");
    }

    #[tokio::test]
    async fn locked_file_falls_back_to_copy() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("locked.xlsx");
        std::fs::write(&src, b"data").unwrap();
        let ops = Arc::new(LockedFileOps {
            copy_fails: false,
            renames: AtomicUsize::new(0),
        });
        let relocator = FileRelocator::with_ops(ops.clone(), fast_policy());

        let result = relocator.relocate(&src, &dir.path().join("out")).await;
        assert_eq!(result.outcome, RelocationOutcome::Copied);
        assert_eq!(ops.renames.load(Ordering::SeqCst), 3);
        assert_eq!(result.attempts, 3);
        assert!(src.exists());
        assert_eq!(std::fs::read(result.final_path.unwrap()).unwrap(), b"data");
        assert!(result.error.unwrap().contains("another process"));
    }

    #[tokio::test]
    async fn move_and_copy_failure_reports_failed() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("locked.xlsx");
        std::fs::write(&src, b"data").unwrap();
        let ops = Arc::new(LockedFileOps {
            copy_fails: true,
            renames: AtomicUsize::new(0),
        });
        let relocator = FileRelocator::with_ops(ops, fast_policy());

        let result = relocator.relocate(&src, &dir.path().join("out")).await;
        assert_eq!(result.outcome, RelocationOutcome::Failed);
        assert!(result.final_path.is_none());
        assert!(src.exists());
        assert!(result.error.unwrap().contains("copy"));
        assert_eq!(std::fs::read_dir(dir.path().join("out")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn cross_device_target_is_moved_by_copy_without_retrying() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("pendencias.xlsx");
        std::fs::write(&src, b"data").unwrap();
        let ops = Arc::new(CrossDeviceFileOps {
            renames: AtomicUsize::new(0),
        });
        let relocator = FileRelocator::with_ops(ops.clone(), fast_policy());
        let target = dir.path().join("out");

        let result = relocator.relocate(&src, &target).await;
        assert_eq!(result.outcome, RelocationOutcome::Moved);
        assert_eq!(result.attempts, 1);
        assert_eq!(ops.renames.load(Ordering::SeqCst), 1);
        assert!(result.error.is_none());
        assert!(!src.exists());
        assert_eq!(result.final_path.as_deref(), Some(target.join("pendencias.xlsx").as_path()));
        assert_eq!(std::fs::read(target.join("pendencias.xlsx")).unwrap(), b"data");
        assert_eq!(std::fs::read_dir(&target).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn file_ops_never_overwrite_an_existing_destination() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("a.xlsx");
        let taken = dir.path().join("b.xlsx");
        std::fs::write(&src, b"source").unwrap();
        std::fs::write(&taken, b"taken").unwrap();

        let err = TokioFileOps.rename(&src, &taken).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        let err = TokioFileOps.copy(&src, &taken).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        assert_eq!(std::fs::read(&src).unwrap(), b"source");
        assert_eq!(std::fs::read(&taken).unwrap(), b"taken");
    }

    #[tokio::test]
    async fn destination_claimed_mid_move_gets_a_new_name() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("pendencias.xlsx");
        std::fs::write(&src, b"ours").unwrap();
        let target = dir.path().join("out");
        let ops = Arc::new(ClaimedDestinationOps {
            claimed: AtomicBool::new(false),
        });
        let relocator = FileRelocator::with_ops(ops, fast_policy());

        let result = relocator.relocate(&src, &target).await;
        assert_eq!(result.outcome, RelocationOutcome::Moved);
        assert_eq!(result.attempts, 2);
        assert_eq!(std::fs::read(target.join("pendencias.xlsx")).unwrap(), b"other writer");
        assert_eq!(std::fs::read(target.join("pendencias (2).xlsx")).unwrap(), b"ours");
        assert!(!src.exists());
    }

    #[tokio::test]
    async fn ledger_dedups_files_and_records() {
        let dir = tempdir().expect("tempdir");
        let ledger = Ledger::open(dir.path().join("banco").join("pendencias.db"))
            .await
            .expect("open");
        assert!(ledger.schema().tracks_file_hash());
        assert!(ledger.schema().tracks_record_fingerprint());

        assert!(!ledger.has_file("a.xlsx", "h1").await.unwrap());
        assert!(ledger.record_file(&entry("a.xlsx", "h1")).await.unwrap());
        assert!(!ledger.record_file(&entry("a.xlsx", "h1")).await.unwrap());
        assert!(ledger.has_file("a.xlsx", "h1").await.unwrap());
        assert!(!ledger.has_file("a.xlsx", "h2").await.unwrap());
        assert!(!ledger.has_file("b.xlsx", "h1").await.unwrap());

        assert!(ledger.insert_record(&record("a.xlsx", "Débitos", 2)).await.unwrap());
        assert!(!ledger.insert_record(&record("a.xlsx", "Débitos", 2)).await.unwrap());
        assert!(ledger.insert_record(&record("a.xlsx", "Débitos", 3)).await.unwrap());
        assert_eq!(ledger.record_count().await.unwrap(), 2);
        assert_eq!(ledger.file_entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_nothing_behind() {
        let dir = tempdir().expect("tempdir");
        let ledger = Ledger::open(dir.path().join("pendencias.db")).await.unwrap();
        {
            let mut tx = ledger.begin().await.unwrap();
            assert!(tx.insert_record(&record("a.xlsx", "Débitos", 2)).await.unwrap());
            assert!(tx.record_file(&entry("a.xlsx", "h1")).await.unwrap());
        }
        assert_eq!(ledger.record_count().await.unwrap(), 0);
        assert!(!ledger.has_file("a.xlsx", "h1").await.unwrap());

        let mut tx = ledger.begin().await.unwrap();
        assert!(tx.insert_record(&record("a.xlsx", "Débitos", 2)).await.unwrap());
        assert!(tx.record_file(&entry("a.xlsx", "h1")).await.unwrap());
        tx.commit().await.unwrap();
        assert_eq!(ledger.record_count().await.unwrap(), 1);
        assert!(ledger.has_file("a.xlsx", "h1").await.unwrap());
    }

    #[tokio::test]
    async fn md5_store_matches_content_and_upgrades() {
        let dir = tempdir().expect("tempdir");
        let pool = legacy_pool(
            &dir.path().join("legacy.db"),
            "CREATE TABLE import_log (id INTEGER PRIMARY KEY AUTOINCREMENT, \
             arquivo_origem TEXT, hash_md5 TEXT UNIQUE, data_importacao TEXT)",
        )
        .await;

        let mut ledger = Ledger::from_pool(pool).await.expect("legacy store opens");
        assert_eq!(ledger.schema().file_identity(), FileIdentity::Md5);
        assert_eq!(ledger.schema().file_digest(), DigestKind::Md5);
        assert!(!ledger.schema().tracks_record_fingerprint());
        assert!(!ledger.schema().has_record_column("fonte"));

        assert!(ledger.record_file(&entry("a.xlsx", "m1")).await.unwrap());
        assert!(!ledger.has_file("a.xlsx", "m2").await.unwrap());
        assert!(ledger.has_file("renamed.xlsx", "m1").await.unwrap());
        assert!(!ledger.record_file(&entry("b.xlsx", "m1")).await.unwrap());
        assert!(ledger.record_file(&entry("a.xlsx", "m2")).await.unwrap());

        assert!(ledger.insert_record(&record("a.xlsx", "Débitos", 2)).await.unwrap());
        assert!(!ledger.insert_record(&record("a.xlsx", "Débitos", 2)).await.unwrap());
        assert_eq!(ledger.record_count().await.unwrap(), 1);

        let entries = ledger.file_entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].content_hash, "m1");

        assert_eq!(ledger.upgrade().await.unwrap(), vec!["fonte"]);
        assert!(ledger.schema().has_record_column("fonte"));
        assert!(ledger.upgrade().await.unwrap().is_empty());
        assert!(ledger.insert_record(&record("a.xlsx", "Débitos", 3)).await.unwrap());
        let fonte: Option<String> =
            sqlx::query_scalar("SELECT fonte FROM pendencias_raw WHERE linha_origem = 3")
                .fetch_one(ledger.pool())
                .await
                .unwrap();
        assert_eq!(fonte.as_deref(), Some("planilha"));
    }

    #[tokio::test]
    async fn store_without_content_hash_matches_by_name() {
        let dir = tempdir().expect("tempdir");
        let pool = legacy_pool(
            &dir.path().join("legacy.db"),
            "CREATE TABLE import_log (id INTEGER PRIMARY KEY AUTOINCREMENT, \
             arquivo_origem TEXT, data_importacao TEXT)",
        )
        .await;

        let ledger = Ledger::from_pool(pool).await.expect("legacy store opens");
        assert_eq!(ledger.schema().file_identity(), FileIdentity::NameOnly);
        assert_eq!(ledger.schema().file_digest(), DigestKind::Sha256);

        assert!(ledger.record_file(&entry("a.xlsx", "h1")).await.unwrap());
        assert!(ledger.has_file("a.xlsx", "some-other-digest").await.unwrap());
        assert!(!ledger.has_file("b.xlsx", "h1").await.unwrap());
        assert!(!ledger.record_file(&entry("a.xlsx", "h2")).await.unwrap());
        assert_eq!(ledger.file_entries().await.unwrap()[0].content_hash, "");
    }

    #[tokio::test]
    async fn views_group_and_order_classified_rows() {
        let dir = tempdir().expect("tempdir");
        let ledger = Ledger::open(dir.path().join("pendencias.db")).await.unwrap();
        for row in 2..=4 {
            ledger.insert_record(&record("a.xlsx", "Débitos", row)).await.unwrap();
        }
        let mut unclassified = record("a.xlsx", "Débitos", 5);
        unclassified.fields.tipo_pendencia = None;
        ledger.insert_record(&unclassified).await.unwrap();

        let summary = ledger.summary_view(100).await.unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].count, 3);
        assert!((summary[0].total_amount - 30.0).abs() < f64::EPSILON);
        assert_eq!(summary[0].last_collected, "2026-02-24T12:00:00");

        let details = ledger.detail_view(2).await.unwrap();
        assert_eq!(details.len(), 2);
        assert_eq!(details[0].row_number, 2);
        assert_eq!(details[1].row_number, 3);
    }
}
