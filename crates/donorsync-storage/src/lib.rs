//! Two-generation snapshot storage, CSV row loading and record-store upload for donorsync.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use donorsync_core::{
    CanonicalFieldSchema, DenormalizedPayload, FieldMap, NormalizedRecord, Row, SchemaError,
};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "donorsync-storage";

const SNAPSHOT_EXTENSION: &str = "csv";
const ROTATION_MARKER: &str = ".rotation.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    Current,
    Previous,
    /// A freshly downloaded artifact parked under a snapshot name while a rotation is in flight.
    Staged,
}

impl Generation {
    pub fn tag(self) -> &'static str {
        match self {
            Generation::Current => "current",
            Generation::Previous => "previous",
            Generation::Staged => "staged",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "current" => Some(Generation::Current),
            "previous" => Some(Generation::Previous),
            "staged" => Some(Generation::Staged),
            _ => None,
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// `<base>_<unixTimestampMillis>_<tag>.csv`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotName {
    pub base: String,
    pub timestamp_millis: i64,
    pub generation: Generation,
}

impl SnapshotName {
    pub fn new(base: impl Into<String>, timestamp_millis: i64, generation: Generation) -> Self {
        Self {
            base: base.into(),
            timestamp_millis,
            generation,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}.{SNAPSHOT_EXTENSION}",
            self.base,
            self.timestamp_millis,
            self.generation.tag()
        )
    }

    /// Parse a file name that follows the naming convention for `base`.
    pub fn parse(file_name: &str, base: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(&format!(".{SNAPSHOT_EXTENSION}"))?;
        let rest = stem.strip_prefix(base)?.strip_prefix('_')?;
        let (stamp, tag) = rest.split_once('_')?;
        if stamp.is_empty() || !stamp.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self {
            base: base.to_string(),
            timestamp_millis: stamp.parse().ok()?,
            generation: Generation::from_tag(tag)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub name: SnapshotName,
    pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("no previous snapshot to delete in {0}")]
    NoPreviousSnapshot(PathBuf),
    #[error("found {count} {generation} snapshots in {dir}; expected at most one")]
    AmbiguousGeneration {
        generation: Generation,
        count: usize,
        dir: PathBuf,
    },
    #[error("downloaded artifact {0} does not exist")]
    ArtifactNotFound(PathBuf),
    #[error("a rotation is already in progress in {0}; resume it first")]
    RotationInProgress(PathBuf),
    #[error("rotation marker references staged artifact {0} which no longer exists")]
    StagedArtifactMissing(PathBuf),
    #[error("invalid rotation marker {path}: {source}")]
    Marker {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error<'a>(
    action: &'static str,
    path: &'a Path,
) -> impl FnOnce(io::Error) -> SnapshotError + 'a {
    move |source| SnapshotError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

/// Planned renames for one rotation, persisted before any file is touched.
///
/// Every step checks the filesystem before acting, so replaying a plan after a crash only
/// performs the steps that had not completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RotationPlan {
    artifact: PathBuf,
    staged: PathBuf,
    retire_previous: Option<PathBuf>,
    demote_current: Option<(PathBuf, PathBuf)>,
    promoted: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationOutcome {
    pub current: PathBuf,
    pub previous: Option<PathBuf>,
    pub retired: Option<PathBuf>,
}

/// Owns the `current` / `previous` snapshot pair in one directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    base_filename: String,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, base_filename: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base_filename: base_filename.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn base_filename(&self) -> &str {
        &self.base_filename
    }

    fn marker_path(&self) -> PathBuf {
        self.dir.join(ROTATION_MARKER)
    }

    fn path_for(&self, timestamp_millis: i64, generation: Generation) -> PathBuf {
        self.dir.join(
            SnapshotName::new(&self.base_filename, timestamp_millis, generation).file_name(),
        )
    }

    pub async fn ensure_dir(&self) -> Result<(), SnapshotError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(io_error("creating snapshot directory", &self.dir))
    }

    /// All snapshots of one generation, oldest first.
    pub async fn list(&self, generation: Generation) -> Result<Vec<Snapshot>, SnapshotError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error("listing snapshot directory", &self.dir)(err)),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_error("listing snapshot directory", &self.dir))?
        {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(name) = SnapshotName::parse(file_name, &self.base_filename) {
                if name.generation == generation {
                    found.push(Snapshot {
                        path: entry.path(),
                        name,
                    });
                }
            }
        }
        found.sort_by_key(|s| s.name.timestamp_millis);
        Ok(found)
    }

    /// The single snapshot of `generation`, if one exists.
    pub async fn find(&self, generation: Generation) -> Result<Option<Snapshot>, SnapshotError> {
        let mut found = self.list(generation).await?;
        match found.len() {
            0 => Ok(None),
            1 => Ok(found.pop()),
            count => Err(SnapshotError::AmbiguousGeneration {
                generation,
                count,
                dir: self.dir.clone(),
            }),
        }
    }

    pub async fn current(&self) -> Result<Option<Snapshot>, SnapshotError> {
        self.find(Generation::Current).await
    }

    pub async fn previous(&self) -> Result<Option<Snapshot>, SnapshotError> {
        self.find(Generation::Previous).await
    }

    /// Delete the `previous` generation. Fails when there is nothing to delete.
    pub async fn delete_previous(&self) -> Result<PathBuf, SnapshotError> {
        let Some(previous) = self.previous().await? else {
            return Err(SnapshotError::NoPreviousSnapshot(self.dir.clone()));
        };
        fs::remove_file(&previous.path)
            .await
            .map_err(io_error("deleting previous snapshot", &previous.path))?;
        Ok(previous.path)
    }

    pub async fn rotation_pending(&self) -> Result<bool, SnapshotError> {
        fs::try_exists(self.marker_path())
            .await
            .map_err(io_error("checking rotation marker", &self.dir))
    }

    /// Promote `artifact` to `current`, demoting the old `current` to `previous` and deleting
    /// the old `previous`.
    pub async fn rotate(&self, artifact: &Path) -> Result<RotationOutcome, SnapshotError> {
        self.rotate_at(artifact, Utc::now().timestamp_millis()).await
    }

    pub async fn rotate_at(
        &self,
        artifact: &Path,
        timestamp_millis: i64,
    ) -> Result<RotationOutcome, SnapshotError> {
        if self.rotation_pending().await? {
            return Err(SnapshotError::RotationInProgress(self.dir.clone()));
        }
        if !fs::try_exists(artifact)
            .await
            .map_err(io_error("checking downloaded artifact", artifact))?
        {
            return Err(SnapshotError::ArtifactNotFound(artifact.to_path_buf()));
        }

        let current = self.current().await?;
        let previous = self.previous().await?;
        if previous.is_none() {
            debug!(dir = %self.dir.display(), "no previous snapshot; skipping delete step");
        }

        let plan = RotationPlan {
            artifact: artifact.to_path_buf(),
            staged: self.path_for(timestamp_millis, Generation::Staged),
            retire_previous: previous.map(|s| s.path),
            demote_current: current
                .map(|s| (s.path, self.path_for(timestamp_millis, Generation::Previous))),
            promoted: self.path_for(timestamp_millis, Generation::Current),
        };

        self.write_marker(&plan).await?;
        self.apply(&plan).await
    }

    /// Finish a rotation interrupted by a crash, if its marker is still on disk.
    pub async fn resume(&self) -> Result<Option<RotationOutcome>, SnapshotError> {
        let marker = self.marker_path();
        let raw = match fs::read(&marker).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error("reading rotation marker", &marker)(err)),
        };
        let plan: RotationPlan = serde_json::from_slice(&raw).map_err(|source| {
            SnapshotError::Marker {
                path: marker.clone(),
                source,
            }
        })?;
        warn!(marker = %marker.display(), "resuming interrupted snapshot rotation");
        self.apply(&plan).await.map(Some)
    }

    async fn apply(&self, plan: &RotationPlan) -> Result<RotationOutcome, SnapshotError> {
        if exists(&plan.artifact).await? && !exists(&plan.staged).await? {
            fs::rename(&plan.artifact, &plan.staged)
                .await
                .map_err(io_error("staging downloaded artifact", &plan.artifact))?;
        }

        if let Some(previous) = &plan.retire_previous {
            match fs::remove_file(previous).await {
                Ok(()) => info!(path = %previous.display(), "deleted previous snapshot"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_error("deleting previous snapshot", previous)(err)),
            }
        }

        if let Some((from, to)) = &plan.demote_current {
            if exists(from).await? {
                fs::rename(from, to)
                    .await
                    .map_err(io_error("demoting current snapshot", from))?;
                info!(path = %to.display(), "demoted current snapshot to previous");
            }
        }

        if exists(&plan.staged).await? {
            fs::rename(&plan.staged, &plan.promoted)
                .await
                .map_err(io_error("promoting staged snapshot", &plan.staged))?;
            info!(path = %plan.promoted.display(), "promoted download to current snapshot");
        } else if !exists(&plan.promoted).await? {
            return Err(SnapshotError::StagedArtifactMissing(plan.staged.clone()));
        }

        let marker = self.marker_path();
        fs::remove_file(&marker)
            .await
            .map_err(io_error("removing rotation marker", &marker))?;

        Ok(RotationOutcome {
            current: plan.promoted.clone(),
            previous: plan.demote_current.as_ref().map(|(_, to)| to.clone()),
            retired: plan.retire_previous.clone(),
        })
    }

    async fn write_marker(&self, plan: &RotationPlan) -> Result<(), SnapshotError> {
        let marker = self.marker_path();
        let temp = self.dir.join(format!("{ROTATION_MARKER}.tmp"));
        let bytes = serde_json::to_vec_pretty(plan).map_err(|source| SnapshotError::Marker {
            path: marker.clone(),
            source,
        })?;

        let mut file = fs::File::create(&temp)
            .await
            .map_err(io_error("creating rotation marker", &temp))?;
        file.write_all(&bytes)
            .await
            .map_err(io_error("writing rotation marker", &temp))?;
        file.sync_all()
            .await
            .map_err(io_error("syncing rotation marker", &temp))?;
        drop(file);

        fs::rename(&temp, &marker)
            .await
            .map_err(io_error("installing rotation marker", &marker))
    }
}

async fn exists(path: &Path) -> Result<bool, SnapshotError> {
    fs::try_exists(path)
        .await
        .map_err(io_error("checking snapshot path", path))
}

#[derive(Debug, Error)]
pub enum CsvError {
    #[error("reading csv {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct CsvReadOptions {
    pub lowercase_headers: bool,
}

impl Default for CsvReadOptions {
    fn default() -> Self {
        Self {
            lowercase_headers: true,
        }
    }
}

/// Load every row of a headed CSV file as string-valued [`Row`]s, in file order.
///
/// Short records simply omit the trailing columns; surplus cells are dropped.
pub fn read_csv_rows(path: &Path, options: CsvReadOptions) -> Result<Vec<Row>, CsvError> {
    let wrap = |source| CsvError::Read {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(wrap)?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(wrap)?
        .iter()
        .enumerate()
        .map(|(idx, h)| {
            let h = if idx == 0 { h.trim_start_matches('\u{feff}') } else { h };
            if options.lowercase_headers {
                h.to_lowercase()
            } else {
                h.to_string()
            }
        })
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(wrap)?;
        let fields: FieldMap = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.clone(), Value::String(v.to_string())))
            .collect();
        rows.push(Row::new(fields));
    }
    Ok(rows)
}

/// [`read_csv_rows`] on the blocking pool.
pub async fn load_csv_rows(path: PathBuf, options: CsvReadOptions) -> Result<Vec<Row>, CsvError> {
    let display = path.clone();
    match tokio::task::spawn_blocking(move || read_csv_rows(&path, options)).await {
        Ok(result) => result,
        Err(join_err) => Err(CsvError::Read {
            path: display,
            source: csv::Error::from(io::Error::other(join_err)),
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Batch creates are not idempotent: only a rate-limit rejection is known not to have been
/// applied, so it is the only status retried.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Connection failures happen before the request is sent; anything later may have landed.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Destination table in the record store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub base_id: String,
    pub table_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateOptions {
    /// Let the store coerce values into each column's declared type.
    pub typecast: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self { typecast: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedRecord {
    pub id: String,
    #[serde(default)]
    pub created_time: Option<String>,
    #[serde(default)]
    pub fields: FieldMap,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("record store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("record store returned http {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("invalid record store url {0}")]
    InvalidUrl(String),
    #[error("record store created {received} records for {sent} submitted")]
    CardinalityMismatch { sent: usize, received: usize },
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Write side of the external structured-record store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create every payload, returning one record per input in submission order.
    async fn create_records(
        &self,
        table: &TableRef,
        payloads: &[DenormalizedPayload],
        options: CreateOptions,
    ) -> Result<Vec<CreatedRecord>, UploadError>;
}

/// Maximum records accepted by one create request.
pub const MAX_RECORDS_PER_REQUEST: usize = 10;

#[derive(Debug, Clone)]
pub struct RecordStoreConfig {
    pub api_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    records: Vec<CreateRequestRecord<'a>>,
    typecast: bool,
}

#[derive(Debug, Serialize)]
struct CreateRequestRecord<'a> {
    fields: &'a DenormalizedPayload,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    records: Vec<CreatedRecord>,
}

/// Airtable-style REST client: `POST {api_url}/{base}/{table}` with `{records, typecast}`.
#[derive(Debug)]
pub struct AirtableClient {
    client: reqwest::Client,
    api_url: Url,
    api_key: String,
    backoff: BackoffPolicy,
}

impl AirtableClient {
    pub fn new(config: RecordStoreConfig) -> Result<Self, UploadError> {
        let api_url =
            Url::parse(&config.api_url).map_err(|_| UploadError::InvalidUrl(config.api_url.clone()))?;
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            api_url,
            api_key: config.api_key,
            backoff: config.backoff,
        })
    }

    pub fn table_url(&self, table: &TableRef) -> Result<Url, UploadError> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| UploadError::InvalidUrl(self.api_url.to_string()))?
            .pop_if_empty()
            .push(&table.base_id)
            .push(&table.table_name);
        Ok(url)
    }

    async fn create_chunk(
        &self,
        url: &Url,
        chunk: &[DenormalizedPayload],
        options: CreateOptions,
    ) -> Result<Vec<CreatedRecord>, UploadError> {
        let body = CreateRequest {
            records: chunk
                .iter()
                .map(|fields| CreateRequestRecord { fields })
                .collect(),
            typecast: options.typecast,
        };

        for attempt in 0..=self.backoff.max_retries {
            let sent = self
                .client
                .post(url.clone())
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match sent {
                Ok(resp) if resp.status().is_success() => {
                    let parsed: CreateResponse = resp.json().await?;
                    if parsed.records.len() != chunk.len() {
                        return Err(UploadError::CardinalityMismatch {
                            sent: chunk.len(),
                            received: parsed.records.len(),
                        });
                    }
                    return Ok(parsed.records);
                }
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "record store throttled create; backing off");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    let body = resp.text().await.unwrap_or_default();
                    return Err(UploadError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "record store unreachable; backing off");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(UploadError::Request(err));
                }
            }
        }

        Err(UploadError::HttpStatus {
            status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
            url: url.to_string(),
            body: "retries exhausted".to_string(),
        })
    }
}

#[async_trait]
impl RecordStore for AirtableClient {
    async fn create_records(
        &self,
        table: &TableRef,
        payloads: &[DenormalizedPayload],
        options: CreateOptions,
    ) -> Result<Vec<CreatedRecord>, UploadError> {
        let url = self.table_url(table)?;
        let mut created = Vec::with_capacity(payloads.len());
        for chunk in payloads.chunks(MAX_RECORDS_PER_REQUEST) {
            created.extend(self.create_chunk(&url, chunk, options).await?);
        }
        debug!(table = %table.table_name, created = created.len(), "records created");
        Ok(created)
    }
}

/// A record-store table seen through its canonical schema.
#[derive(Clone)]
pub struct RecordTable {
    store: Arc<dyn RecordStore>,
    table: TableRef,
    schema: CanonicalFieldSchema,
}

impl RecordTable {
    pub fn new(store: Arc<dyn RecordStore>, table: TableRef, schema: CanonicalFieldSchema) -> Self {
        Self {
            store,
            table,
            schema,
        }
    }

    pub fn schema(&self) -> &CanonicalFieldSchema {
        &self.schema
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    /// Denormalize and create a batch, returning the created records normalized.
    pub async fn create(
        &self,
        objects: &[FieldMap],
        options: CreateOptions,
    ) -> Result<Vec<NormalizedRecord>, UploadError> {
        if objects.is_empty() {
            return Ok(Vec::new());
        }
        let payloads: Vec<DenormalizedPayload> = objects
            .iter()
            .map(|object| self.schema.denormalize(object))
            .collect();
        let created = self
            .store
            .create_records(&self.table, &payloads, options)
            .await?;
        if created.len() != payloads.len() {
            return Err(UploadError::CardinalityMismatch {
                sent: payloads.len(),
                received: created.len(),
            });
        }
        created
            .into_iter()
            .map(|record| {
                self.schema
                    .normalize_with_id(Some(record.id), &record.fields)
                    .map_err(UploadError::from)
            })
            .collect()
    }

    pub async fn create_one(
        &self,
        object: &FieldMap,
        options: CreateOptions,
    ) -> Result<NormalizedRecord, UploadError> {
        let mut created = self.create(std::slice::from_ref(object), options).await?;
        created.pop().ok_or(UploadError::CardinalityMismatch {
            sent: 1,
            received: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const BASE: &str = "download-donor-detail-recurring";

    async fn touch(path: &Path, body: &str) {
        fs::write(path, body).await.expect("write fixture");
    }

    #[test]
    fn snapshot_names_round_trip_through_parse() {
        let name = SnapshotName::new(BASE, 1_700_000_000_123, Generation::Previous);
        let file = name.file_name();
        assert_eq!(file, format!("{BASE}_1700000000123_previous.csv"));
        assert_eq!(SnapshotName::parse(&file, BASE), Some(name));
    }

    #[test]
    fn foreign_names_do_not_parse() {
        assert!(SnapshotName::parse(&format!("{BASE}.csv"), BASE).is_none());
        assert!(SnapshotName::parse(&format!("{BASE}_abc_current.csv"), BASE).is_none());
        assert!(SnapshotName::parse(&format!("{BASE}_1_newest.csv"), BASE).is_none());
        assert!(SnapshotName::parse("other_1_current.csv", BASE).is_none());
        assert!(SnapshotName::parse(&format!("{BASE}_1_current.txt"), BASE).is_none());
    }

    #[tokio::test]
    async fn rotation_keeps_exactly_two_generations() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path(), BASE);
        let old_previous = dir.path().join(format!("{BASE}_100_previous.csv"));
        let old_current = dir.path().join(format!("{BASE}_200_current.csv"));
        let download = dir.path().join(format!("{BASE}.csv"));
        touch(&old_previous, "date\n2024-01-01\n").await;
        touch(&old_current, "date\n2024-01-02\n").await;
        touch(&download, "date\n2024-01-05\n").await;

        let outcome = store.rotate_at(&download, 300).await.expect("rotate");

        assert_eq!(outcome.retired.as_deref(), Some(old_previous.as_path()));
        assert!(!old_previous.exists());
        assert!(!old_current.exists());
        assert!(!download.exists());
        assert_eq!(store.list(Generation::Current).await.expect("list").len(), 1);
        assert_eq!(store.list(Generation::Previous).await.expect("list").len(), 1);
        assert!(store.list(Generation::Staged).await.expect("list").is_empty());

        let previous = store.previous().await.expect("find").expect("previous");
        assert_eq!(
            fs::read_to_string(&previous.path).await.expect("read"),
            "date\n2024-01-02\n"
        );
        let current = store.current().await.expect("find").expect("current");
        assert_eq!(current.path, outcome.current);
        assert_eq!(
            fs::read_to_string(&current.path).await.expect("read"),
            "date\n2024-01-05\n"
        );
        assert!(!store.rotation_pending().await.expect("marker"));
    }

    #[tokio::test]
    async fn cold_start_rotation_leaves_only_current() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path(), BASE);
        let download = dir.path().join(format!("{BASE}.csv"));
        touch(&download, "date\n").await;

        let outcome = store.rotate_at(&download, 10).await.expect("rotate");

        assert!(outcome.previous.is_none());
        assert!(outcome.retired.is_none());
        assert!(store.current().await.expect("find").is_some());
        assert!(store.previous().await.expect("find").is_none());
    }

    #[tokio::test]
    async fn delete_previous_requires_a_target() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path(), BASE);

        let err = store.delete_previous().await.unwrap_err();
        assert!(matches!(err, SnapshotError::NoPreviousSnapshot(_)));

        let previous = dir.path().join(format!("{BASE}_5_previous.csv"));
        touch(&previous, "date\n").await;
        assert_eq!(store.delete_previous().await.expect("delete"), previous);
        assert!(!previous.exists());
    }

    #[tokio::test]
    async fn duplicate_generations_are_reported() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path(), BASE);
        touch(&dir.path().join(format!("{BASE}_1_current.csv")), "").await;
        touch(&dir.path().join(format!("{BASE}_2_current.csv")), "").await;

        let err = store.current().await.unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::AmbiguousGeneration { count: 2, .. }
        ));
    }

    #[tokio::test]
    async fn missing_artifact_is_rejected_before_touching_files() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path(), BASE);
        let current = dir.path().join(format!("{BASE}_1_current.csv"));
        touch(&current, "").await;

        let err = store
            .rotate_at(&dir.path().join("missing.csv"), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::ArtifactNotFound(_)));
        assert!(current.exists());
        assert!(!store.rotation_pending().await.expect("marker"));
    }

    #[tokio::test]
    async fn interrupted_rotation_resumes_from_marker() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path(), BASE);
        let old_current = dir.path().join(format!("{BASE}_200_current.csv"));
        let download = dir.path().join(format!("{BASE}.csv"));
        touch(&old_current, "old").await;
        touch(&download, "new").await;

        // Crash after staging the download and demoting current, before promotion.
        let plan = RotationPlan {
            artifact: download.clone(),
            staged: store.path_for(300, Generation::Staged),
            retire_previous: None,
            demote_current: Some((old_current.clone(), store.path_for(300, Generation::Previous))),
            promoted: store.path_for(300, Generation::Current),
        };
        store.write_marker(&plan).await.expect("marker");
        fs::rename(&download, &plan.staged).await.expect("stage");
        fs::rename(&old_current, store.path_for(300, Generation::Previous))
            .await
            .expect("demote");

        let err = store.rotate_at(&download, 400).await.unwrap_err();
        assert!(matches!(err, SnapshotError::RotationInProgress(_)));

        let outcome = store.resume().await.expect("resume").expect("pending");
        assert_eq!(outcome.current, plan.promoted);
        assert_eq!(
            fs::read_to_string(&plan.promoted).await.expect("read"),
            "new"
        );
        assert!(store.previous().await.expect("find").is_some());
        assert!(!store.rotation_pending().await.expect("marker"));
        assert!(store.resume().await.expect("resume").is_none());
    }

    #[test]
    fn csv_rows_lowercase_headers_and_keep_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rows.csv");
        std::fs::write(
            &path,
            "\u{feff}Date,Amount,Donor Name\n2024-01-05,9,\"Lovelace, Ada\"\n2024-01-03,4\n",
        )
        .expect("write");

        let rows = read_csv_rows(&path, CsvReadOptions::default()).expect("read");

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].date(), Some("2024-01-05"));
        assert_eq!(rows[0].get("donor name"), Some(&json!("Lovelace, Ada")));
        assert_eq!(
            rows[0].fields().keys().collect::<Vec<_>>(),
            vec!["date", "amount", "donor name"]
        );
        assert_eq!(rows[1].len(), 2);
    }

    #[test]
    fn only_rate_limits_are_retried() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn table_url_escapes_table_names() {
        let client = AirtableClient::new(RecordStoreConfig {
            api_url: "https://api.airtable.com/v0/".to_string(),
            api_key: "key".to_string(),
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
        })
        .expect("client");
        let url = client
            .table_url(&TableRef {
                base_id: "appXYZ".to_string(),
                table_name: "Donor Detail".to_string(),
            })
            .expect("url");
        assert_eq!(url.as_str(), "https://api.airtable.com/v0/appXYZ/Donor%20Detail");
    }

    #[test]
    fn create_request_wraps_fields_and_typecast() {
        let payload = CanonicalFieldSchema::default().denormalize(
            json!({"date": "2024-01-05"}).as_object().expect("object"),
        );
        let body = CreateRequest {
            records: vec![CreateRequestRecord { fields: &payload }],
            typecast: true,
        };
        assert_eq!(
            serde_json::to_value(&body).expect("json"),
            json!({"records": [{"fields": {"date": "2024-01-05"}}], "typecast": true})
        );
    }

    #[derive(Default)]
    struct EchoStore {
        calls: Mutex<Vec<Vec<DenormalizedPayload>>>,
    }

    #[async_trait]
    impl RecordStore for EchoStore {
        async fn create_records(
            &self,
            _table: &TableRef,
            payloads: &[DenormalizedPayload],
            _options: CreateOptions,
        ) -> Result<Vec<CreatedRecord>, UploadError> {
            self.calls.lock().expect("lock").push(payloads.to_vec());
            Ok(payloads
                .iter()
                .enumerate()
                .map(|(idx, p)| CreatedRecord {
                    id: format!("rec{idx}"),
                    created_time: None,
                    fields: p.fields().clone(),
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn record_table_denormalizes_out_and_normalizes_back() {
        let store = Arc::new(EchoStore::default());
        let schema =
            CanonicalFieldSchema::from_pairs([("amount", "Amount ($)"), ("note", "Notes")])
                .expect("schema");
        let table = RecordTable::new(
            store.clone(),
            TableRef {
                base_id: "app".to_string(),
                table_name: "donations".to_string(),
            },
            schema,
        );

        let object = json!({"amount": "12", "note": null, "_meta": {"src": "x"}});
        let created = table
            .create_one(object.as_object().expect("object"), CreateOptions::default())
            .await
            .expect("create");

        let calls = store.calls.lock().expect("lock");
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0][0].fields(),
            json!({"Amount ($)": "12", "_meta": "{\"src\":\"x\"}"})
                .as_object()
                .expect("object")
        );
        assert_eq!(created.id.as_deref(), Some("rec0"));
        assert_eq!(created.get("amount"), Some(&json!("12")));
        assert!(created.is_null("note"));
        assert_eq!(created.meta, Some(json!({"src": "x"})));
    }
}
