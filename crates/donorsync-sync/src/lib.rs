//! Sync pipeline: download -> rotate snapshots -> diff -> upload new donor rows.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use donorsync_adapters::{
    ArtifactSource, CancelSignal, CredentialStore, DownloadError, KeychainCredentialStore,
    PollPolicy, PortalConfig, PortalDownloader, StaticCredentialStore, WebDriverConfig,
    WebDriverLauncher, PORTAL_BASE_URL,
};
use donorsync_core::{CanonicalFieldSchema, FieldMap, Row, SchemaError};
use donorsync_storage::{
    load_csv_rows, AirtableClient, BackoffPolicy, CreateOptions, CsvError, CsvReadOptions,
    RecordStore, RecordStoreConfig, RecordTable, SnapshotError, SnapshotStore, TableRef,
    UploadError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "donorsync-sync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("no base with key {0:?} in table config")]
    UnknownBase(String),
    #[error("no table with key {table:?} in base {base:?}")]
    UnknownTable { base: String, table: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Keychain,
    Env,
}

/// Everything one pipeline run needs, resolved once at startup.
#[derive(Clone)]
pub struct SyncConfig {
    pub portal_base_url: String,
    pub portal_username: String,
    pub portal_page_path: String,
    pub portal_password: Option<String>,
    pub credential_source: CredentialSource,
    pub webdriver_url: String,
    pub download_dir: PathBuf,
    pub snapshot_basename: String,
    pub download_timeout: Duration,
    pub download_poll_interval: Duration,
    pub table_config_path: PathBuf,
    pub record_store_base: String,
    pub record_store_table: String,
    pub record_store_api_url: String,
    pub record_store_api_key: String,
    pub sync_cron: String,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("portal_base_url", &self.portal_base_url)
            .field("portal_username", &self.portal_username)
            .field("portal_page_path", &self.portal_page_path)
            .field("credential_source", &self.credential_source)
            .field("webdriver_url", &self.webdriver_url)
            .field("download_dir", &self.download_dir)
            .field("snapshot_basename", &self.snapshot_basename)
            .field("download_timeout", &self.download_timeout)
            .field("table_config_path", &self.table_config_path)
            .field("record_store_base", &self.record_store_base)
            .field("record_store_table", &self.record_store_table)
            .field("sync_cron", &self.sync_cron)
            .finish_non_exhaustive()
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any name -> value source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));
        let seconds = |name: &'static str, default: u64| -> Result<u64, ConfigError> {
            match get(name) {
                None => Ok(default),
                Some(raw) => raw.trim().parse().map_err(|err| ConfigError::Invalid {
                    name,
                    value: raw.clone(),
                    reason: format!("{err}"),
                }),
            }
        };

        let credential_source = match get("CREDENTIAL_SOURCE").as_deref() {
            None | Some("keychain") => CredentialSource::Keychain,
            Some("env") => CredentialSource::Env,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "CREDENTIAL_SOURCE",
                    value: other.to_string(),
                    reason: "expected `keychain` or `env`".to_string(),
                })
            }
        };
        let portal_password = get("PORTAL_PASSWORD");
        if credential_source == CredentialSource::Env && portal_password.is_none() {
            return Err(ConfigError::Missing("PORTAL_PASSWORD"));
        }

        Ok(Self {
            portal_base_url: PORTAL_BASE_URL.to_string(),
            portal_username: required("PORTAL_USERNAME")?,
            portal_page_path: required("PORTAL_PAGE_PATH")?,
            portal_password,
            credential_source,
            webdriver_url: get("WEBDRIVER_URL")
                .unwrap_or_else(|| "http://localhost:9515".to_string()),
            download_dir: get("DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./downloads")),
            snapshot_basename: get("SNAPSHOT_BASENAME")
                .unwrap_or_else(|| "download-donor-detail-recurring".to_string()),
            download_timeout: Duration::from_secs(seconds("DOWNLOAD_TIMEOUT_SECS", 600)?),
            download_poll_interval: Duration::from_millis(seconds("DOWNLOAD_POLL_MILLIS", 1000)?),
            table_config_path: get("TABLE_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./airtable.config.json")),
            record_store_base: get("RECORD_STORE_BASE").unwrap_or_else(|| "donors".to_string()),
            record_store_table: get("RECORD_STORE_TABLE")
                .unwrap_or_else(|| "donations".to_string()),
            record_store_api_url: get("RECORD_STORE_API_URL")
                .unwrap_or_else(|| "https://api.airtable.com/v0".to_string()),
            record_store_api_key: required("RECORD_STORE_API_KEY")?,
            sync_cron: get("SYNC_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
        })
    }

    pub fn portal_config(&self) -> PortalConfig {
        let mut portal = PortalConfig::new(&self.portal_username, &self.portal_page_path);
        portal.base_url = self.portal_base_url.clone();
        portal.poll = PollPolicy {
            interval: self.download_poll_interval,
            deadline: Some(self.download_timeout),
        };
        portal
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecordStoreLayout {
    pub bases: Vec<BaseConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BaseConfig {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TableConfig {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub schema: CanonicalFieldSchema,
}

impl RecordStoreLayout {
    /// Load a JSON layout file, or YAML when the extension says so.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let parsed = if is_yaml {
            serde_yaml::from_str(&raw).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(&raw).map_err(|e| e.to_string())
        };
        parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn table(
        &self,
        base_key: &str,
        table_key: &str,
    ) -> Result<(TableRef, CanonicalFieldSchema), ConfigError> {
        let base = self
            .bases
            .iter()
            .find(|b| b.key == base_key)
            .ok_or_else(|| ConfigError::UnknownBase(base_key.to_string()))?;
        let table = base
            .tables
            .iter()
            .find(|t| t.key == table_key)
            .ok_or_else(|| ConfigError::UnknownTable {
                base: base_key.to_string(),
                table: table_key.to_string(),
            })?;
        Ok((
            TableRef {
                base_id: base.id.clone(),
                table_name: table.name.clone(),
            },
            table.schema.clone(),
        ))
    }
}

/// Result of comparing the previous snapshot with the current one.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOutcome {
    /// Rows ahead of the anchor, most recent first.
    NewRows(Vec<Row>),
    /// The anchor is the first current row.
    UpToDate,
    /// The anchor date does not occur in the current snapshot (or the previous head has no date).
    AnchorMissing { anchor: Option<String> },
}

/// Rows of `current` newer than the head of `previous`.
///
/// "Anchor missing" and "anchor at index 0" both yield no rows; use [`diff_outcome`] to tell
/// them apart.
pub fn diff(previous: &[Row], current: &[Row]) -> Vec<Row> {
    match diff_outcome(previous, current) {
        DeltaOutcome::NewRows(rows) => rows,
        DeltaOutcome::UpToDate | DeltaOutcome::AnchorMissing { .. } => Vec::new(),
    }
}

pub fn diff_outcome(previous: &[Row], current: &[Row]) -> DeltaOutcome {
    let Some(anchor) = previous.first().and_then(Row::date) else {
        return DeltaOutcome::AnchorMissing { anchor: None };
    };
    match current.iter().position(|row| row.date() == Some(anchor)) {
        None => DeltaOutcome::AnchorMissing {
            anchor: Some(anchor.to_string()),
        },
        Some(0) => DeltaOutcome::UpToDate,
        Some(boundary) => DeltaOutcome::NewRows(current[..boundary].to_vec()),
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("download failed: {0}")]
    Download(#[from] DownloadError),
    #[error("snapshot rotation failed: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Csv(#[from] CsvError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("upload failed: {0}")]
    Upload(#[from] UploadError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// First run: the download became the only snapshot and nothing was compared.
    Baseline,
    NoNewRecords,
    AnchorMissing,
    Uploaded,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: SyncStatus,
    pub current_snapshot: PathBuf,
    pub previous_snapshot: Option<PathBuf>,
    pub new_rows: usize,
    pub created_record_ids: Vec<String>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: Arc<dyn ArtifactSource>,
    snapshots: SnapshotStore,
    table: RecordTable,
}

impl SyncPipeline {
    /// Wire the production collaborators: WebDriver browser, credential store, REST record store.
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        let launcher = WebDriverLauncher::new(WebDriverConfig {
            endpoint: config.webdriver_url.clone(),
            ..WebDriverConfig::default()
        })
        .map_err(DownloadError::from)?;
        let credentials: Arc<dyn CredentialStore> = match config.credential_source {
            CredentialSource::Keychain => Arc::new(KeychainCredentialStore),
            CredentialSource::Env => {
                Arc::new(StaticCredentialStore::new(config.portal_password.clone()))
            }
        };
        let source = PortalDownloader::new(config.portal_config(), Arc::new(launcher), credentials);
        let store = AirtableClient::new(RecordStoreConfig {
            api_url: config.record_store_api_url.clone(),
            api_key: config.record_store_api_key.clone(),
            timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        })?;
        Self::with_parts(config, Arc::new(source), Arc::new(store))
    }

    pub fn with_parts(
        config: SyncConfig,
        source: Arc<dyn ArtifactSource>,
        store: Arc<dyn RecordStore>,
    ) -> Result<Self, SyncError> {
        let layout = RecordStoreLayout::load(&config.table_config_path)?;
        let (table, schema) =
            layout.table(&config.record_store_base, &config.record_store_table)?;
        let snapshots = SnapshotStore::new(&config.download_dir, &config.snapshot_basename);
        Ok(Self {
            table: RecordTable::new(store, table, schema),
            snapshots,
            source,
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub async fn run_once(&self, cancel: CancelSignal) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run_inner(run_id, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        cancel: CancelSignal,
    ) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();

        self.snapshots.ensure_dir().await?;
        if let Some(resumed) = self.snapshots.resume().await? {
            warn!(current = %resumed.current.display(), "finished an interrupted rotation");
        }

        let artifact = self.source.fetch(self.snapshots.dir(), cancel).await?;
        let rotation = self.snapshots.rotate(&artifact.path).await?;

        let summary = |status, new_rows, created_record_ids| SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status,
            current_snapshot: rotation.current.clone(),
            previous_snapshot: rotation.previous.clone(),
            new_rows,
            created_record_ids,
        };

        let Some(previous_path) = rotation.previous.clone() else {
            info!("no previous snapshot; baseline established");
            return Ok(summary(SyncStatus::Baseline, 0, Vec::new()));
        };

        let options = CsvReadOptions::default();
        let previous_rows = load_csv_rows(previous_path, options).await?;
        let current_rows = load_csv_rows(rotation.current.clone(), options).await?;

        let new_rows = match diff_outcome(&previous_rows, &current_rows) {
            DeltaOutcome::NewRows(rows) if !rows.is_empty() => rows,
            DeltaOutcome::NewRows(_) | DeltaOutcome::UpToDate => {
                info!("no new records");
                return Ok(summary(SyncStatus::NoNewRecords, 0, Vec::new()));
            }
            DeltaOutcome::AnchorMissing { anchor } => {
                warn!(?anchor, "anchor row not found in current snapshot; reporting no new records");
                return Ok(summary(SyncStatus::AnchorMissing, 0, Vec::new()));
            }
        };

        let count = new_rows.len();
        info!(rows = count, "uploading new records");
        let objects: Vec<FieldMap> = new_rows.into_iter().map(Row::into_fields).collect();
        let created = self.table.create(&objects, CreateOptions::default()).await?;
        let ids: Vec<String> = created.into_iter().filter_map(|r| r.id).collect();
        info!(created = ids.len(), "upload complete");

        Ok(summary(SyncStatus::Uploaded, count, ids))
    }
}

pub async fn run_sync_once_from_env(cancel: CancelSignal) -> anyhow::Result<SyncRunSummary> {
    let config = SyncConfig::from_env().context("loading configuration")?;
    let pipeline = SyncPipeline::new(config)?;
    Ok(pipeline.run_once(cancel).await?)
}

/// Run the pipeline on `config.sync_cron`. Ticks that land while a run is in flight are skipped.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().sync_cron.clone();
    let in_flight = Arc::new(Mutex::new(()));

    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let in_flight = in_flight.clone();
        Box::pin(async move {
            let Ok(_guard) = in_flight.try_lock() else {
                warn!("previous sync still running; skipping tick");
                return;
            };
            match pipeline.run_once(CancelSignal::never()).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    status = ?summary.status,
                    new_rows = summary.new_rows,
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Diff two snapshot files without downloading anything.
pub async fn diff_files(previous: &Path, current: &Path) -> Result<DeltaOutcome, SyncError> {
    let options = CsvReadOptions::default();
    let previous_rows = load_csv_rows(previous.to_path_buf(), options).await?;
    let current_rows = load_csv_rows(current.to_path_buf(), options).await?;
    Ok(diff_outcome(&previous_rows, &current_rows))
}
