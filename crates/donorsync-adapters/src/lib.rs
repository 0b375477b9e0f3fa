//! Portal download orchestration: browser capability contracts, credential lookup and the
//! login -> navigate -> download -> poll state machine.

pub mod webdriver;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use thiserror::Error;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use webdriver::{WebDriverConfig, WebDriverLauncher, WebDriverSession};

pub const CRATE_NAME: &str = "donorsync-adapters";

pub const PORTAL_BASE_URL: &str = "https://ioby.org";

/// Opaque reference to an element inside a live browser session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementHandle(pub String);

/// How an element is found on the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Css(String),
    XPath(String),
    /// First `tag` element whose text contains `text`, optionally nested under `container`.
    Text {
        container: Option<String>,
        tag: String,
        text: String,
    },
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css(selector.into())
    }

    pub fn link_text(text: impl Into<String>) -> Self {
        Locator::Text {
            container: None,
            tag: "a".to_string(),
            text: text.into(),
        }
    }

    pub fn within(self, container: impl Into<String>) -> Self {
        match self {
            Locator::Text { tag, text, .. } => Locator::Text {
                container: Some(container.into()),
                tag,
                text,
            },
            other => other,
        }
    }

    /// WebDriver location strategy and its criteria.
    pub fn strategy(&self) -> (&'static str, String) {
        match self {
            Locator::Css(selector) => ("css selector", selector.clone()),
            Locator::XPath(expr) => ("xpath", expr.clone()),
            Locator::Text {
                container,
                tag,
                text,
            } => {
                let prefix = container
                    .as_deref()
                    .map(|c| format!("//{c}"))
                    .unwrap_or_default();
                (
                    "xpath",
                    format!("{prefix}//{tag}[contains(text(), {})]", xpath_literal(text)),
                )
            }
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css(selector) => write!(f, "css `{selector}`"),
            Locator::XPath(expr) => write!(f, "xpath `{expr}`"),
            Locator::Text { text, .. } => write!(f, "text `{text}`"),
        }
    }
}

fn xpath_literal(text: &str) -> String {
    if !text.contains('\'') {
        format!("'{text}'")
    } else if !text.contains('"') {
        format!("\"{text}\"")
    } else {
        let parts: Vec<String> = text.split('\'').map(|p| format!("'{p}'")).collect();
        format!("concat({})", parts.join(", \"'\", "))
    }
}

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("browser command {command} failed: {error}: {message}")]
    Protocol {
        command: String,
        error: String,
        message: String,
    },
    #[error("browser session error: {0}")]
    Session(String),
}

/// Primitive browser operations the orchestrator is written against.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Route downloads for this session into `dir`.
    async fn set_download_dir(&self, dir: &Path) -> Result<(), BrowserError>;
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;
    async fn current_url(&self) -> Result<String, BrowserError>;
    /// `Ok(None)` when nothing matches.
    async fn locate(
        &self,
        scope: Option<&ElementHandle>,
        locator: &Locator,
    ) -> Result<Option<ElementHandle>, BrowserError>;
    async fn click(&self, element: &ElementHandle) -> Result<(), BrowserError>;
    async fn type_text(&self, element: &ElementHandle, text: &str) -> Result<(), BrowserError>;
    async fn read_property(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, BrowserError>;
    async fn close(&self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, BrowserError>;
}

/// Lookup key for a stored portal secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialKey {
    pub account: String,
    pub service: String,
    pub kind: String,
}

impl CredentialKey {
    pub fn internet(account: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            service: service.into(),
            kind: "internet".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no {kind} password stored for {account}@{service}")]
    NotFound {
        account: String,
        service: String,
        kind: String,
    },
    #[error("credential helper failed: {0}")]
    Helper(String),
    #[error("running credential helper: {0}")]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn secret(&self, key: &CredentialKey) -> Result<String, CredentialError>;
}

/// A secret handed in by the process environment.
#[derive(Clone)]
pub struct StaticCredentialStore {
    secret: Option<String>,
}

impl StaticCredentialStore {
    pub fn new(secret: Option<String>) -> Self {
        Self { secret }
    }
}

impl fmt::Debug for StaticCredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentialStore")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn secret(&self, key: &CredentialKey) -> Result<String, CredentialError> {
        self.secret.clone().ok_or_else(|| CredentialError::NotFound {
            account: key.account.clone(),
            service: key.service.clone(),
            kind: key.kind.clone(),
        })
    }
}

/// macOS keychain lookup through the `security` tool.
#[derive(Debug, Clone, Default)]
pub struct KeychainCredentialStore;

#[async_trait]
impl CredentialStore for KeychainCredentialStore {
    async fn secret(&self, key: &CredentialKey) -> Result<String, CredentialError> {
        let subcommand = match key.kind.as_str() {
            "internet" => "find-internet-password",
            _ => "find-generic-password",
        };
        let output = Command::new("security")
            .args([subcommand, "-a", &key.account, "-s", &key.service, "-w"])
            .output()
            .await?;

        if !output.status.success() {
            // exit status 44: item not found
            if output.status.code() == Some(44) {
                return Err(CredentialError::NotFound {
                    account: key.account.clone(),
                    service: key.service.clone(),
                    kind: key.kind.clone(),
                });
            }
            return Err(CredentialError::Helper(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let secret = String::from_utf8_lossy(&output.stdout)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        Ok(secret)
    }
}

/// Receiving side of a cancellation request.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Sending side of a cancellation request.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; pends forever if the handle is dropped first.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` polls until the file shows up or the caller cancels.
    pub deadline: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            deadline: Some(Duration::from_secs(600)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Init,
    Authenticating,
    Authenticated,
    Navigating,
    LinkLocated,
    DownloadTriggered,
    Polling,
    Completed,
    Failed,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("login form not found at {0}")]
    AuthFormNotFound(String),
    #[error("no navigation after login within {0:?}")]
    AuthTimeout(Duration),
    #[error("link not found: {0}")]
    LinkNotFound(String),
    #[error("download link has no usable target: {0:?}")]
    InvalidDownloadTarget(Option<String>),
    #[error("{path} did not appear within {waited:?}")]
    Timeout { path: PathBuf, waited: Duration },
    #[error("download cancelled")]
    Cancelled,
    #[error("filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Browser(#[from] BrowserError),
}

/// Wait for `path` to exist. Any error other than "not found" aborts.
pub async fn wait_for_file(
    path: &Path,
    policy: PollPolicy,
    cancel: &mut CancelSignal,
) -> Result<(), DownloadError> {
    let started = Instant::now();
    loop {
        match fs::metadata(path).await {
            Ok(_) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(DownloadError::Filesystem {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        let waited = started.elapsed();
        if let Some(deadline) = policy.deadline {
            if waited >= deadline {
                return Err(DownloadError::Timeout {
                    path: path.to_path_buf(),
                    waited,
                });
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(policy.interval) => {}
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        }
    }
}

/// Base file name (no directory, no extension) the browser will save `href` under.
pub fn predicted_base_name(href: &str) -> Option<String> {
    let path = match Url::parse(href) {
        Ok(url) => url.path().to_string(),
        Err(_) => href.split(['?', '#']).next().unwrap_or(href).to_string(),
    };
    let last = path.rsplit('/').find(|segment| !segment.is_empty())?;
    Path::new(last)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .map(str::to_owned)
}

#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub base_url: String,
    pub username: String,
    /// Deep-link path of the donor list view, e.g. `/project/foo/dashboard`.
    pub page_path: String,
    pub login_path: String,
    pub nav_link_text: String,
    pub download_link_text: String,
    pub auth_timeout: Duration,
    pub element_timeout: Duration,
    pub probe_interval: Duration,
    pub poll: PollPolicy,
}

impl PortalConfig {
    pub fn new(username: impl Into<String>, page_path: impl Into<String>) -> Self {
        Self {
            base_url: PORTAL_BASE_URL.to_string(),
            username: username.into(),
            page_path: page_path.into(),
            login_path: "/user".to_string(),
            nav_link_text: "Donor List Detail".to_string(),
            download_link_text: "Download donor list".to_string(),
            auth_timeout: Duration::from_secs(60),
            element_timeout: Duration::from_secs(30),
            probe_interval: Duration::from_millis(250),
            poll: PollPolicy::default(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Credential-store service name: the portal host.
    pub fn credential_service(&self) -> String {
        Url::parse(&self.base_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_owned))
            .unwrap_or_else(|| self.base_url.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedArtifact {
    /// File name without directory or extension, as predicted from the download link.
    pub base_name: String,
    pub path: PathBuf,
    pub transitions: Vec<DownloadState>,
}

/// Produces a freshly downloaded export in `download_dir`.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn fetch(
        &self,
        download_dir: &Path,
        cancel: CancelSignal,
    ) -> Result<DownloadedArtifact, DownloadError>;
}

#[derive(Debug, Default)]
struct StateTrail {
    states: Vec<DownloadState>,
}

impl StateTrail {
    fn enter(&mut self, state: DownloadState) {
        info!(?state, "portal download state");
        self.states.push(state);
    }
}

/// Browser-driven download of the donor list export.
pub struct PortalDownloader {
    config: PortalConfig,
    launcher: Arc<dyn BrowserLauncher>,
    credentials: Arc<dyn CredentialStore>,
}

impl PortalDownloader {
    pub fn new(
        config: PortalConfig,
        launcher: Arc<dyn BrowserLauncher>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            config,
            launcher,
            credentials,
        }
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    async fn drive(
        &self,
        session: &dyn BrowserSession,
        download_dir: &Path,
        cancel: &mut CancelSignal,
        trail: &mut StateTrail,
    ) -> Result<DownloadedArtifact, DownloadError> {
        trail.enter(DownloadState::Authenticating);
        let key = CredentialKey::internet(&self.config.username, self.config.credential_service());
        let password = self.credentials.secret(&key).await?;

        fs::create_dir_all(download_dir)
            .await
            .map_err(|source| DownloadError::Filesystem {
                path: download_dir.to_path_buf(),
                source,
            })?;
        let download_dir =
            fs::canonicalize(download_dir)
                .await
                .map_err(|source| DownloadError::Filesystem {
                    path: download_dir.to_path_buf(),
                    source,
                })?;
        session.set_download_dir(&download_dir).await?;

        self.authenticate(session, &password).await?;
        trail.enter(DownloadState::Authenticated);

        trail.enter(DownloadState::Navigating);
        session.navigate(&self.config.url(&self.config.page_path)).await?;
        let nav_link = Locator::link_text(&self.config.nav_link_text).within("nav");
        let link = session
            .locate(None, &nav_link)
            .await?
            .ok_or_else(|| DownloadError::LinkNotFound(self.config.nav_link_text.clone()))?;
        trail.enter(DownloadState::LinkLocated);
        session.click(&link).await?;

        let download_link = Locator::link_text(&self.config.download_link_text);
        let button = self
            .wait_for_element(session, &download_link, self.config.element_timeout)
            .await?
            .ok_or_else(|| DownloadError::LinkNotFound(self.config.download_link_text.clone()))?;
        let href = session.read_property(&button, "href").await?;
        let base_name = href
            .as_deref()
            .and_then(predicted_base_name)
            .ok_or_else(|| DownloadError::InvalidDownloadTarget(href.clone()))?;
        session.click(&button).await?;
        trail.enter(DownloadState::DownloadTriggered);

        let path = download_dir.join(format!("{base_name}.csv"));
        trail.enter(DownloadState::Polling);
        wait_for_file(&path, self.config.poll, cancel).await?;
        info!(path = %path.display(), "download succeeded");
        trail.enter(DownloadState::Completed);

        Ok(DownloadedArtifact {
            base_name,
            path,
            transitions: std::mem::take(&mut trail.states),
        })
    }

    async fn authenticate(
        &self,
        session: &dyn BrowserSession,
        password: &str,
    ) -> Result<(), DownloadError> {
        let login_url = self.config.url(&self.config.login_path);
        session.navigate(&login_url).await?;

        let form_missing = || DownloadError::AuthFormNotFound(login_url.clone());
        let form = session
            .locate(None, &Locator::css("#user-login"))
            .await?
            .ok_or_else(form_missing)?;
        let username = session
            .locate(Some(&form), &Locator::css("#edit-name"))
            .await?
            .ok_or_else(form_missing)?;
        let secret = session
            .locate(Some(&form), &Locator::css("#edit-pass"))
            .await?
            .ok_or_else(form_missing)?;
        let submit = session
            .locate(Some(&form), &Locator::css("#edit-submit"))
            .await?
            .ok_or_else(form_missing)?;

        session.type_text(&username, &self.config.username).await?;
        session.type_text(&secret, password).await?;
        let landed = session.current_url().await?;
        session.click(&submit).await?;

        let started = Instant::now();
        loop {
            let url = session.current_url().await?;
            if url != landed {
                debug!(%url, "signed in");
                return Ok(());
            }
            if started.elapsed() >= self.config.auth_timeout {
                return Err(DownloadError::AuthTimeout(self.config.auth_timeout));
            }
            tokio::time::sleep(self.config.probe_interval).await;
        }
    }

    async fn wait_for_element(
        &self,
        session: &dyn BrowserSession,
        locator: &Locator,
        timeout: Duration,
    ) -> Result<Option<ElementHandle>, DownloadError> {
        let started = Instant::now();
        loop {
            if let Some(element) = session.locate(None, locator).await? {
                return Ok(Some(element));
            }
            if started.elapsed() >= timeout {
                debug!(%locator, "gave up waiting for element");
                return Ok(None);
            }
            tokio::time::sleep(self.config.probe_interval).await;
        }
    }
}

#[async_trait]
impl ArtifactSource for PortalDownloader {
    async fn fetch(
        &self,
        download_dir: &Path,
        mut cancel: CancelSignal,
    ) -> Result<DownloadedArtifact, DownloadError> {
        let mut trail = StateTrail::default();
        trail.enter(DownloadState::Init);

        let session = self.launcher.launch().await?;
        let result = self
            .drive(session.as_ref(), download_dir, &mut cancel, &mut trail)
            .await;
        if let Err(err) = session.close().await {
            warn!(error = %err, "closing browser session failed");
        }

        if let Err(err) = &result {
            trail.enter(DownloadState::Failed);
            warn!(error = %err, states = ?trail.states, "portal download failed");
        }
        result
    }
}
