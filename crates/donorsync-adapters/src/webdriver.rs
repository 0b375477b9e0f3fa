//! [`BrowserSession`] over the W3C WebDriver wire protocol (chromedriver).

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::debug;

use crate::{BrowserError, BrowserLauncher, BrowserSession, ElementHandle, Locator};

/// Key under which WebDriver returns element references.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    /// Base URL of a running driver, e.g. `http://localhost:9515`.
    pub endpoint: String,
    pub headless: bool,
    pub browser_args: Vec<String>,
    pub request_timeout: Duration,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9515".to_string(),
            headless: true,
            browser_args: vec!["--no-sandbox".to_string()],
            request_timeout: Duration::from_secs(90),
        }
    }
}

impl WebDriverConfig {
    fn capabilities(&self) -> Value {
        let mut args = self.browser_args.clone();
        if self.headless && !args.iter().any(|a| a.starts_with("--headless")) {
            args.push("--headless=new".to_string());
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": args },
                }
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct WebDriverLauncher {
    client: reqwest::Client,
    config: WebDriverConfig,
}

impl WebDriverLauncher {
    pub fn new(config: WebDriverConfig) -> Result<Self, BrowserError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl BrowserLauncher for WebDriverLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let endpoint = self.config.endpoint.trim_end_matches('/');
        let value = send(
            &self.client,
            Method::POST,
            &format!("{endpoint}/session"),
            Some(self.config.capabilities()),
        )
        .await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| BrowserError::Session("driver returned no sessionId".to_string()))?;
        debug!(session_id, "webdriver session started");
        Ok(Box::new(WebDriverSession {
            client: self.client.clone(),
            session_url: format!("{endpoint}/session/{session_id}"),
        }))
    }
}

#[derive(Debug)]
pub struct WebDriverSession {
    client: reqwest::Client,
    session_url: String,
}

impl WebDriverSession {
    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, BrowserError> {
        send(
            &self.client,
            method,
            &format!("{}{path}", self.session_url),
            body,
        )
        .await
    }
}

async fn send(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> Result<Value, BrowserError> {
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request.send().await?;
    let status = response.status();
    let payload: Value = response.json().await?;
    let value = payload.get("value").cloned().unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(value);
    }
    Err(protocol_error(url, &value))
}

fn protocol_error(url: &str, value: &Value) -> BrowserError {
    BrowserError::Protocol {
        command: url.to_string(),
        error: value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string(),
        message: value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

fn element_from_value(value: &Value) -> Option<ElementHandle> {
    value
        .get(ELEMENT_KEY)
        .and_then(Value::as_str)
        .map(|id| ElementHandle(id.to_string()))
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn set_download_dir(&self, dir: &Path) -> Result<(), BrowserError> {
        self.command(
            Method::POST,
            "/goog/cdp/execute",
            Some(json!({
                "cmd": "Browser.setDownloadBehavior",
                "params": { "behavior": "allow", "downloadPath": dir.display().to_string() },
            })),
        )
        .await
        .map(|_| ())
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.command(Method::POST, "/url", Some(json!({ "url": url })))
            .await
            .map(|_| ())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        let value = self.command(Method::GET, "/url", None).await?;
        value
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| BrowserError::Session("current url was not a string".to_string()))
    }

    async fn locate(
        &self,
        scope: Option<&ElementHandle>,
        locator: &Locator,
    ) -> Result<Option<ElementHandle>, BrowserError> {
        let (using, criteria) = locator.strategy();
        let path = match scope {
            Some(parent) => format!("/element/{}/element", parent.0),
            None => "/element".to_string(),
        };
        match self
            .command(
                Method::POST,
                &path,
                Some(json!({ "using": using, "value": criteria })),
            )
            .await
        {
            Ok(value) => Ok(element_from_value(&value)),
            Err(BrowserError::Protocol { error, .. }) if error == "no such element" => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn click(&self, element: &ElementHandle) -> Result<(), BrowserError> {
        self.command(
            Method::POST,
            &format!("/element/{}/click", element.0),
            Some(json!({})),
        )
        .await
        .map(|_| ())
    }

    async fn type_text(&self, element: &ElementHandle, text: &str) -> Result<(), BrowserError> {
        self.command(
            Method::POST,
            &format!("/element/{}/value", element.0),
            Some(json!({ "text": text })),
        )
        .await
        .map(|_| ())
    }

    async fn read_property(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, BrowserError> {
        let value = self
            .command(
                Method::GET,
                &format!("/element/{}/property/{name}", element.0),
                None,
            )
            .await?;
        Ok(value.as_str().map(str::to_owned))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.command(Method::DELETE, "", None).await.map(|_| ())
    }
}
