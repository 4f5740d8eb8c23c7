//! [`RenderEngine`] over the W3C WebDriver protocol (chromedriver driving headless Chrome).
//!
//! Each launch creates a new WebDriver session, which chromedriver backs with
//! a fresh browser process and profile, so sessions share no cookies, storage
//! or cache.

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use reqwest::{Client, Method, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use crate::application::screenshot::{
    ConsoleMessage, EngineError, NetworkIdle, RenderEngine, RenderSession, Viewport,
};
use crate::config::RendererSettings;

use super::error::InfraError;

const SOURCE: &str = "infra::webdriver";

const CONSOLE_HOOK: &str = r#"
if (!window.__cardshotConsole) {
  window.__cardshotConsole = [];
  ['log', 'info', 'warn', 'error', 'debug'].forEach(function (level) {
    var original = console[level];
    console[level] = function () {
      try {
        var text = Array.prototype.map.call(arguments, function (part) {
          if (typeof part === 'string') { return part; }
          try { return JSON.stringify(part); } catch (e) { return String(part); }
        }).join(' ');
        window.__cardshotConsole.push({ level: level, text: text });
      } catch (e) {}
      return original.apply(console, arguments);
    };
  });
}
"#;
const CONSOLE_DRAIN: &str = "return (window.__cardshotConsole || []).splice(0);";
const NETWORK_PROBE: &str =
    "return [document.readyState, performance.getEntriesByType('resource').length];";

#[derive(Debug, Error)]
enum WireError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("{error}: {message}")]
    Remote { error: String, message: String },
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl WireError {
    fn into_engine(self, remote: impl FnOnce(String) -> EngineError) -> EngineError {
        match self {
            WireError::Remote { error, .. } if error == "invalid session id" => EngineError::Closed,
            err @ WireError::Remote { .. } => remote(err.to_string()),
            other => EngineError::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    value: Value,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    error: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewSession {
    session_id: String,
}

#[derive(Debug)]
struct DriverConfig {
    endpoint: Url,
    browser_binary: Option<PathBuf>,
    browser_args: Vec<String>,
    wait_timeout: Duration,
    poll_interval: Duration,
}

#[derive(Debug, Clone)]
struct Driver {
    client: Client,
    config: Arc<DriverConfig>,
}

impl Driver {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, WireError> {
        let url = self.config.endpoint.join(path)?;
        let mut req = self.client.request(method, url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await?;
        Self::handle(resp).await
    }

    async fn handle(resp: Response) -> Result<Value, WireError> {
        let status = resp.status();
        let text = resp.text().await?;
        let envelope: Envelope = serde_json::from_str(&text)
            .map_err(|err| WireError::Decode(format!("status {status}: {err}")))?;

        if status.is_success() {
            return Ok(envelope.value);
        }

        match serde_json::from_value::<RemoteError>(envelope.value) {
            Ok(remote) => Err(WireError::Remote {
                error: remote.error,
                message: remote.message,
            }),
            Err(_) => Err(WireError::Decode(format!("status {status} body {text}"))),
        }
    }
}

/// Launches one headless Chrome session per render through a WebDriver endpoint.
#[derive(Debug, Clone)]
pub struct WebDriverEngine {
    driver: Driver,
}

impl WebDriverEngine {
    pub fn new(settings: &RendererSettings) -> Result<Self, InfraError> {
        // Navigation may block for the whole page-load timeout before replying.
        let client = Client::builder()
            .user_agent(concat!("cardshot/", env!("CARGO_PKG_VERSION")))
            .timeout(settings.wait_timeout * 2)
            .build()
            .map_err(|err| InfraError::engine(format!("failed to build WebDriver client: {err}")))?;

        Ok(Self {
            driver: Driver {
                client,
                config: Arc::new(DriverConfig {
                    endpoint: settings.webdriver_url.clone(),
                    browser_binary: settings.browser_binary.clone(),
                    browser_args: settings.browser_args.clone(),
                    wait_timeout: settings.wait_timeout,
                    poll_interval: settings.poll_interval,
                }),
            },
        })
    }

    fn capabilities(&self, viewport: Viewport) -> Value {
        let config = &self.driver.config;
        let mut args = config.browser_args.clone();
        args.push(format!("--window-size={},{}", viewport.width, viewport.height));

        let mut chrome_options = json!({ "args": args });
        if let Some(binary) = config.browser_binary.as_ref() {
            chrome_options["binary"] = Value::String(binary.display().to_string());
        }

        let timeout_ms = config.wait_timeout.as_millis() as u64;
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "pageLoadStrategy": "normal",
                    "timeouts": { "pageLoad": timeout_ms, "script": timeout_ms },
                    "goog:chromeOptions": chrome_options,
                }
            }
        })
    }
}

#[async_trait]
impl RenderEngine for WebDriverEngine {
    async fn launch(&self, viewport: Viewport) -> Result<Box<dyn RenderSession>, EngineError> {
        let value = self
            .driver
            .request(Method::POST, "session", Some(self.capabilities(viewport)))
            .await
            .map_err(|err| EngineError::Launch(err.to_string()))?;
        let session: NewSession = serde_json::from_value(value)
            .map_err(|err| EngineError::Launch(format!("malformed new session reply: {err}")))?;

        debug!(
            target = SOURCE,
            op = "launch",
            session_id = %session.session_id,
            "WebDriver session created"
        );

        Ok(Box::new(WebDriverSession {
            driver: self.driver.clone(),
            id: session.session_id,
            closed: false,
        }))
    }
}

pub struct WebDriverSession {
    driver: Driver,
    id: String,
    closed: bool,
}

impl WebDriverSession {
    fn path(&self, command: &str) -> String {
        format!("session/{}/{command}", self.id)
    }

    async fn execute(&self, script: &str, args: Vec<Value>) -> Result<Value, WireError> {
        self.driver
            .request(
                Method::POST,
                &self.path("execute/sync"),
                Some(json!({ "script": script, "args": args })),
            )
            .await
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    /// WebDriver exposes no request counter, so completed resource fetches
    /// stand in for it: the page counts as mostly idle once loading is
    /// complete and no more than `max_inflight` fetches finished within the
    /// last `quiet` window.
    async fn await_network_idle(&self, url: &Url, idle: NetworkIdle) -> Result<(), EngineError> {
        let config = &self.driver.config;
        let started = Instant::now();
        let mut baseline: Option<(Instant, u64)> = None;

        loop {
            let probe = self
                .execute(NETWORK_PROBE, Vec::new())
                .await
                .map_err(|err| {
                    err.into_engine(|message| EngineError::Navigation {
                        url: url.to_string(),
                        message,
                    })
                })?;
            let ready = probe.get(0).and_then(Value::as_str) == Some("complete");
            let fetched = probe.get(1).and_then(Value::as_u64).unwrap_or(0);
            let now = Instant::now();

            match baseline {
                Some((since, count))
                    if ready && fetched.saturating_sub(count) <= u64::from(idle.max_inflight) =>
                {
                    if now.duration_since(since) >= idle.quiet {
                        return Ok(());
                    }
                }
                _ => baseline = ready.then_some((now, fetched)),
            }

            if now.duration_since(started) >= config.wait_timeout {
                return Err(EngineError::Timeout {
                    condition: "network idle".to_string(),
                    waited: config.wait_timeout,
                });
            }
            tokio::time::sleep(config.poll_interval).await;
        }
    }
}

#[async_trait]
impl RenderSession for WebDriverSession {
    async fn navigate(&mut self, url: &Url, idle: NetworkIdle) -> Result<(), EngineError> {
        self.ensure_open()?;
        let navigation_error = |message: String| EngineError::Navigation {
            url: url.to_string(),
            message,
        };

        self.driver
            .request(
                Method::POST,
                &self.path("url"),
                Some(json!({ "url": url.as_str() })),
            )
            .await
            .map_err(|err| err.into_engine(navigation_error))?;

        self.execute(CONSOLE_HOOK, Vec::new())
            .await
            .map_err(|err| err.into_engine(navigation_error))?;

        self.await_network_idle(url, idle).await
    }

    async fn evaluate(&mut self, script: &str, args: Vec<Value>) -> Result<Value, EngineError> {
        self.ensure_open()?;
        self.execute(script, args)
            .await
            .map_err(|err| err.into_engine(EngineError::Script))
    }

    async fn wait_for(&mut self, condition: &str) -> Result<(), EngineError> {
        self.ensure_open()?;
        let config = self.driver.config.clone();
        let script = format!("return Boolean({condition});");
        let started = Instant::now();

        loop {
            let value = self
                .execute(&script, Vec::new())
                .await
                .map_err(|err| err.into_engine(EngineError::Script))?;
            if value.as_bool() == Some(true) {
                return Ok(());
            }
            if started.elapsed() >= config.wait_timeout {
                return Err(EngineError::Timeout {
                    condition: condition.to_string(),
                    waited: config.wait_timeout,
                });
            }
            tokio::time::sleep(config.poll_interval).await;
        }
    }

    async fn screenshot(&mut self) -> Result<Bytes, EngineError> {
        self.ensure_open()?;
        let value = self
            .driver
            .request(Method::GET, &self.path("screenshot"), None)
            .await
            .map_err(|err| err.into_engine(EngineError::Capture))?;
        let encoded = value
            .as_str()
            .ok_or_else(|| EngineError::Capture("screenshot reply is not a string".to_string()))?;
        let png = STANDARD
            .decode(encoded)
            .map_err(|err| EngineError::Capture(format!("invalid base64 screenshot: {err}")))?;
        Ok(Bytes::from(png))
    }

    async fn take_console(&mut self) -> Vec<ConsoleMessage> {
        if self.closed {
            return Vec::new();
        }
        match self.execute(CONSOLE_DRAIN, Vec::new()).await {
            Ok(value) => parse_console(&value),
            Err(err) => {
                debug!(
                    target = SOURCE,
                    op = "take_console",
                    session_id = %self.id,
                    error = %err,
                    "Failed to drain page console"
                );
                Vec::new()
            }
        }
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Ok(());
        }
        let result = self
            .driver
            .request(Method::DELETE, &format!("session/{}", self.id), None)
            .await;
        self.closed = true;
        debug!(
            target = SOURCE,
            op = "close",
            session_id = %self.id,
            ok = result.is_ok(),
            "WebDriver session closed"
        );
        match result {
            Ok(_) => Ok(()),
            Err(err) => match err.into_engine(EngineError::Transport) {
                EngineError::Closed => Ok(()),
                other => Err(other),
            },
        }
    }
}

fn parse_console(value: &Value) -> Vec<ConsoleMessage> {
    value
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    Some(ConsoleMessage {
                        level: entry.get("level")?.as_str()?.to_string(),
                        text: entry.get("text")?.as_str()?.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}
