//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::SocketAddr,
    num::NonZeroU32,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::application::screenshot::{
    CachePolicy, CaptureSettings, DeployTag, NetworkIdle, PIPELINE_VERSION, RenderHost, Viewport,
};

pub use cli::{
    CliArgs, Command, FingerprintArgs, PipelineOverrides, RenderArgs, ServeArgs, ServeOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "cardshot";
const ENV_PREFIX: &str = "CARDSHOT";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 4;
const DEFAULT_DEPLOY_TAG: &str = "deploy-unset";
const DEFAULT_SETTLE_MS: u64 = 1000;
const DEFAULT_VIEWPORT_WIDTH: u32 = 1330;
const DEFAULT_VIEWPORT_HEIGHT: u32 = 768;
const DEFAULT_WEBDRIVER_URL: &str = "http://127.0.0.1:9515/";
const DEFAULT_RENDER_HOST_URL: &str = "http://localhost:8081/";
const DEFAULT_CARD_PATH: &str = "basic-card";
const DEFAULT_INJECT_HOOK: &str = "injectFetchedCard";
const DEFAULT_RENDERED_FLAG: &str = "cardRendered";
const DEFAULT_BROWSER_ARGS: [&str; 3] = ["--headless=new", "--no-sandbox", "--hide-scrollbars"];
const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_NETWORK_IDLE_QUIET_MS: u64 = 500;
const DEFAULT_NETWORK_IDLE_MAX_INFLIGHT: u32 = 2;
const DEFAULT_STORAGE_DIR: &str = "var/cardshot";
const DEFAULT_S3_REGION: &str = "us-east-1";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cards: CardSource,
    pub screenshot: ScreenshotSettings,
    pub renderer: RendererSettings,
    pub storage: StorageBackend,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Where card records are read from.
#[derive(Debug, Clone)]
pub enum CardSource {
    Postgres {
        url: Option<String>,
        max_connections: NonZeroU32,
    },
    Fixtures {
        path: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct ScreenshotSettings {
    pub pipeline_version: u32,
    pub deploy_tag: DeployTag,
    /// Re-render and re-store even when a snapshot already exists.
    pub bypass_cache: bool,
    pub single_flight: bool,
    pub settle: Duration,
    pub viewport: Viewport,
}

impl ScreenshotSettings {
    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            bypass_reads: self.bypass_cache,
            single_flight: self.single_flight,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub webdriver_url: Url,
    pub host_url: Url,
    pub card_path: String,
    pub inject_hook: String,
    pub rendered_flag: String,
    pub browser_binary: Option<PathBuf>,
    pub browser_args: Vec<String>,
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
    pub network_idle: NetworkIdle,
}

impl RendererSettings {
    pub fn render_host(&self) -> RenderHost {
        RenderHost {
            base_url: self.host_url.clone(),
            card_path: self.card_path.clone(),
            inject_hook: self.inject_hook.clone(),
            rendered_flag: self.rendered_flag.clone(),
        }
    }

    pub fn capture_settings(&self, screenshot: &ScreenshotSettings) -> CaptureSettings {
        CaptureSettings {
            viewport: screenshot.viewport,
            network_idle: self.network_idle,
            settle: screenshot.settle,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StorageBackend {
    Filesystem { directory: PathBuf },
    S3(S3Settings),
    Memory,
}

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub allow_http: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("renderer.browser_args")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Render(args)) => raw.apply_pipeline_overrides(&args.overrides),
        Some(Command::Fingerprint(args)) => raw.apply_pipeline_overrides(&args.overrides),
        Some(Command::DeployTag) => {}
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cards: RawCardsSettings,
    screenshot: RawScreenshotSettings,
    renderer: RawRendererSettings,
    storage: RawStorageSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }

        self.apply_pipeline_overrides(&overrides.pipeline);
    }

    fn apply_pipeline_overrides(&mut self, overrides: &PipelineOverrides) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.cards.database_url = Some(url.clone());
        }
        if let Some(path) = overrides.fixtures_path.as_ref() {
            self.cards.source = Some("fixtures".to_string());
            self.cards.fixtures_path = Some(path.clone());
        }
        if let Some(tag) = overrides.deploy_tag.as_ref() {
            self.screenshot.deploy_tag = Some(tag.clone());
        }
        if let Some(bypass) = overrides.bypass_cache {
            self.screenshot.bypass_cache = Some(bypass);
        }
        if let Some(url) = overrides.webdriver_url.as_ref() {
            self.renderer.webdriver_url = Some(url.clone());
        }
        if let Some(url) = overrides.render_host_url.as_ref() {
            self.renderer.host_url = Some(url.clone());
        }
        if let Some(directory) = overrides.storage_directory.as_ref() {
            self.storage.directory = Some(directory.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cards,
            screenshot,
            renderer,
            storage,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            cards: build_card_source(cards)?,
            screenshot: build_screenshot_settings(screenshot)?,
            renderer: build_renderer_settings(renderer)?,
            storage: build_storage_backend(storage)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_card_source(cards: RawCardsSettings) -> Result<CardSource, LoadError> {
    let source = cards
        .source
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "postgres".to_string());

    match source.as_str() {
        "postgres" => {
            let url = cards.database_url.and_then(non_blank);
            let max = cards
                .max_connections
                .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
            Ok(CardSource::Postgres {
                url,
                max_connections: non_zero_u32(max.into(), "cards.max_connections")?,
            })
        }
        "fixtures" => {
            let path = cards
                .fixtures_path
                .filter(|path| !path.as_os_str().is_empty())
                .ok_or_else(|| {
                    LoadError::invalid(
                        "cards.fixtures_path",
                        "required when cards.source is `fixtures`",
                    )
                })?;
            Ok(CardSource::Fixtures { path })
        }
        other => Err(LoadError::invalid(
            "cards.source",
            format!("unknown card source `{other}` (expected postgres or fixtures)"),
        )),
    }
}

fn build_screenshot_settings(
    screenshot: RawScreenshotSettings,
) -> Result<ScreenshotSettings, LoadError> {
    let pipeline_version = screenshot.pipeline_version.unwrap_or(PIPELINE_VERSION);

    let tag = screenshot
        .deploy_tag
        .unwrap_or_else(|| DEFAULT_DEPLOY_TAG.to_string());
    let deploy_tag = DeployTag::parse(tag.trim())
        .map_err(|err| LoadError::invalid("screenshot.deploy_tag", err.to_string()))?;

    let width = screenshot.viewport_width.unwrap_or(DEFAULT_VIEWPORT_WIDTH);
    if width == 0 {
        return Err(LoadError::invalid(
            "screenshot.viewport_width",
            "must be greater than zero",
        ));
    }
    let height = screenshot.viewport_height.unwrap_or(DEFAULT_VIEWPORT_HEIGHT);
    if height == 0 {
        return Err(LoadError::invalid(
            "screenshot.viewport_height",
            "must be greater than zero",
        ));
    }

    Ok(ScreenshotSettings {
        pipeline_version,
        deploy_tag,
        bypass_cache: screenshot.bypass_cache.unwrap_or(false),
        single_flight: screenshot.single_flight.unwrap_or(true),
        settle: Duration::from_millis(screenshot.settle_ms.unwrap_or(DEFAULT_SETTLE_MS)),
        viewport: Viewport { width, height },
    })
}

fn build_renderer_settings(renderer: RawRendererSettings) -> Result<RendererSettings, LoadError> {
    let webdriver_url = parse_base_url(
        renderer.webdriver_url.as_deref().unwrap_or(DEFAULT_WEBDRIVER_URL),
        "renderer.webdriver_url",
    )?;
    let host_url = parse_base_url(
        renderer.host_url.as_deref().unwrap_or(DEFAULT_RENDER_HOST_URL),
        "renderer.host_url",
    )?;

    let card_path = renderer
        .card_path
        .unwrap_or_else(|| DEFAULT_CARD_PATH.to_string());
    let inject_hook = required_identifier(
        renderer.inject_hook,
        DEFAULT_INJECT_HOOK,
        "renderer.inject_hook",
    )?;
    let rendered_flag = required_identifier(
        renderer.rendered_flag,
        DEFAULT_RENDERED_FLAG,
        "renderer.rendered_flag",
    )?;

    let browser_args = renderer.browser_args.unwrap_or_else(|| {
        DEFAULT_BROWSER_ARGS
            .iter()
            .map(|arg| arg.to_string())
            .collect()
    });

    let wait_secs = renderer
        .wait_timeout_seconds
        .unwrap_or(DEFAULT_WAIT_TIMEOUT_SECS);
    if wait_secs == 0 {
        return Err(LoadError::invalid(
            "renderer.wait_timeout_seconds",
            "must be greater than zero",
        ));
    }
    let poll_ms = renderer.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
    if poll_ms == 0 {
        return Err(LoadError::invalid(
            "renderer.poll_interval_ms",
            "must be greater than zero",
        ));
    }

    let network_idle = NetworkIdle {
        max_inflight: renderer
            .network_idle_max_inflight
            .unwrap_or(DEFAULT_NETWORK_IDLE_MAX_INFLIGHT),
        quiet: Duration::from_millis(
            renderer
                .network_idle_quiet_ms
                .unwrap_or(DEFAULT_NETWORK_IDLE_QUIET_MS),
        ),
    };

    Ok(RendererSettings {
        webdriver_url,
        host_url,
        card_path,
        inject_hook,
        rendered_flag,
        browser_binary: renderer
            .browser_binary
            .filter(|path| !path.as_os_str().is_empty()),
        browser_args,
        wait_timeout: Duration::from_secs(wait_secs),
        poll_interval: Duration::from_millis(poll_ms),
        network_idle,
    })
}

fn build_storage_backend(storage: RawStorageSettings) -> Result<StorageBackend, LoadError> {
    let backend = storage
        .backend
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "filesystem".to_string());

    match backend.as_str() {
        "filesystem" => {
            let directory = storage
                .directory
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR));
            if directory.as_os_str().is_empty() {
                return Err(LoadError::invalid(
                    "storage.directory",
                    "path must not be empty",
                ));
            }
            Ok(StorageBackend::Filesystem { directory })
        }
        "s3" => {
            let bucket = storage.s3_bucket.and_then(non_blank).ok_or_else(|| {
                LoadError::invalid("storage.s3_bucket", "required when storage.backend is `s3`")
            })?;
            let endpoint = storage.s3_endpoint.and_then(non_blank).ok_or_else(|| {
                LoadError::invalid(
                    "storage.s3_endpoint",
                    "required when storage.backend is `s3`",
                )
            })?;
            Ok(StorageBackend::S3(S3Settings {
                endpoint,
                bucket,
                region: storage
                    .s3_region
                    .and_then(non_blank)
                    .unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
                access_key_id: storage.s3_access_key_id.and_then(non_blank),
                secret_access_key: storage.s3_secret_access_key.and_then(non_blank),
                allow_http: storage.s3_allow_http.unwrap_or(false),
            }))
        }
        "memory" => Ok(StorageBackend::Memory),
        other => Err(LoadError::invalid(
            "storage.backend",
            format!("unknown storage backend `{other}` (expected filesystem, s3 or memory)"),
        )),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCardsSettings {
    source: Option<String>,
    database_url: Option<String>,
    max_connections: Option<u32>,
    fixtures_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawScreenshotSettings {
    pipeline_version: Option<u32>,
    deploy_tag: Option<String>,
    bypass_cache: Option<bool>,
    single_flight: Option<bool>,
    settle_ms: Option<u64>,
    viewport_width: Option<u32>,
    viewport_height: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRendererSettings {
    webdriver_url: Option<String>,
    host_url: Option<String>,
    card_path: Option<String>,
    inject_hook: Option<String>,
    rendered_flag: Option<String>,
    browser_binary: Option<PathBuf>,
    browser_args: Option<Vec<String>>,
    wait_timeout_seconds: Option<u64>,
    poll_interval_ms: Option<u64>,
    network_idle_quiet_ms: Option<u64>,
    network_idle_max_inflight: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStorageSettings {
    backend: Option<String>,
    directory: Option<PathBuf>,
    s3_endpoint: Option<String>,
    s3_bucket: Option<String>,
    s3_region: Option<String>,
    s3_access_key_id: Option<String>,
    s3_secret_access_key: Option<String>,
    s3_allow_http: Option<bool>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

/// Parse a URL that relative paths are joined onto; the path always ends in `/`.
fn parse_base_url(value: &str, key: &'static str) -> Result<Url, LoadError> {
    let mut url = Url::parse(value.trim())
        .map_err(|err| LoadError::invalid(key, format!("invalid URL `{value}`: {err}")))?;
    if url.cannot_be_a_base() {
        return Err(LoadError::invalid(key, format!("`{value}` cannot be a base URL")));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Page globals are addressed as `window[name]`; keep them to plain identifiers.
fn required_identifier(
    value: Option<String>,
    default: &str,
    key: &'static str,
) -> Result<String, LoadError> {
    let value = value.unwrap_or_else(|| default.to_string());
    let valid = value
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_' || first == '$')
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '$');
    if !valid {
        return Err(LoadError::invalid(
            key,
            format!("`{value}` is not a valid JavaScript identifier"),
        ));
    }
    Ok(value)
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
