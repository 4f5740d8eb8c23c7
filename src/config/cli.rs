use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the cardshot binary.
#[derive(Debug, Parser)]
#[command(name = "cardshot", version, about = "Card screenshot cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CARDSHOT_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve card screenshots over HTTP.
    Serve(Box<ServeArgs>),
    /// Render a single card to a PNG file.
    Render(RenderArgs),
    /// Print the cache key for a card's current state.
    Fingerprint(FingerprintArgs),
    /// Print a fresh render-affecting deploy tag.
    #[command(name = "deploy-tag")]
    DeployTag,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub pipeline: PipelineOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

/// Overrides shared by every command that drives the snapshot pipeline.
#[derive(Debug, Args, Default, Clone)]
pub struct PipelineOverrides {
    /// Override the card database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Read cards from a JSON fixture file instead of the database.
    #[arg(long = "fixtures-path", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub fixtures_path: Option<PathBuf>,

    /// Override the render-affecting deploy tag.
    #[arg(long = "deploy-tag", value_name = "TAG")]
    pub deploy_tag: Option<String>,

    /// Re-render even when a snapshot is already stored.
    #[arg(
        long = "bypass-cache",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub bypass_cache: Option<bool>,

    /// Override the WebDriver endpoint.
    #[arg(long = "webdriver-url", value_name = "URL")]
    pub webdriver_url: Option<String>,

    /// Override the base URL of the card rendering host.
    #[arg(long = "render-host-url", value_name = "URL")]
    pub render_host_url: Option<String>,

    /// Override the snapshot directory for the filesystem backend.
    #[arg(long = "storage-directory", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub storage_directory: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    #[command(flatten)]
    pub overrides: PipelineOverrides,

    /// Card identifier or slug to resolve through the card source.
    #[arg(value_name = "ID_OR_SLUG", required_unless_present = "card_file")]
    pub id_or_slug: Option<String>,

    /// Render the card described by this JSON file instead of a stored card.
    #[arg(long = "card-file", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub card_file: Option<PathBuf>,

    /// JSON object of related cards keyed by id, used with --card-file.
    #[arg(
        long = "related-file",
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        requires = "card_file"
    )]
    pub related_file: Option<PathBuf>,

    /// Where to write the PNG.
    #[arg(long, short = 'o', value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub output: PathBuf,
}

#[derive(Debug, Args, Clone)]
pub struct FingerprintArgs {
    #[command(flatten)]
    pub overrides: PipelineOverrides,

    /// Card identifier or slug.
    #[arg(value_name = "ID_OR_SLUG")]
    pub id_or_slug: String,
}
