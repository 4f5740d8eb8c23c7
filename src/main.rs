use std::{future::IntoFuture, path::Path, process, sync::Arc};

use cardshot::{
    application::{
        error::AppError,
        repos::CardsRepo,
        screenshot::{
            DeployTag, FingerprintBuilder, RenderOrchestrator, ScreenshotService, SnapshotStore,
        },
    },
    config::{self, CardSource, StorageBackend},
    domain::cards::{Card, RelatedCards},
    infra::{
        db::PostgresCards,
        error::InfraError,
        fixtures::FixtureCards,
        http::{self, HttpState},
        snapshots::{FsSnapshotStore, ObjectSnapshotStore},
        telemetry,
        webdriver::WebDriverEngine,
    },
};
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    if let config::Command::DeployTag = command {
        println!("{}", DeployTag::for_time(OffsetDateTime::now_utc()));
        return Ok(());
    }

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Render(args) => run_render(settings, args).await,
        config::Command::Fingerprint(args) => run_fingerprint(settings, args).await,
        config::Command::DeployTag => Ok(()),
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let cards = init_cards(&settings).await?;
    let screenshots = build_screenshot_service(&settings, Arc::clone(&cards))?;

    info!(
        target = "cardshot::serve",
        pipeline_version = settings.screenshot.pipeline_version,
        deploy_tag = %settings.screenshot.deploy_tag,
        bypass_cache = settings.screenshot.bypass_cache,
        single_flight = settings.screenshot.single_flight,
        "Screenshot pipeline ready"
    );

    serve_http(
        &settings,
        HttpState {
            screenshots: Arc::new(screenshots),
            cards,
        },
    )
    .await
}

async fn run_render(settings: config::Settings, args: config::RenderArgs) -> Result<(), AppError> {
    let png = match args.card_file.as_ref() {
        Some(card_file) => {
            let card: Card = read_json(card_file).await?;
            let related: RelatedCards = match args.related_file.as_ref() {
                Some(related_file) => read_json(related_file).await?,
                None => RelatedCards::new(),
            };
            // The card is supplied inline, so the data layer is never consulted.
            let screenshots =
                build_screenshot_service(&settings, Arc::new(FixtureCards::default()))?;
            screenshots
                .fetch_screenshot(Some(&card), &related)
                .await?
                .ok_or_else(|| AppError::validation(format!("card `{}` is not published", card.id)))?
        }
        None => {
            let id_or_slug = args
                .id_or_slug
                .as_deref()
                .ok_or_else(|| AppError::validation("render requires ID_OR_SLUG or --card-file"))?;
            let cards = init_cards(&settings).await?;
            let screenshots = build_screenshot_service(&settings, cards)?;
            screenshots
                .fetch_screenshot_by_id_or_slug(id_or_slug)
                .await?
                .ok_or(AppError::NotFound)?
        }
    };

    if let Some(parent) = args.output.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| AppError::from(InfraError::from(err)))?;
    }
    tokio::fs::write(&args.output, &png)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "cardshot::render",
        output = %args.output.display(),
        png_bytes = png.len(),
        "Screenshot written"
    );
    Ok(())
}

async fn run_fingerprint(
    settings: config::Settings,
    args: config::FingerprintArgs,
) -> Result<(), AppError> {
    let cards = init_cards(&settings).await?;
    let card = cards
        .find_card_by_id_or_slug(&args.id_or_slug)
        .await?
        .ok_or(AppError::NotFound)?;
    let related = cards.related_cards_for(&card).await?;

    let fingerprints = FingerprintBuilder::new(
        settings.screenshot.pipeline_version,
        settings.screenshot.deploy_tag.clone(),
    );
    if !card.is_published() {
        warn!(
            target = "cardshot::fingerprint",
            card_id = %card.id,
            "Card is not published; no snapshot will be served for it"
        );
    }
    println!("{}", fingerprints.compute(&card, &related));
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, AppError> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    serde_json::from_slice(&raw)
        .map_err(|err| AppError::validation(format!("invalid JSON in {}: {err}", path.display())))
}

async fn init_cards(settings: &config::Settings) -> Result<Arc<dyn CardsRepo>, AppError> {
    match &settings.cards {
        CardSource::Postgres {
            url,
            max_connections,
        } => {
            let database_url = url
                .as_ref()
                .ok_or_else(|| InfraError::configuration("database url is not configured"))
                .map_err(AppError::from)?;

            let pool = PostgresCards::connect(database_url, max_connections.get())
                .await
                .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

            PostgresCards::run_migrations(&pool)
                .await
                .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

            Ok(Arc::new(PostgresCards::new(pool)))
        }
        CardSource::Fixtures { path } => {
            let fixtures = FixtureCards::load(path).await?;
            info!(
                target = "cardshot::cards",
                path = %path.display(),
                cards = fixtures.len(),
                "Loaded card fixtures"
            );
            Ok(Arc::new(fixtures))
        }
    }
}

fn init_store(settings: &config::Settings) -> Result<Arc<dyn SnapshotStore>, AppError> {
    let store: Arc<dyn SnapshotStore> = match &settings.storage {
        StorageBackend::Filesystem { directory } => Arc::new(
            FsSnapshotStore::new(directory.clone())
                .map_err(|err| AppError::from(InfraError::from(err)))?,
        ),
        StorageBackend::S3(s3) => Arc::new(ObjectSnapshotStore::s3(s3)?),
        StorageBackend::Memory => Arc::new(ObjectSnapshotStore::in_memory()),
    };
    Ok(store)
}

fn build_screenshot_service(
    settings: &config::Settings,
    cards: Arc<dyn CardsRepo>,
) -> Result<ScreenshotService, AppError> {
    let engine = WebDriverEngine::new(&settings.renderer)?;
    let orchestrator = RenderOrchestrator::new(
        Arc::new(engine),
        settings.renderer.render_host(),
        settings.renderer.capture_settings(&settings.screenshot),
    );
    let fingerprints = FingerprintBuilder::new(
        settings.screenshot.pipeline_version,
        settings.screenshot.deploy_tag.clone(),
    );

    Ok(ScreenshotService::new(
        cards,
        init_store(settings)?,
        Arc::new(orchestrator),
        fingerprints,
        settings.screenshot.cache_policy(),
    ))
}

async fn serve_http(settings: &config::Settings, http_state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(http_state);
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "cardshot::serve",
        addr = %settings.server.addr,
        "Listening"
    );

    let stop = Arc::new(Notify::new());
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown({
        let stop = Arc::clone(&stop);
        async move { stop.notified().await }
    });
    let mut server = tokio::spawn(server.into_future());

    tokio::select! {
        result = &mut server => {
            return result
                .map_err(|err| AppError::unexpected(format!("server task failed: {err}")))?
                .map_err(|err| AppError::unexpected(format!("server error: {err}")));
        }
        _ = shutdown_signal() => {}
    }

    info!(
        target = "cardshot::serve",
        grace_seconds = settings.server.graceful_shutdown.as_secs(),
        "Shutdown requested, draining connections"
    );
    stop.notify_one();

    match tokio::time::timeout(settings.server.graceful_shutdown, server).await {
        Ok(joined) => joined
            .map_err(|err| AppError::unexpected(format!("server task failed: {err}")))?
            .map_err(|err| AppError::unexpected(format!("server error: {err}"))),
        Err(_) => {
            warn!(
                target = "cardshot::serve",
                "Graceful shutdown timed out, dropping open connections"
            );
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = "cardshot::serve", error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(target = "cardshot::serve", error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
