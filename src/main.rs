use phase_sentinel::classification::{load_classifier_from_path, scheduler};
use phase_sentinel::context::{ScheduleSettings, ServiceContext};
use phase_sentinel::error::AppError;
use phase_sentinel::notify::build_notifier;
use phase_sentinel::state::AppState;
use phase_sentinel::telemetry::mongo::MongoStore;
use phase_sentinel::{api, config};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

fn init_tracing(level: tracing::Level) {
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // A missing .env file is normal outside development.
    let _ = dotenvy::dotenv();
    let config = config::load_default()?;
    init_tracing(config.log_level());
    tracing::info!(name = %config.app.name, "phase-sentinel starting");

    let store_settings = config.store_settings()?;

    let classifier = load_classifier_from_path(config.model_path())?;
    tracing::info!(
        path = %config.model_path().display(),
        sequence_length = classifier.preparer().sequence_length(),
        "Phase classifier loaded"
    );

    let store = MongoStore::connect(&store_settings).await?;
    tracing::info!(
        database = %store_settings.database,
        "Connected to telemetry store"
    );

    let credentials = config.telegram_credentials();
    if credentials.is_none() {
        tracing::warn!("BOT_TOKEN or CHAT_ID missing, phase alerts are disabled");
    }
    let notifier = build_notifier(credentials, config.telegram_api_base())?;

    let interval = config.interval();
    let ctx = ServiceContext::new(
        Arc::new(store),
        Arc::new(classifier),
        notifier,
        ScheduleSettings::with_interval(interval),
    );
    let state = Arc::new(RwLock::new(AppState::with_interval(interval)));

    let cancel = CancellationToken::new();
    let scheduler_handle =
        scheduler::spawn_scheduler(ctx, Arc::clone(&state), cancel.clone());

    let signal_token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(err) => tracing::error!(error = %err, "Failed to listen for shutdown signal"),
        }
        signal_token.cancel();
    });

    let app = api::router(Arc::clone(&state));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port()));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "API server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await?;

    // The server can also stop on its own; make sure the scheduler follows.
    cancel.cancel();
    if let Err(err) = scheduler_handle.await {
        tracing::error!(error = %err, "Scheduler task ended abnormally");
    }

    tracing::info!("phase-sentinel stopped");
    Ok(())
}
