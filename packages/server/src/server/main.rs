// Main entry point for the pipeline server

use std::sync::Arc;

use anyhow::{Context, Result};
use server_core::domains::campaigns::PgRunStore;
use server_core::domains::contacts::PgContactRepository;
use server_core::domains::pipeline::queue::{RetryPolicy, TenantConfigCache, WorkBroker};
use server_core::domains::pipeline::reconciler::WebhookVerifier;
use server_core::domains::pipeline::retry::{RetryController, RetryControllerConfig};
use server_core::domains::pipeline::senders::{
    EmailSender, PushSender, SenderRegistry, SmsSender, WhatsAppSender,
};
use server_core::domains::pipeline::{PgFailureLog, PgJobStore, PollingWorker};
use server_core::domains::templates::PgTemplateService;
use server_core::kernel::{
    EventPublisher, LoggingPublisher, NatsClientPublisher, NatsPublisher, PipelineDeps,
};
use server_core::server::{build_app, AppState};
use server_core::Config;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use twilio::{TwilioOptions, TwilioService};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Outbound Messaging Pipeline");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Event bus
    let nats: Arc<dyn NatsPublisher> = match &config.nats_url {
        Some(url) => {
            let client = async_nats::connect(url)
                .await
                .context("Failed to connect to NATS")?;
            tracing::info!(url = %url, "Event bus connected");
            Arc::new(NatsClientPublisher::new(client))
        }
        None => {
            tracing::warn!("NATS_URL not set, events will be logged only");
            Arc::new(LoggingPublisher)
        }
    };
    let events = EventPublisher::new(nats);

    // Channel senders
    let senders = build_senders(&config);
    let tenant_configs = Arc::new(TenantConfigCache::new());

    let deps = PipelineDeps {
        store: Arc::new(PgJobStore::new(pool.clone())),
        failures: Arc::new(PgFailureLog::new(pool.clone())),
        runs: Arc::new(PgRunStore::new(pool.clone())),
        contacts: Arc::new(PgContactRepository::new(pool.clone())),
        templates: Arc::new(PgTemplateService::new(pool.clone())),
        senders: Arc::new(senders),
        events: events.clone(),
        tenant_configs: tenant_configs.clone(),
    };

    let processor = Arc::new(deps.processor(&config.pipeline));
    let shutdown = CancellationToken::new();
    let mut background = Vec::new();

    // Exactly one execution mode is active per process.
    let broker = if config.pipeline.use_broker {
        let broker = WorkBroker::new(
            processor.clone(),
            tenant_configs.clone(),
            RetryPolicy {
                attempts: config.pipeline.max_retries,
                ..Default::default()
            },
        );
        background.push(tokio::spawn(
            broker.clone().run(shutdown.child_token()),
        ));
        tracing::info!("Work broker mode active");
        Some(broker)
    } else {
        let poller = PollingWorker::new(processor.clone());
        background.push(tokio::spawn(poller.run(shutdown.child_token())));
        tracing::info!("Polling worker mode active");
        None
    };

    // Retry controller runs in both modes.
    let controller = RetryController::new(
        deps.store.clone(),
        deps.failures.clone(),
        deps.stats(),
        events.clone(),
        broker.clone(),
        RetryControllerConfig::from(&config.pipeline),
    );
    background.push(tokio::spawn(controller.run(shutdown.child_token())));

    // HTTP surface
    let state = AppState {
        db_pool: pool.clone(),
        deps: deps.clone(),
        broker,
        reconciler: Arc::new(deps.reconciler()),
        verifier: WebhookVerifier::from_base64_key(
            config.pipeline.email_webhook_verification_key.as_deref(),
        ),
        stats: deps.stats(),
    };
    let app = build_app(state);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Pipeline health: http://localhost:{}/pipeline/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received shutdown signal");
            server_shutdown.cancel();
        })
        .await
        .context("Server error")?;

    // Drain background services before exit.
    shutdown.cancel();
    for handle in background {
        let _ = handle.await;
    }
    tracing::info!("shutdown complete");

    Ok(())
}

/// Register a sender for every channel with credentials configured.
fn build_senders(config: &Config) -> SenderRegistry {
    let mut senders = SenderRegistry::new();

    match (&config.sendgrid_api_key, &config.sendgrid_from_email) {
        (Some(api_key), Some(from)) => {
            senders.register(Arc::new(EmailSender::new(api_key.clone(), from.clone())));
        }
        _ => tracing::warn!("SendGrid not configured, email channel disabled"),
    }

    if let (Some(sid), Some(token)) = (&config.twilio_account_sid, &config.twilio_auth_token) {
        let twilio = Arc::new(TwilioService::new(TwilioOptions {
            account_sid: sid.clone(),
            auth_token: token.clone(),
        }));
        match &config.twilio_from_number {
            Some(from) => {
                senders.register(Arc::new(SmsSender::new(twilio.clone(), from.clone())));
            }
            None => tracing::warn!("TWILIO_FROM_NUMBER not set, sms channel disabled"),
        }
        match &config.twilio_whatsapp_from {
            Some(from) => {
                senders.register(Arc::new(WhatsAppSender::new(twilio, from.clone())));
            }
            None => tracing::warn!("TWILIO_WHATSAPP_FROM not set, whatsapp channel disabled"),
        }
    } else {
        tracing::warn!("Twilio not configured, sms/whatsapp channels disabled");
    }

    senders.register(Arc::new(PushSender::new(config.expo_access_token.clone())));

    senders
}
