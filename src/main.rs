use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderName, HeaderValue, Method,
    },
    response::IntoResponse,
};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use billing_gate::{
    config::Config,
    db::{
        account_repository::AccountRepository,
        postgres_account_repository::PostgresAccountRepository,
        postgres_subscription_history_repository::PostgresSubscriptionHistoryRepository,
        postgres_webhook_event_repository::PostgresWebhookEventRepository,
        subscription_history_repository::SubscriptionHistoryRepository,
        webhook_event_repository::WebhookEventRepository,
    },
    responses::JsonResponse,
    routes::api_router,
    services::{
        smtp_mailer::{DisabledMailer, Mailer, SmtpMailer},
        stripe::{LiveStripeService, StripeService},
    },
    state::AppState,
    utils::jwt::JwtKeys,
    worker,
};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(sentry_tracing::layer());
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn establish_connection(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPool::connect(database_url)
        .await
        .context("Failed to connect to the database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    info!("Successfully connected to the database");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Invalid configuration")?;

    let _sentry = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });
    init_tracing(config.log_json);

    let jwt_keys = JwtKeys::from_secret(&config.jwt_secret).context("Invalid JWT_SECRET")?;

    let global_governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond(config.rate_limit_ms)
            .burst_size(config.rate_limit_burst)
            .use_headers()
            .error_handler(|_err| {
                JsonResponse::too_many_requests(
                    "Too many requests. Please wait a moment and try again.",
                )
                .into_response()
            })
            .finish()
            .context("Invalid rate limiter settings")?,
    );

    let governor_limiter = global_governor_conf.limiter().clone();
    std::thread::spawn(move || {
        let interval = std::time::Duration::from_secs(60);
        loop {
            std::thread::sleep(interval);
            governor_limiter.retain_recent();
        }
    });

    let pg_pool = establish_connection(&config.database_url).await?;
    let account_repo = Arc::new(PostgresAccountRepository {
        pool: pg_pool.clone(),
    }) as Arc<dyn AccountRepository>;
    let webhook_events = Arc::new(PostgresWebhookEventRepository {
        pool: pg_pool.clone(),
    }) as Arc<dyn WebhookEventRepository>;
    let history = Arc::new(PostgresSubscriptionHistoryRepository {
        pool: pg_pool.clone(),
    }) as Arc<dyn SubscriptionHistoryRepository>;

    let stripe = Arc::new(LiveStripeService::from_settings(&config.stripe)) as Arc<dyn StripeService>;

    let mailer: Arc<dyn Mailer> = match &config.smtp {
        Some(settings) => Arc::new(
            SmtpMailer::new(settings, &config.frontend_origin)
                .context("Failed to initialize mailer")?,
        ),
        None => {
            warn!("SMTP_HOST not set; outgoing email is disabled");
            Arc::new(DisabledMailer)
        }
    };

    let cors = CorsLayer::new()
        .allow_origin(
            config
                .frontend_origin
                .parse::<HeaderValue>()
                .context("Invalid FRONTEND_ORIGIN")?,
        )
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            AUTHORIZATION,
            CONTENT_TYPE,
            HeaderName::from_static("x-signature"),
        ])
        .allow_credentials(true);

    let addr = config.bind_addr;
    let state = AppState::assemble(
        config,
        jwt_keys,
        account_repo,
        webhook_events,
        history,
        stripe,
        mailer,
    );
    let state_for_worker = state.clone();

    let app = api_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(GovernorLayer {
            config: global_governor_conf.clone(),
        })
        .layer(cors);

    worker::start_background_workers(state_for_worker).await;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on http://{}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error")?;
    Ok(())
}
