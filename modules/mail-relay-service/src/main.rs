//! Mail Relay Service: standalone binary relaying Gmail change notifications
//! into a sheet and chat channels.
//!
//! Hosts the trigger endpoint, the Pub/Sub push endpoint and an RPC API on
//! the same port. Default: http://127.0.0.1:9103/

mod config;
mod cursor;
mod db;
mod decoder;
mod error;
mod fetcher;
mod gmail;
mod google_auth;
mod http;
mod layout;
mod notifier;
mod relay;
mod routes;
mod scheduler;
mod secrets;
mod sink;
#[cfg(test)]
mod testing;
mod watch;

use config::RelayConfig;
use fetcher::ChangeFetcher;
use gmail::{GmailClient, MailApi};
use google_auth::GoogleAuth;
use layout::LayoutMap;
use relay::RelayProcessor;
use routes::AppState;
use scheduler::TokioScheduler;
use secrets::{EnvSecretStore, SecretStore};
use sink::{GoogleSheet, Sink, SqliteSheet};
use std::sync::Arc;
use std::time::Instant;
use watch::WatchLifecycleManager;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let config = Arc::new(RelayConfig::from_env().expect("Invalid configuration"));
    let http = http::init_shared_client(config.http_timeout).clone();

    log::info!("Opening database at: {}", config.db_path);
    let database = Arc::new(db::Db::open(&config.db_path).expect("Failed to open database"));

    let secret_store: Arc<dyn SecretStore> = Arc::new(EnvSecretStore::new());
    if secret_store.get(secrets::API_KEY).is_none() {
        log::warn!("MAIL_RELAY_API_KEY not set; /exec and watch RPC will reject every call");
    }

    let auth = Arc::new(GoogleAuth::from_secrets(http.clone(), secret_store.as_ref()));
    if !auth.can_refresh() {
        log::warn!("No Google refresh credentials; the access token cannot be renewed");
    }

    // A single label can be pushed down into the history listing; the
    // fetcher checks every configured label on the resolved messages
    let history_label = match config.labels.as_slice() {
        [only] => Some(only.clone()),
        _ => None,
    };
    let mail_api: Arc<dyn MailApi> = Arc::new(
        GmailClient::new(http.clone(), auth.clone(), &config.user_id)
            .with_history_label(history_label),
    );

    let sink: Arc<dyn Sink> = match config.sheet.spreadsheet_id.as_deref() {
        Some(spreadsheet_id) => {
            let last_column = LayoutMap::build(&config.sheet)
                .expect("Invalid sheet layout")
                .last_column();
            log::info!(
                "Writing rows to Google sheet {} / {}",
                spreadsheet_id,
                config.sheet.name
            );
            Arc::new(
                GoogleSheet::new(
                    http.clone(),
                    auth.clone(),
                    spreadsheet_id,
                    &config.sheet.name,
                    &last_column,
                )
                .expect("Invalid sheet layout"),
            )
        }
        None => {
            log::info!("Writing rows to local sheet '{}'", config.sheet.name);
            Arc::new(SqliteSheet::new(database.clone(), &config.sheet.name))
        }
    };

    let notifiers = notifier::from_secrets(&http, secret_store.as_ref());
    if notifiers.is_empty() {
        log::info!("No chat notifiers configured");
    }

    let relay = Arc::new(
        RelayProcessor::new(
            database.clone(),
            ChangeFetcher::new(mail_api.clone()).with_labels(config.labels.clone()),
            sink,
            &config,
        )
        .with_notifiers(notifiers)
        .with_run_log(database.clone()),
    );

    let (scheduler, fired) = TokioScheduler::new(database.clone());
    let watch = Arc::new(WatchLifecycleManager::new(
        mail_api,
        database.clone(),
        scheduler.clone(),
        config.topic.clone(),
        config.labels.clone(),
        config.renew_margin,
    ));

    // Start the dispatcher before re-arming so overdue renewals are handled
    let renewal_watch = watch.clone();
    tokio::spawn(async move {
        watch::run_renewals(renewal_watch, fired).await;
    });
    match scheduler.restore() {
        Ok(n) => log::info!("Restored {} scheduled task(s)", n),
        Err(e) => log::error!("Failed to restore scheduled tasks: {}", e),
    }

    let state = Arc::new(AppState {
        relay,
        watch,
        db: database.clone(),
        secrets: secret_store,
        push_token: config.push_token.clone(),
        start_time: Instant::now(),
    });

    let cors = tower_http::cors::CorsLayer::permissive();

    let app = axum::Router::new()
        // Inbound
        .route("/exec", axum::routing::post(routes::exec))
        .route("/pubsub/push", axum::routing::post(routes::pubsub_push))
        // Watch
        .route("/rpc/watch/start", axum::routing::post(routes::watch_start))
        .route("/rpc/watch/stop", axum::routing::post(routes::watch_stop))
        // Service
        .route("/rpc/status", axum::routing::get(routes::status))
        .route("/rpc/runs/recent", axum::routing::get(routes::runs_recent))
        .with_state(state)
        .layer(cors);

    let addr = format!("127.0.0.1:{}", config.port);
    log::info!("Mail Relay Service listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app).await.expect("Server error");
}
