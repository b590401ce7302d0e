use std::sync::Arc;
use std::sync::atomic::Ordering;

use eternal_sentinel::clock::SystemClock;
use eternal_sentinel::config::SentinelConfig;
use eternal_sentinel::http::{self, AppState};
use eternal_sentinel::queue::{Dispatcher, LibSqlQueue, QueueBackend, spawn_dispatcher};
use eternal_sentinel::scheduler::{Sweeper, spawn_scheduler};
use eternal_sentinel::store::{LibSqlStore, Store};
use eternal_sentinel::token::OsRngTokens;
use eternal_sentinel::transport::{
    EmailTransport, LogOnlyTransport, SmsTransport, SmtpEmailTransport, WebhookSmsTransport,
};
use eternal_sentinel::workers::{
    CheckinWorker, EscalationWorker, NotifyWorker, ReleaseWorker, WorkerDeps,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = SentinelConfig::from_env();

    eprintln!("🛡  Eternal Sentinel v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Base URL: {}", config.base_url);

    let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_local(&config.db_path).await?);
    let queue: Arc<dyn QueueBackend> = Arc::new(LibSqlQueue::new_local(&config.db_path).await?);
    let clock = Arc::new(SystemClock);
    let tokens = Arc::new(OsRngTokens);

    // Transports: real when configured, log-only otherwise.
    let email: Arc<dyn EmailTransport> = match config.smtp.clone() {
        Some(smtp) => {
            eprintln!("   Email: SMTP via {}", smtp.host);
            Arc::new(SmtpEmailTransport::new(smtp))
        }
        None => {
            eprintln!("   Email: log-only (SMTP_HOST not set)");
            Arc::new(LogOnlyTransport)
        }
    };
    let sms: Arc<dyn SmsTransport> = match config.sms.clone() {
        Some(gateway) => {
            eprintln!("   SMS: gateway at {}", gateway.webhook_url);
            Arc::new(WebhookSmsTransport::new(gateway))
        }
        None => {
            eprintln!("   SMS: log-only (SMS_WEBHOOK_URL not set)");
            Arc::new(LogOnlyTransport)
        }
    };

    let deps = WorkerDeps {
        store: Arc::clone(&store),
        queue: Arc::clone(&queue),
        clock: clock.clone(),
        tokens: tokens.clone(),
        base_url: config.base_url.clone(),
    };

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&queue),
        Arc::clone(&store),
        clock.clone(),
        CheckinWorker::new(deps.clone()),
        EscalationWorker::new(deps.clone()),
        ReleaseWorker::new(deps.clone()),
        NotifyWorker::new(email, sms),
    ));

    let (worker_handles, worker_shutdown) = spawn_dispatcher(
        dispatcher,
        config.worker_concurrency,
        config.queue_poll_interval,
    );

    let sweeper = Arc::new(Sweeper::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        clock.clone(),
        tokens.clone(),
        config.sweep_batch,
    ));
    let (scheduler_handle, scheduler_shutdown) = spawn_scheduler(sweeper, config.poll_interval);

    let state = AppState {
        store,
        queue,
        clock,
        admin_token: config.admin_token.clone(),
    };
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    eprintln!("   Listening on {}\n", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    // Stop claiming new work; let in-flight jobs and the current sweep finish.
    scheduler_shutdown.store(true, Ordering::Relaxed);
    worker_shutdown.store(true, Ordering::Relaxed);

    let _ = scheduler_handle.await;
    for handle in worker_handles {
        let _ = handle.await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
