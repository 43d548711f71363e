use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod database;
mod error;
mod handlers;
mod jobs;
mod services;
mod workflows;

pub use error::{ApiError, ApiResult, AppError};

#[cfg(test)]
mod tests;

use config::{Config, StorageBackend};
use services::{
    ChannelRouter, Collaborators, LoggingSender, MemoryLeadStore, MemoryListStore, MemoryTaskService, MessageSender,
    PgLeadStore, PgListStore, PgTaskService, ReqwestHttpCaller, SmtpSender,
};
use workflows::steps::MessageChannel;
use jobs::JobScheduler;
use workflows::{AutomationEngine, EngineStore, MemoryStore, PgStore};

pub struct AppState {
    pub engine: Arc<AutomationEngine>,
    pub jobs: Arc<JobScheduler>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let messages: Arc<dyn MessageSender> = {
        let log_sink: Arc<dyn MessageSender> = Arc::new(LoggingSender);
        let router = match config.smtp.as_ref().filter(|smtp| smtp.is_configured()) {
            Some(smtp) => ChannelRouter::new().route(MessageChannel::Email, Arc::new(SmtpSender::new(smtp))),
            None => {
                tracing::warn!("SMTP not configured; email steps go to the log sink");
                ChannelRouter::new()
            }
        };
        Arc::new(router.fallback(log_sink))
    };
    let http = Arc::new(ReqwestHttpCaller::new(Duration::from_secs(config.engine.webhook_timeout_seconds))?);

    let (store, collaborators): (Arc<dyn EngineStore>, Collaborators) = match config.storage {
        StorageBackend::Postgres => {
            let db_pool = database::create_pool(&config.database_url).await?;
            database::migrate(&db_pool).await?;
            (
                Arc::new(PgStore::new(db_pool.clone())),
                Collaborators {
                    messages,
                    leads: Arc::new(PgLeadStore::new(db_pool.clone())),
                    tasks: Arc::new(PgTaskService::new(db_pool.clone())),
                    http,
                    lists: Arc::new(PgListStore::new(db_pool)),
                },
            )
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; state is lost on restart");
            (
                Arc::new(MemoryStore::new()),
                Collaborators {
                    messages,
                    leads: Arc::new(MemoryLeadStore::new()),
                    tasks: Arc::new(MemoryTaskService::new()),
                    http,
                    lists: Arc::new(MemoryListStore::new()),
                },
            )
        }
    };

    let (engine, run_queue) = AutomationEngine::new(store, collaborators, config.engine.clone());
    let worker = engine.spawn_worker(run_queue);

    let scheduler = Arc::new(JobScheduler::new(engine.clone(), jobs::JobConfig::from(&config.engine)).await?);
    scheduler.start().await?;

    let app = handlers::router(Arc::new(AppState {
        engine,
        jobs: scheduler.clone(),
    }));

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    scheduler.shutdown().await?;
    worker.abort();
    Ok(())
}
