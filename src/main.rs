use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};

use jagc_coordinator::agent::echo::EchoSessionFactory;
use jagc_coordinator::agent::pi::PiSessionFactory;
use jagc_coordinator::agent::AgentSessionFactory;
use jagc_coordinator::config::RunnerKind;
use jagc_coordinator::executor::RunExecutor;
use jagc_coordinator::http::{self, AppState};
use jagc_coordinator::scheduled::ScheduledTaskEngine;
use jagc_coordinator::service::ServiceDispatchHandler;
use jagc_coordinator::telegram::TelegramBot;
use jagc_coordinator::{Config, InProcessScheduler, RunScheduler, RunService, Store};

const SCHEDULED_TASK_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    jagc_coordinator::setup_logging(&config.log_level)?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting jagc coordinator");

    let store = Arc::new(Store::open(&config.database_path)?);

    let session_factory: Arc<dyn AgentSessionFactory> = match config.runner {
        RunnerKind::Pi => {
            let command = std::env::var("PI_COMMAND").unwrap_or_else(|_| "pi".to_string());
            Arc::new(PiSessionFactory::new(command))
        }
        RunnerKind::Echo => Arc::new(EchoSessionFactory),
    };

    let executor = Arc::new(RunExecutor::new(
        store.clone(),
        session_factory,
        config.workspace_dir.clone(),
    ));

    // The scheduler needs a dispatch handler at construction time, but the
    // handler (the run service) needs the scheduler to construct itself.
    // Break the cycle with a cell filled in right after the service exists.
    let dispatch_handler = Arc::new(ServiceDispatchHandlerCell::new());
    let scheduler = InProcessScheduler::new(dispatch_handler.clone());
    scheduler.start().await;

    let service = RunService::new(store.clone(), scheduler.clone(), executor.clone());
    dispatch_handler.install(ServiceDispatchHandler { service: service.clone() });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduled_engine = Arc::new(ScheduledTaskEngine::new(
        store.clone(),
        service.clone(),
        SCHEDULED_TASK_POLL_INTERVAL,
    ));
    let scheduled_handle = {
        let engine = scheduled_engine.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { engine.run(rx).await })
    };

    let telegram_handle = if config.telegram.bot_token.is_some() {
        let bot = TelegramBot::new(&config.telegram, service.clone(), executor.clone(), store.clone())?;
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move { bot.run(rx).await }))
    } else {
        info!("TELEGRAM_BOT_TOKEN not set, telegram transport disabled");
        None
    };

    let app_state = Arc::new(AppState {
        service: service.clone(),
        executor: executor.clone(),
    });
    let host = config.host.clone();
    let port = config.port;
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http::run_server(&host, port, app_state).await {
            error!(err = %e, "http server stopped with an error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    service.shutdown().await;

    if let Err(e) = scheduled_handle.await {
        error!(err = %e, "scheduled task engine task panicked");
    }
    if let Some(handle) = telegram_handle {
        if let Err(e) = handle.await {
            error!(err = %e, "telegram dispatcher task panicked");
        }
    }
    http_handle.abort();

    info!("jagc coordinator stopped");
    Ok(())
}

/// Indirection so the scheduler (built before the service exists) and the
/// service (which needs the scheduler to construct) can reference each
/// other: the scheduler holds this cell as its `RunDispatchHandler` and it's
/// filled in once the service is built.
struct ServiceDispatchHandlerCell {
    inner: tokio::sync::OnceCell<ServiceDispatchHandler>,
}

impl ServiceDispatchHandlerCell {
    fn new() -> Self {
        Self {
            inner: tokio::sync::OnceCell::new(),
        }
    }

    fn install(&self, handler: ServiceDispatchHandler) {
        let _ = self.inner.set(handler);
    }
}

#[async_trait::async_trait]
impl jagc_coordinator::scheduler::RunDispatchHandler for ServiceDispatchHandlerCell {
    async fn handle(&self, run: jagc_coordinator::model::Run) {
        match self.inner.get() {
            Some(handler) => handler.handle(run).await,
            None => error!(run_id = %run.run_id, "dispatch handler invoked before service was installed"),
        }
    }
}
