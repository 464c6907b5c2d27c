//! Control plane server: scheduler loop plus the worker HTTP API.

use std::{sync::Arc, time::Duration};

use alerting::{AlertManager, SlackAlerter, SlackAlerterConfig};
use anyhow::Context as _;
use config::Config;
use http_auth::ApiSecret;
use results_db::ResultsDb;
use scheduler::{Scheduler, SchedulerConfig};
use tokio::{signal::unix::SignalKind, sync::broadcast, time::timeout};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use worker_api::ApiState;

/// How long in-flight work gets to drain after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::var("PROCTOR_CONFIG").context("no PROCTOR_CONFIG env var set")?;
    let config = Config::load(config_path.as_ref()).context("failed to load config")?;

    let db = ResultsDb::connect(&config.database.url, config.database.pool_size)
        .await
        .context("failed to connect to results db")?;

    let mut alert_manager = AlertManager::new(&config.server.base_url);
    if let Some(slack) = &config.slack {
        info!("configuring slack alerter");
        alert_manager.register_alerter(Arc::new(SlackAlerter::new(SlackAlerterConfig {
            webhook_url: slack.webhook_url.clone(),
            username: slack.username.clone(),
            default_channels: slack.default_channels.clone(),
            custom_channels: slack.custom_channels.clone(),
        })));
    }

    let packages: Arc<[_]> = config.packages.clone().into();

    let mut scheduler_config = SchedulerConfig::default();
    if let Some(run_timeout) = config.scheduler.run_timeout {
        scheduler_config.run_timeout = run_timeout.as_duration();
    }
    if let Some(run_delay) = config.scheduler.run_delay {
        scheduler_config.run_delay = run_delay.as_duration();
    }
    let scheduler = Scheduler::new(db.clone(), Arc::clone(&packages), scheduler_config);

    let state = ApiState::new(
        db,
        packages.iter().cloned(),
        Arc::new(alert_manager),
        ApiSecret::new(config.server.api_key.as_str()),
    );

    let (shutdown_tx, _) = broadcast::channel(1);

    let scheduler_task = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    let listen_addr = config.server.listen_addr;
    info!(addr = %listen_addr, "serving worker api");
    let api_shutdown = shutdown_tx.subscribe();
    let mut api_task =
        tokio::spawn(async move { worker_api::serve(listen_addr, state, api_shutdown).await });

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutting down");
        }
        res = &mut api_task => {
            let outcome = res.context("api server task panicked")?;
            outcome.map_err(|err| anyhow::anyhow!(err)).context("api server failed")?;
            anyhow::bail!("api server exited unexpectedly");
        }
    }

    // Give in-flight requests and the scheduler a grace period to finish.
    let _ = shutdown_tx.send(());
    let drain = async {
        if let Ok(Err(err)) = api_task.await {
            error!(error = %err, "api server failed during shutdown");
        }
        scheduler_task.await.ok();
    };
    if timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("shutdown grace period elapsed, exiting with work in flight");
    }

    Ok(())
}

/// Resolves when SIGINT or SIGTERM is received.
async fn shutdown_signal() {
    let mut sigterm = match tokio::signal::unix::signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
            unreachable!()
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
