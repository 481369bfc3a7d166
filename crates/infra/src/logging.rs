use crate::config::AppConfig;
use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global subscriber for one binary. `service` is attached to the
/// startup event so mixed api/worker logs can be told apart.
pub fn init_tracing(config: &AppConfig, service: &'static str) -> Result<()> {
    let filter =
        EnvFilter::try_new(config.log_level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = if config.is_production() {
        fmt()
            .with_env_filter(filter)
            .json()
            .with_target(false)
            .try_init()
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
    };
    installed.map_err(|err| anyhow!("tracing init failed: {err}"))?;

    tracing::info!(
        service,
        app_env = %config.app_env,
        data_backend = %config.data_backend,
        recompute_transport = %config.recompute_transport,
        "tracing initialised"
    );
    Ok(())
}
