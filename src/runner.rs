//! Daemon entry glue: logging setup and the supervision loop embedders run.

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::session::SessionRegistry;

/// Runtime options shared by embedders.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// Enable debug logging.
    pub debug: bool,
    /// Enable verbose (trace-level) logging.
    pub verbose: bool,
}

/// Initialize tracing to stderr. `RUST_LOG` overrides the defaults.
pub fn init_logging(config: &AppConfig) {
    let default_filter = if config.verbose {
        "trace"
    } else if config.debug {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Run bus housekeeping until ctrl-c: periodic liveness sweeps over the
/// subscriber registry. Sessions supervise themselves; this loop only keeps
/// the shared registry honest.
pub async fn run_daemon(registry: Arc<SessionRegistry>) {
    let mut sweep_tick = tokio::time::interval(std::time::Duration::from_secs(30));
    info!("daemon running");

    loop {
        tokio::select! {
            _ = sweep_tick.tick() => {
                match registry.sweep() {
                    Ok(swept) if !swept.is_empty() => {
                        info!(count = swept.len(), "swept stale subscribers");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "liveness sweep failed"),
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    for id in registry.list() {
        registry.shutdown(&id);
    }
    info!("daemon stopped");
}
