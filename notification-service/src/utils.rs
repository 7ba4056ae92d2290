use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::{
    signal,
    sync::broadcast,
    time::sleep,
};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

use crate::{
    config::{LogConfig, LogFormat},
    models::retry::RetryConfig,
};

/// Installs the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},lapin=warn", config.level.as_str())));

    let result = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .flatten_event(true),
            )
            .with(filter)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_target(false).pretty())
            .with(filter)
            .try_init(),
    };

    if result.is_err() {
        debug!("Tracing already initialized, skipping re-initialization");
    }
}

/// Runs `operation` until it succeeds or `max_retries` retries are used up.
///
/// Delays follow [`RetryConfig::delay_for_retry`] with ±10% jitter.
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_retries + 1;
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    info!(attempt, max_attempts, "Retry succeeded");
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= max_attempts {
                    warn!(
                        max_attempts,
                        error = %e,
                        "Retry failed after exhausting all attempts"
                    );
                    return Err(e);
                }

                let delay = config.delay_for_retry(attempt - 1);
                debug!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retry attempt failed, backing off"
                );

                let jitter = rand::random_range(-0.1..=0.1);
                sleep(delay.mul_f64(1.0 + jitter)).await;
            }
        }
    }
}

/// Broadcasts a single shutdown notification to every subscriber.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    tx: broadcast::Sender<()>,
    initiated: Arc<AtomicBool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            initiated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.initiated.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Initiating graceful shutdown");
            let _ = self.tx.send(());
        }
    }

    /// Resolves once shutdown has been initiated, even if that happened before the call.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        if self.is_shutting_down() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Waits for SIGINT or SIGTERM, then initiates shutdown.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down"),
            _ = terminate => info!("Received SIGTERM, shutting down"),
            _ = self.wait() => {}
        }

        self.shutdown();
    }
}
