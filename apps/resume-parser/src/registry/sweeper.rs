use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ProcessingRegistry;

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Periodic task that reclaims abandoned processing records.
///
/// Owned by the orchestrator; `start` and `stop` follow its lifecycle. Nothing
/// runs until `start` is called, so tests simply never call it.
pub struct RegistrySweeper {
    registry: ProcessingRegistry,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl RegistrySweeper {
    pub fn new(registry: ProcessingRegistry, interval: Duration) -> Self {
        Self {
            registry,
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|running| running.is_some())
            .unwrap_or(false)
    }

    /// Spawns the sweep loop. Calling `start` twice keeps the first loop.
    pub fn start(&self) {
        let Ok(mut running) = self.running.lock() else {
            warn!("Registry sweeper state poisoned; not starting");
            return;
        };
        if running.is_some() {
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let registry = self.registry.clone();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; skip it so the first sweep
            // happens one full interval after start.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match registry.sweep().await {
                            Ok(0) => debug!("Registry sweep found nothing to reclaim"),
                            Ok(n) => info!("Registry sweep reclaimed {n} abandoned records"),
                            Err(e) => warn!("Registry sweep failed: {e}"),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Registry sweeper stopped");
        });

        info!(
            "Registry sweeper started (interval {}s, timeout {}s)",
            period.as_secs(),
            self.registry.settings().processing_timeout.as_secs()
        );
        *running = Some(Running { shutdown, handle });
    }

    pub async fn stop(&self) {
        let running = match self.running.lock() {
            Ok(mut running) => running.take(),
            Err(_) => None,
        };
        if let Some(Running { shutdown, handle }) = running {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                warn!("Registry sweeper task ended abnormally: {e}");
            }
        }
    }
}
