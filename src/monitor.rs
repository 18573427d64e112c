//! Background liveness loops: dead-connection sweep and heartbeat emission.

use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::broadcast::BroadcastEngine;
use crate::models::{DeliveryReport, Event};
use crate::transport::CLOSE_GOING_AWAY;

/// Resolve once the shutdown flag is raised or its sender is gone.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Periodic sweep and heartbeat over the connection registry.
#[derive(Clone)]
pub struct LivenessMonitor {
    engine: BroadcastEngine,
    sweep_interval: Duration,
    heartbeat_interval: Duration,
}

/// Join handles for the two monitor loops.
pub struct MonitorHandle {
    sweep: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl MonitorHandle {
    /// Wait for both loops to stop. Call after raising the shutdown flag.
    pub async fn join(self) {
        if let Err(e) = self.sweep.await {
            error!(error = %e, "sweep loop ended abnormally");
        }
        if let Err(e) = self.heartbeat.await {
            error!(error = %e, "heartbeat loop ended abnormally");
        }
        info!("liveness monitor stopped");
    }
}

impl LivenessMonitor {
    pub fn new(engine: BroadcastEngine, sweep_interval: Duration, heartbeat_interval: Duration) -> Self {
        Self {
            engine,
            sweep_interval,
            heartbeat_interval,
        }
    }

    /// Start both loops; they run until `shutdown` is raised.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> MonitorHandle {
        info!(
            sweep_interval_secs = self.sweep_interval.as_secs_f64(),
            heartbeat_interval_secs = self.heartbeat_interval.as_secs_f64(),
            "liveness monitor started"
        );

        let sweeper = self.clone();
        let sweep = tokio::spawn(run_periodic(
            "sweep",
            self.sweep_interval,
            shutdown.clone(),
            move || {
                let sweeper = sweeper.clone();
                async move {
                    sweeper.sweep_once().await;
                }
            },
        ));

        let beater = self.clone();
        let heartbeat = tokio::spawn(run_periodic(
            "heartbeat",
            self.heartbeat_interval,
            shutdown,
            move || {
                let beater = beater.clone();
                async move {
                    beater.heartbeat_once().await;
                }
            },
        ));

        MonitorHandle { sweep, heartbeat }
    }

    /// Evict every registered connection already observed closed.
    ///
    /// No sends are attempted. Returns the number of evicted connections.
    pub async fn sweep_once(&self) -> usize {
        let registry = self.engine.registry();
        let mut evicted = 0;
        for conn in registry.snapshot().await {
            if !conn.is_closed() {
                continue;
            }
            if registry.remove(conn.id()).await {
                evicted += 1;
            }
            conn.close_detached(CLOSE_GOING_AWAY, "connection closed");
        }

        if evicted > 0 {
            let connected = registry.count().await;
            info!(evicted, connected, "sweep evicted dead connections");
        } else {
            debug!("sweep found no dead connections");
        }
        evicted
    }

    /// Publish a heartbeat if anyone is listening.
    pub async fn heartbeat_once(&self) -> Option<DeliveryReport> {
        if self.engine.registry().count().await == 0 {
            return None;
        }
        Some(self.engine.publish(&Event::heartbeat()).await)
    }
}

/// Run `tick` every `period` until shutdown, surviving panics in any single tick.
async fn run_periodic<F, Fut>(
    task: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => {
                debug!(task, "periodic task stopping");
                break;
            }
            _ = ticker.tick() => {
                if let Err(panic) = AssertUnwindSafe(tick()).catch_unwind().await {
                    error!(task, panic = %panic_message(panic.as_ref()), "liveness iteration failed");
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
