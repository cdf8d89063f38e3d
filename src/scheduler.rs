//! Reconciliation scheduler
//!
//! Every tick spawns one incremental and one full pass as independent tasks.
//! Passes may overlap each other and passes from earlier ticks; per-name
//! leases inside the engine keep operations on the same mirror apart.

use crate::engine::{MirrorEngine, PassKind, PassSummary};
use crate::gateway::DesiredStateGateway;
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub struct Scheduler {
    engine: Arc<MirrorEngine>,
    gateway: Arc<dyn DesiredStateGateway>,
    interval: Duration,
    incremental_window: Duration,
}

impl Scheduler {
    pub fn new(
        engine: Arc<MirrorEngine>,
        gateway: Arc<dyn DesiredStateGateway>,
        interval: Duration,
        incremental_window: Duration,
    ) -> Self {
        Self {
            engine,
            gateway,
            interval,
            incremental_window,
        }
    }

    /// Create mirrors for repositories desired within the incremental window
    pub async fn run_incremental_pass(&self) -> Result<PassSummary> {
        let since = chrono::Duration::from_std(self.incremental_window)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .with_context(|| format!("Incremental window {:?} is too large", self.incremental_window))?;

        let descriptors = self
            .gateway
            .fetch(Some(since))
            .await
            .with_context(|| format!("Failed to fetch new repositories from {}", self.gateway.source_name()))?;

        Ok(self.engine.run_pass(PassKind::Incremental, descriptors).await)
    }

    /// Update every desired repository
    pub async fn run_full_pass(&self) -> Result<PassSummary> {
        let descriptors = self
            .gateway
            .fetch(None)
            .await
            .with_context(|| format!("Failed to fetch repositories from {}", self.gateway.source_name()))?;

        Ok(self.engine.run_pass(PassKind::Full, descriptors).await)
    }

    pub async fn run_pass(&self, kind: PassKind) -> Result<PassSummary> {
        match kind {
            PassKind::Incremental => self.run_incremental_pass().await,
            PassKind::Full => self.run_full_pass().await,
        }
    }

    /// Drive ticks until `shutdown` fires, then abort passes still running
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if self.interval.is_zero() {
            error!("Scheduler interval must be greater than zero, not scheduling passes");
            return;
        }
        info!(
            "Scheduler started: interval {:?}, incremental window {:?}",
            self.interval, self.incremental_window
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut passes = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    while let Some(finished) = passes.try_join_next() {
                        if let Err(e) = finished {
                            error!("Reconciliation pass task failed: {}", e);
                        }
                    }

                    for kind in [PassKind::Incremental, PassKind::Full] {
                        let scheduler = self.clone();
                        passes.spawn(async move {
                            if let Err(e) = scheduler.run_pass(kind).await {
                                error!("{} pass aborted: {:#}", kind, e);
                            }
                        });
                    }
                    debug!("Tick: {} passes in flight", passes.len());
                }
                _ = shutdown.recv() => {
                    info!("Scheduler shutting down");
                    break;
                }
            }
        }

        if !passes.is_empty() {
            warn!("Aborting {} in-flight passes", passes.len());
        }
        passes.shutdown().await;
    }
}
