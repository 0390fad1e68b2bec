//! Background sweeper - periodic time-driven lifecycle transitions
//!
//! The only path that advances a session's status purely from elapsed time,
//! independent of any participant action. It scans persisted state and never
//! consults in-memory room tracking.

use crate::engine::SessionEngine;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Periodic driver for [`SessionEngine::sweep_at`]
pub struct Sweeper {
    engine: Arc<SessionEngine>,
    period: Duration,
}

impl Sweeper {
    pub fn new(engine: Arc<SessionEngine>, period: Duration) -> Self {
        Self { engine, period }
    }

    /// Run until the shutdown channel fires
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.period);
        // The first tick completes immediately; skip it so a fresh start
        // doesn't sweep before the server finishes wiring up
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.engine.sweep_at(Utc::now()).await {
                        Ok((started, ended)) => {
                            if started > 0 || ended > 0 {
                                tracing::info!(
                                    "Sweep: {} session(s) started, {} completed",
                                    started,
                                    ended
                                );
                            }
                        }
                        Err(e) => {
                            tracing::error!("Sweep failed: {}", e);
                        }
                    }
                }
            }
        }
    }
}
