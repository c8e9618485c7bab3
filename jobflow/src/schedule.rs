//! Cron driven runner for the periodic sweeps.
use std::{ops::Sub, time::Duration};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use cron::Schedule;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::checker::ScheduleTrigger;

/// A sweep run on every tick of a schedule.
///
/// Implementations log their own failures, a failed sweep never stops the runner.
#[async_trait]
pub trait Sweep: Send + Sync + 'static {
    const NAME: &'static str;

    async fn sweep(&self, request_id: &str);
}

pub(crate) struct SweepRunner<S: Sweep> {
    sweep: S,
    schedule: Schedule,
    trigger: Option<ScheduleTrigger>,
}

impl<S> SweepRunner<S>
where
    S: Sweep,
{
    pub fn new(sweep: S, schedule: Schedule) -> Self {
        Self {
            sweep,
            schedule,
            trigger: None,
        }
    }

    /// Ticks are skipped while the trigger is disabled.
    pub fn with_trigger(self, trigger: ScheduleTrigger) -> Self {
        Self {
            trigger: Some(trigger),
            ..self
        }
    }

    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some(next) = self.schedule.upcoming(Utc).next() else {
                    tracing::warn!("No future scheduled time for the {}, stopping", S::NAME);
                    break;
                };
                let delay = next
                    .sub(Utc::now())
                    .sub(TimeDelta::milliseconds(10))
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        self.tick().await;
                        if let Ok(delay) = (next - Utc::now()).to_std() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the {}", S::NAME);
                        break;
                    },
                }
            }
        })
    }

    async fn tick(&self) {
        if self.trigger.as_ref().is_some_and(|trigger| !trigger.is_enabled()) {
            tracing::trace!("The {} is disabled, skipping", S::NAME);
            return;
        }
        let request_id = uuid::Uuid::new_v4().to_string();
        self.sweep.sweep(&request_id).await;
    }
}
