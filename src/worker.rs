use chrono::Utc;
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::time::{MissedTickBehavior, interval};

use crate::engine::FlowEngine;
use crate::error::FlowError;
use crate::host::FlowHost;
use crate::id::Id;
use crate::store::keys;
use crate::types::{Reminder, ReminderOptions};

/// A background worker that delivers due reminders.
///
/// `Task::delay` and `Task::yield_now` suspensions register a reminder entry
/// in the heap store. The worker scans those entries and resumes each due
/// step with a unit value. Several workers may share a store: a step is only
/// consumed once, and the losing delivery is ignored.
///
/// # Example
///
/// ```ignore
/// let worker = engine.start_reminder_worker(ReminderOptions {
///     concurrency: 4,
///     ..Default::default()
/// });
///
/// tokio::signal::ctrl_c().await?;
///
/// // Graceful shutdown waits for in-flight resumes
/// worker.shutdown().await;
/// ```
pub struct ReminderWorker {
    shutdown_tx: broadcast::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

impl<H: FlowHost> FlowEngine<H> {
    /// Spawn a [`ReminderWorker`] for this engine on the current runtime.
    pub fn start_reminder_worker(&self, options: ReminderOptions) -> ReminderWorker {
        ReminderWorker::start(self.clone(), options)
    }
}

impl ReminderWorker {
    pub fn start<H: FlowHost>(engine: FlowEngine<H>, options: ReminderOptions) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let shutdown_rx = shutdown_tx.subscribe();

        let worker_id = options.worker_id.clone().unwrap_or_else(|| {
            format!(
                "{}:{}",
                hostname::get()
                    .map(|h| h.to_string_lossy().to_string())
                    .unwrap_or_else(|_| "unknown".to_string()),
                std::process::id()
            )
        });

        let handle = tokio::spawn(Self::run_loop(engine, options, worker_id, shutdown_rx));

        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Stop scanning and wait for in-flight resumes to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }

    async fn run_loop<H: FlowHost>(
        engine: FlowEngine<H>,
        options: ReminderOptions,
        worker_id: String,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let concurrency = options.concurrency.max(1);
        let batch_size = options.batch_size.unwrap_or(concurrency);
        let poll_interval = Duration::from_secs_f64(options.poll_interval).max(Duration::from_millis(1));
        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let semaphore = Arc::new(Semaphore::new(concurrency));
        // Steps being resumed by this worker; a slow resume is not fired twice.
        let in_flight: Arc<DashSet<Id>> = Arc::new(DashSet::new());
        // Finished deliveries report here; drained as they arrive.
        let (done_tx, mut done_rx) = mpsc::channel::<()>(concurrency);

        tracing::info!(worker_id = %worker_id, concurrency, "Reminder worker started");
        #[cfg(feature = "telemetry")]
        crate::telemetry::set_reminder_worker_active(&worker_id, true);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Reminder worker shutting down, waiting for in-flight resumes...");
                    drop(done_tx);
                    while done_rx.recv().await.is_some() {}
                    #[cfg(feature = "telemetry")]
                    crate::telemetry::set_reminder_worker_active(&worker_id, false);
                    tracing::info!("Reminder worker shutdown complete");
                    break;
                }

                Some(()) = done_rx.recv() => {}

                _ = ticker.tick() => {
                    let available = semaphore.available_permits();
                    if available == 0 {
                        continue;
                    }

                    let due = match engine.due_reminders(Utc::now(), available.min(batch_size) + in_flight.len()).await {
                        Ok(due) => due,
                        Err(e) => {
                            tracing::error!("Failed to scan reminders: {}", e);
                            continue;
                        }
                    };

                    for reminder in due.into_iter().filter(|r| !in_flight.contains(&r.step_id)).take(available.min(batch_size)) {
                        let Ok(permit) = semaphore.clone().acquire_owned().await else {
                            break;
                        };
                        in_flight.insert(reminder.step_id);
                        #[cfg(feature = "telemetry")]
                        crate::telemetry::set_reminders_in_flight(&worker_id, in_flight.len());

                        let engine = engine.clone();
                        let in_flight = Arc::clone(&in_flight);
                        let done_tx = done_tx.clone();
                        tokio::spawn(async move {
                            let step_id = reminder.step_id;
                            Self::deliver(&engine, reminder).await;
                            in_flight.remove(&step_id);
                            drop(permit);
                            let _ = done_tx.send(()).await;
                        });
                    }
                }
            }
        }
    }

    async fn deliver<H: FlowHost>(engine: &FlowEngine<H>, reminder: Reminder) {
        let Reminder {
            flow_id, step_id, ..
        } = reminder;
        match engine.resume_with(step_id, &()).await {
            Ok(outcome) => {
                tracing::debug!(flow_id = %flow_id, step_id = %step_id, "Reminder delivered: {:?}", outcome);
            }
            Err(FlowError::StepConsumed { .. }) => {
                tracing::debug!(step_id = %step_id, "Reminder for a consumed step ignored");
            }
            Err(FlowError::FrameNotFound { .. }) => {
                tracing::warn!(step_id = %step_id, "Reminder without a frame, dropping it");
                if let Err(e) = engine.heap().delete(&keys::reminder(step_id)).await {
                    tracing::error!("Failed to drop reminder {}: {}", step_id, e);
                }
            }
            Err(e) => {
                tracing::error!(flow_id = %flow_id, "Failed to deliver reminder for step {}: {}", step_id, e);
            }
        }
    }
}
