use crate::batch::MeasurementBatch;
use crate::delivery::{DeliveryOutcome, DeliveryService, Transport};
use crate::pulse::{PendingPulseQueue, PulseIntervalTracker};
use chrono::TimeZone;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// A pulse was turned into a measurement; more may be pending.
    Draining,
    /// Nothing was pending; a delivery attempt was made.
    Idle(DeliveryOutcome),
}

pub struct EventLoop<T: Transport, Tz: TimeZone> {
    queue: PendingPulseQueue,
    tracker: PulseIntervalTracker<Tz>,
    batch: MeasurementBatch,
    delivery: DeliveryService<T>,
    idle_interval: Duration,
}

impl<T: Transport, Tz: TimeZone> EventLoop<T, Tz> {
    pub fn new(
        queue: PendingPulseQueue,
        tracker: PulseIntervalTracker<Tz>,
        delivery: DeliveryService<T>,
        idle_interval: Duration,
    ) -> Self {
        Self {
            queue,
            tracker,
            batch: MeasurementBatch::new(),
            delivery,
            idle_interval,
        }
    }

    pub fn batch(&self) -> &MeasurementBatch {
        &self.batch
    }

    /// One cycle: measure the oldest pending pulse, or attempt delivery when
    /// none is pending. Never sleeps.
    pub async fn cycle(&mut self) -> LoopState {
        if let Some(measurement) = self.tracker.process_next(&self.queue) {
            debug!(
                meter = %measurement.meter,
                power = ?measurement.power,
                ts = measurement.timestamp.as_nanos(),
                "pulse measured"
            );
            self.batch.append(&measurement);
            return LoopState::Draining;
        }

        LoopState::Idle(self.delivery.attempt_delivery(&mut self.batch).await)
    }

    /// Run until `shutdown` turns true or its sender goes away, then return
    /// the undelivered batch.
    ///
    /// Pulses still queued when the loop stops are measured into the returned
    /// batch; no delivery is attempted for them.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> MeasurementBatch {
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.cycle().await {
                LoopState::Draining => tokio::task::yield_now().await,
                LoopState::Idle(_) => {
                    tokio::select! {
                        biased;
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(self.idle_interval) => {}
                    }
                }
            }
        }

        let drained = self.drain_pending();
        info!(
            drained,
            records = self.batch.len(),
            "event loop stopped"
        );
        self.batch
    }

    fn drain_pending(&mut self) -> usize {
        let mut drained = 0;
        while let Some(measurement) = self.tracker.process_next(&self.queue) {
            self.batch.append(&measurement);
            drained += 1;
        }
        drained
    }
}
