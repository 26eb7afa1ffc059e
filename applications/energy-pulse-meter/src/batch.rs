use crate::delivery::DeliveryOutcome;
use crate::pulse::Measurement;

/// Newline-delimited line protocol records waiting for delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeasurementBatch {
    body: String,
}

/// The batch content handed to one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSnapshot {
    body: String,
}

impl BatchSnapshot {
    pub fn body(&self) -> &str {
        &self.body
    }
}

impl MeasurementBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, measurement: &Measurement) {
        self.body.push_str(&measurement.to_line_protocol());
        self.body.push('\n');
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.body
    }

    /// Number of records in the batch.
    pub fn len(&self) -> usize {
        self.body.lines().count()
    }

    /// Copy of the current content, or `None` when there is nothing to send.
    pub fn snapshot(&self) -> Option<BatchSnapshot> {
        if self.body.is_empty() {
            return None;
        }
        Some(BatchSnapshot {
            body: self.body.clone(),
        })
    }

    /// Remove the snapshotted records once their delivery succeeded.
    ///
    /// Records appended after the snapshot was taken stay in the batch. Any
    /// outcome other than [`DeliveryOutcome::Success`] leaves the batch as is.
    pub fn try_clear(&mut self, snapshot: &BatchSnapshot, outcome: DeliveryOutcome) -> bool {
        if outcome != DeliveryOutcome::Success {
            return false;
        }
        if !self.body.starts_with(snapshot.body()) {
            // the batch was reset behind our back; nothing of the snapshot remains
            return false;
        }
        self.body.replace_range(..snapshot.body().len(), "");
        true
    }
}
