use crate::config::{Config, FirstPulsePower};
use crate::tariff::{TariffClassifier, TariffPeriod};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Wall-clock time of a meter pulse in nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PulseTimestamp(i64);

impl PulseTimestamp {
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub fn now() -> Self {
        Self(Utc::now().timestamp_nanos_opt().unwrap_or_default())
    }

    pub fn as_nanos(self) -> i64 {
        self.0
    }

    fn whole_seconds(self) -> i64 {
        self.0.div_euclid(NANOS_PER_SECOND)
    }
}

/// FIFO of pulses waiting to be turned into measurements.
///
/// Clones share the same queue: the input watcher pushes at the tail while
/// the event loop pops from the head.
#[derive(Debug, Clone, Default)]
pub struct PendingPulseQueue {
    inner: Arc<Mutex<VecDeque<PulseTimestamp>>>,
}

impl PendingPulseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, ts: PulseTimestamp) {
        self.lock().push_back(ts);
    }

    pub fn pop(&self) -> Option<PulseTimestamp> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<PulseTimestamp>> {
        // a panicking holder cannot leave a VecDeque half-updated
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One pulse worth of energy, tagged with its tariff period.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub series: String,
    pub meter: String,
    pub period: TariffPeriod,
    /// Watts; `None` when the interval gives no meaningful value.
    pub power: Option<f64>,
    pub timestamp: PulseTimestamp,
}

impl Measurement {
    /// Influx line protocol record, without the trailing newline.
    pub fn to_line_protocol(&self) -> String {
        match self.power {
            Some(power) => format!(
                "{},meter={} value=1,power={:.2} {}",
                self.series,
                self.meter,
                power,
                self.timestamp.as_nanos()
            ),
            None => format!(
                "{},meter={} value=1 {}",
                self.series,
                self.meter,
                self.timestamp.as_nanos()
            ),
        }
    }
}

/// `energy_per_pulse` watt-seconds spread over `interval_ns` nanoseconds.
pub fn instantaneous_power(energy_per_pulse: u32, interval_ns: i64) -> f64 {
    NANOS_PER_SECOND as f64 * f64::from(energy_per_pulse) / interval_ns as f64
}

pub struct PulseIntervalTracker<Tz: TimeZone> {
    energy_per_pulse: u32,
    first_pulse_power: FirstPulsePower,
    series: String,
    meter_high: String,
    meter_low: String,
    classifier: TariffClassifier,
    tz: Tz,
    last_pulse: PulseTimestamp,
    processed: u64,
}

impl<Tz: TimeZone> PulseIntervalTracker<Tz> {
    /// `tz` is the civil time zone used for tariff classification.
    pub fn new(config: &Config, tz: Tz) -> Self {
        Self {
            energy_per_pulse: config.meter.energy_per_pulse,
            first_pulse_power: config.meter.first_pulse_power,
            series: config.influx.series.clone(),
            meter_high: config.influx.meter_high.clone(),
            meter_low: config.influx.meter_low.clone(),
            classifier: TariffClassifier::new(config.tariff.clone()),
            tz,
            last_pulse: PulseTimestamp::default(),
            processed: 0,
        }
    }

    pub fn last_pulse(&self) -> PulseTimestamp {
        self.last_pulse
    }

    /// Pop the oldest pending pulse and measure it. `None` when nothing is pending.
    pub fn process_next(&mut self, queue: &PendingPulseQueue) -> Option<Measurement> {
        let ts = queue.pop()?;
        Some(self.process(ts))
    }

    pub fn process(&mut self, ts: PulseTimestamp) -> Measurement {
        let interval = ts.as_nanos().saturating_sub(self.last_pulse.as_nanos());
        let first = self.processed == 0;

        let power = if first && self.first_pulse_power == FirstPulsePower::Suppress {
            debug!(ts = ts.as_nanos(), "first pulse since startup; power not reported");
            None
        } else if interval <= 0 {
            warn!(
                ts = ts.as_nanos(),
                last = self.last_pulse.as_nanos(),
                interval,
                "clock anomaly: non-positive pulse interval; power not reported"
            );
            None
        } else {
            Some(instantaneous_power(self.energy_per_pulse, interval))
        };

        let period = self.classify(ts);
        let meter = match period {
            TariffPeriod::High => self.meter_high.clone(),
            TariffPeriod::Low => self.meter_low.clone(),
        };

        self.last_pulse = ts;
        self.processed += 1;

        Measurement {
            series: self.series.clone(),
            meter,
            period,
            power,
            timestamp: ts,
        }
    }

    fn classify(&self, ts: PulseTimestamp) -> TariffPeriod {
        // whole seconds only, so 23:00:00.4 still counts as the 23:00 boundary
        match DateTime::<Utc>::from_timestamp(ts.whole_seconds(), 0) {
            Some(utc) => self
                .classifier
                .period(utc.with_timezone(&self.tz).naive_local()),
            None => {
                warn!(ts = ts.as_nanos(), "pulse timestamp out of range; assuming high tariff");
                TariffPeriod::High
            }
        }
    }
}
