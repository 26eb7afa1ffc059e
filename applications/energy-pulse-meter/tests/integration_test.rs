use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use energy_pulse_meter::batch::MeasurementBatch;
use energy_pulse_meter::config::{Config, FirstPulsePower};
use energy_pulse_meter::delivery::{DeliveryOutcome, DeliveryService, Transport};
use energy_pulse_meter::event_loop::{EventLoop, LoopState};
use energy_pulse_meter::pulse::{PendingPulseQueue, PulseIntervalTracker, PulseTimestamp};
use energy_pulse_meter::shutdown::persist_batch;
use energy_pulse_meter::AppError;
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Records every request body and answers from a script, then with `fallback`.
#[derive(Clone)]
struct ScriptedTransport {
    sent: Arc<Mutex<Vec<String>>>,
    script: Arc<Mutex<VecDeque<Option<u16>>>>,
    fallback: u16,
}

impl ScriptedTransport {
    fn new(script: Vec<Option<u16>>, fallback: u16) -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(script.into())),
            fallback,
        }
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, body: String) -> energy_pulse_meter::Result<u16> {
        self.sent.lock().unwrap().push(body);
        match self.script.lock().unwrap().pop_front() {
            Some(Some(status)) => Ok(status),
            Some(None) => Err(AppError::Other(anyhow::anyhow!("connection reset"))),
            None => Ok(self.fallback),
        }
    }
}

fn test_env() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("ENERGY_PER_PULSE", "3600"),
        ("PULSE_METER_PIN", "17"),
        ("INTERRUPT_BUTTON_PIN", "27"),
        ("INFLUX_ADDRESS", "http://localhost:8086/write?db=energy"),
        ("INFLUX_SERIES", "energy"),
        ("INFLUX_METER_HIGH", "181"),
        ("INFLUX_METER_LOW", "182"),
    ])
}

fn test_config() -> Config {
    let env = test_env();
    Config::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap()
}

fn at(y: i32, m: u32, d: u32, hh: u32, mm: u32, ss: u32) -> i64 {
    Utc.with_ymd_and_hms(y, m, d, hh, mm, ss)
        .unwrap()
        .timestamp_nanos_opt()
        .unwrap()
}

fn new_loop(
    queue: &PendingPulseQueue,
    transport: ScriptedTransport,
) -> EventLoop<ScriptedTransport, Utc> {
    EventLoop::new(
        queue.clone(),
        PulseIntervalTracker::new(&test_config(), Utc),
        DeliveryService::new(transport),
        Duration::from_millis(10),
    )
}

async fn drain(el: &mut EventLoop<ScriptedTransport, Utc>) -> LoopState {
    loop {
        let state = el.cycle().await;
        if state != LoopState::Draining {
            return state;
        }
    }
}

/// Test environment based configuration loading
#[test]
#[serial]
fn test_config_from_env() {
    let env = test_env();
    let saved: Vec<(&str, Option<String>)> =
        env.keys().map(|k| (*k, std::env::var(k).ok())).collect();
    for (k, v) in &env {
        std::env::set_var(k, v);
    }
    std::env::set_var("FIRST_PULSE_POWER", "report");

    let config = Config::from_env().unwrap();
    assert_eq!(config.meter.energy_per_pulse, 3600);
    assert_eq!(config.meter.first_pulse_power, FirstPulsePower::Report);
    assert_eq!(config.influx.meter_high, "181");
    assert_eq!(config.influx.meter_low, "182");

    std::env::remove_var("FIRST_PULSE_POWER");
    for (k, v) in saved {
        match v {
            Some(v) => std::env::set_var(k, v),
            None => std::env::remove_var(k),
        }
    }
}

/// Pulses on a holiday and on a working day end up in the right series
#[tokio::test]
async fn test_pulses_to_payload() {
    let queue = PendingPulseQueue::new();
    let transport = ScriptedTransport::new(vec![], 204);
    let mut el = new_loop(&queue, transport.clone());

    // easter monday 2024, then the tuesday after
    let holiday = at(2024, 4, 1, 12, 0, 0);
    let workday = at(2024, 4, 2, 12, 0, 0);
    for ts in [holiday, holiday + 2_000_000_000, workday, workday + 3_600_000_000_000] {
        queue.push(PulseTimestamp::from_nanos(ts));
    }

    assert_eq!(drain(&mut el).await, LoopState::Idle(DeliveryOutcome::Success));
    assert_eq!(
        transport.sent(),
        vec![format!(
            "energy,meter=182 value=1 {}\n\
             energy,meter=182 value=1,power=1800.00 {}\n\
             energy,meter=181 value=1,power=0.04 {}\n\
             energy,meter=181 value=1,power=1.00 {}\n",
            holiday,
            holiday + 2_000_000_000,
            workday,
            workday + 3_600_000_000_000
        )]
    );
    assert!(el.batch().is_empty());
}

/// Failed deliveries keep content; the next success sends it once, with later records
#[tokio::test]
async fn test_retry_without_loss_or_duplication() {
    let queue = PendingPulseQueue::new();
    let transport = ScriptedTransport::new(vec![Some(500), None, Some(204)], 204);
    let mut el = new_loop(&queue, transport.clone());
    let base = at(2024, 3, 12, 12, 0, 0);

    for i in 0..3 {
        queue.push(PulseTimestamp::from_nanos(base + i * 1_000_000_000));
    }
    assert_eq!(drain(&mut el).await, LoopState::Idle(DeliveryOutcome::Failure));
    let first_body = el.batch().as_str().to_string();
    assert_eq!(el.batch().len(), 3);

    // transport error: content unchanged
    assert_eq!(el.cycle().await, LoopState::Idle(DeliveryOutcome::Failure));
    assert_eq!(el.batch().as_str(), first_body);

    for i in 3..5 {
        queue.push(PulseTimestamp::from_nanos(base + i * 1_000_000_000));
    }
    assert_eq!(drain(&mut el).await, LoopState::Idle(DeliveryOutcome::Success));

    let sent = transport.sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0], first_body);
    assert_eq!(sent[1], first_body);
    assert!(sent[2].starts_with(&first_body));
    assert_eq!(sent[2].lines().count(), 5);
    assert!(el.batch().is_empty());

    // nothing left: no further request
    assert_eq!(el.cycle().await, LoopState::Idle(DeliveryOutcome::Skipped));
    assert_eq!(transport.sent().len(), 3);
}

/// Every pulse pushed while the loop runs is delivered exactly once, in order
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_producer_keeps_order() {
    const PULSES: i64 = 500;
    let queue = PendingPulseQueue::new();
    let transport = ScriptedTransport::new(vec![], 204);
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(new_loop(&queue, transport.clone()).run(stop_rx));

    let base = at(2024, 3, 12, 12, 0, 0);
    let producer = {
        let queue = queue.clone();
        std::thread::spawn(move || {
            for i in 0..PULSES {
                queue.push(PulseTimestamp::from_nanos(base + i * 100_000_000));
                if i % 50 == 0 {
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        })
    };
    producer.join().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop_tx.send(true).unwrap();
    let remaining = handle.await.unwrap();

    let mut all = transport.sent().concat();
    all.push_str(remaining.as_str());
    let timestamps: Vec<i64> = all
        .lines()
        .map(|line| line.rsplit(' ').next().unwrap().parse().unwrap())
        .collect();
    let expected: Vec<i64> = (0..PULSES).map(|i| base + i * 100_000_000).collect();
    assert_eq!(timestamps, expected);
}

/// Undelivered content survives shutdown in the recovery file
#[tokio::test]
async fn test_shutdown_persists_undelivered_batch() {
    let path = std::env::temp_dir().join(format!("recovery-{}.txt", std::process::id()));
    std::fs::remove_file(&path).ok();

    let queue = PendingPulseQueue::new();
    let transport = ScriptedTransport::new(vec![], 503);
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(new_loop(&queue, transport.clone()).run(stop_rx));

    let base = at(2024, 3, 12, 12, 0, 0);
    queue.push(PulseTimestamp::from_nanos(base));
    queue.push(PulseTimestamp::from_nanos(base + 1_000_000_000));
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop_tx.send(true).unwrap();

    let batch = handle.await.unwrap();
    assert_eq!(persist_batch(&path, &batch).unwrap(), 2);

    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(
        content,
        format!(
            "energy,meter=181 value=1 {}\nenergy,meter=181 value=1,power=3600.00 {}\n",
            base,
            base + 1_000_000_000
        )
    );
    assert!(!transport.sent().is_empty());
    std::fs::remove_file(&path).ok();
}

/// Accepted loss window: pulses recorded after the loop has stopped are not
/// part of the returned batch and are not persisted.
#[tokio::test]
async fn test_pulses_after_stop_are_not_persisted() {
    let queue = PendingPulseQueue::new();
    let transport = ScriptedTransport::new(vec![], 204);
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(new_loop(&queue, transport).run(stop_rx));

    stop_tx.send(true).unwrap();
    let batch: MeasurementBatch = handle.await.unwrap();
    queue.push(PulseTimestamp::from_nanos(at(2024, 3, 12, 12, 0, 0)));

    assert!(batch.is_empty());
    assert_eq!(queue.len(), 1);
}
