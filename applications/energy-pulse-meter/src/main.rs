use chrono::Local;
use energy_pulse_meter::config::Config;
use energy_pulse_meter::delivery::{DeliveryService, HttpTransport};
use energy_pulse_meter::event_loop::EventLoop;
use energy_pulse_meter::pulse::{PendingPulseQueue, PulseIntervalTracker};
use energy_pulse_meter::{gpio, shutdown};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let default_level = match std::env::args().nth(1).as_deref() {
        Some("debug") => "debug",
        _ => "info",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cfg = Config::from_env()?;
    info!(
        endpoint = %cfg.influx.address,
        series = %cfg.influx.series,
        energy_per_pulse = cfg.meter.energy_per_pulse,
        "loaded config"
    );

    let queue = PendingPulseQueue::new();
    let transport = HttpTransport::from_config(&cfg.influx)?;
    let event_loop = EventLoop::new(
        queue.clone(),
        PulseIntervalTracker::new(&cfg, Local),
        DeliveryService::new(transport),
        cfg.idle_interval(),
    );

    let (button_tx, button_rx) = mpsc::channel(1);
    let pulse_watcher = gpio::spawn_pulse_watcher(&cfg.gpio, queue.clone())?;
    let button_watcher = gpio::spawn_button_watcher(&cfg.gpio, button_tx)?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let loop_handle = tokio::spawn(event_loop.run(stop_rx));
    info!(
        pulse_pin = cfg.gpio.pulse_pin,
        button_pin = cfg.gpio.button_pin,
        "waiting for pulses"
    );

    match shutdown::wait_for_trigger(button_rx).await {
        Ok(trigger) => info!("halting due to {} event", trigger),
        Err(e) => error!(error = %e, "signal handling failed; halting"),
    }

    // no new pulses from here on
    pulse_watcher.stop().await;
    button_watcher.stop().await;
    let _ = stop_tx.send(true);

    match loop_handle.await {
        Ok(batch) => {
            if let Err(e) = shutdown::persist_batch(&cfg.recovery_file, &batch) {
                error!(
                    path = %cfg.recovery_file.display(),
                    records = batch.len(),
                    error = %e,
                    "failed to persist unsent measurements"
                );
            }
        }
        Err(e) => error!(error = %e, "event loop task failed; unsent measurements lost"),
    }

    info!("shutdown complete");
    Ok(())
}
