//! The monitoring worker process: one session, one strip, until signalled.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::ble::BtleSensor;
use crate::config::MonitorConfig;
use crate::fake::FakeSensor;
use crate::led::{LedSink, LedStrip, TraceSink};
use crate::mapper::HeartRateMapper;
use crate::session::{HeartRateSensor, Session};
use crate::zones::ZoneTable;

pub async fn run(config: MonitorConfig) -> Result<()> {
    tracing::info!(address = %config.address, "Starting monitoring worker");

    let zones = ZoneTable::load_or_empty(&config.zones_path);
    let strip = LedStrip::new(open_sink(&config)?, config.leds);
    let mapper = HeartRateMapper::new(zones, config.brightness, strip);

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    if config.simulate {
        drive(FakeSensor::default(), mapper, &config, &cancel).await
    } else {
        let sensor = BtleSensor::new(config.connect_timeout());
        drive(sensor, mapper, &config, &cancel).await
    }
}

async fn drive<T, S>(sensor: T, mapper: HeartRateMapper<S>, config: &MonitorConfig, cancel: &CancellationToken) -> Result<()>
where
    T: HeartRateSensor,
    S: LedSink,
{
    let mut session = Session::new(sensor, mapper).with_connect_timeout(config.connect_timeout());
    session.run(&config.address, cancel).await?;
    tracing::info!("Monitoring worker finished");
    Ok(())
}

fn open_sink(config: &MonitorConfig) -> Result<Box<dyn LedSink + Send>> {
    #[cfg(feature = "spi")]
    if let Some(device) = &config.spi_device {
        tracing::info!(%device, leds = config.leds, "Driving WS2812 strip over SPI");
        return Ok(Box::new(crate::led::SpiSink::open(device)?));
    }

    tracing::info!(leds = config.leds, "No LED hardware configured, logging colors");
    Ok(Box::new(TraceSink))
}

/// Cancel on SIGINT or SIGTERM (the control plane stops workers with
/// SIGTERM).
async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT, stopping heart rate monitoring"),
        () = terminate => tracing::info!("Received SIGTERM, stopping heart rate monitoring"),
    }
    cancel.cancel();
}
