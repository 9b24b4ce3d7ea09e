use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "pulseglow", version, about = "Heart-rate zones on an LED strip")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the control plane HTTP server.
    Serve(ServerConfig),
    /// Run a monitoring worker bound to one sensor.
    Monitor(MonitorConfig),
}

#[derive(Debug, Clone, Args)]
pub struct ServerConfig {
    /// Bind address.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Bind port.
    #[arg(long, env = "PORT", default_value_t = 5000)]
    pub port: u16,

    /// Shared zone artifact written by `POST /zones`.
    #[arg(long = "zones", env = "ZONES_PATH", default_value = "zones.json")]
    pub zones_path: PathBuf,

    /// Discovery window for `GET /devices`.
    #[arg(long, env = "SCAN_WINDOW_SECS", default_value_t = 5)]
    pub scan_window_secs: u64,

    /// Timeout for each connection attempt.
    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value_t = 30)]
    pub connect_timeout_secs: u64,

    /// How long a worker gets to tear down before it is killed.
    #[arg(long, env = "WORKER_STOP_TIMEOUT_SECS", default_value_t = 5)]
    pub worker_stop_timeout_secs: u64,
}

impl ServerConfig {
    pub fn scan_window(&self) -> Duration {
        Duration::from_secs(self.scan_window_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn worker_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_stop_timeout_secs)
    }
}

#[derive(Debug, Clone, Args)]
pub struct MonitorConfig {
    /// Bluetooth address of the heart rate sensor.
    #[arg(long)]
    pub address: String,

    /// Zone artifact to load at startup.
    #[arg(long = "zones", env = "ZONES_PATH", default_value = "zones.json")]
    pub zones_path: PathBuf,

    /// Number of LEDs on the strip.
    #[arg(long, env = "LED_COUNT", default_value_t = 20)]
    pub leds: usize,

    /// Brightness applied to every zone color, between 0 and 1.
    #[arg(long, env = "LED_BRIGHTNESS", default_value_t = 0.05, value_parser = parse_brightness)]
    pub brightness: f32,

    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value_t = 30)]
    pub connect_timeout_secs: u64,

    /// spidev device driving a WS2812 strip, e.g. /dev/spidev0.0.
    #[cfg(feature = "spi")]
    #[arg(long, env = "LED_SPI_DEVICE")]
    pub spi_device: Option<String>,

    /// Use generated heart rates instead of a real sensor.
    #[arg(long)]
    pub simulate: bool,
}

impl MonitorConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn parse_brightness(raw: &str) -> Result<f32, String> {
    let value: f32 = raw.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("brightness must be between 0 and 1, got {value}"))
    }
}
