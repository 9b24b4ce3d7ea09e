use std::time::Duration;

use futures::future;
use futures::StreamExt;
use tokio::time::Instant;

use uuid::Uuid;
use btleplug::api::{Central, CharPropFlags, Characteristic, Manager as _, Peripheral, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};

use crate::error::{ConnectCause, ConnectError, ScanError, SessionError, SubscriptionError};
use crate::manager::Radio;
use crate::session::{HeartRateSensor, NotificationStream};
use crate::signal::DeviceRecord;


pub const HEART_RATE_MEASUREMENT_UUID: Uuid = Uuid::from_u128(0x00002a3700001000800000805f9b34fb);

/// How often the adapter's peripheral list is checked while looking for a
/// specific address.
const LOCATE_POLL: Duration = Duration::from_millis(250);


/// First adapter reported by the platform, or `None` if there is none.
async fn first_adapter() -> btleplug::Result<Option<Adapter>> {
    let manager = Manager::new().await?;
    let adapter_list = manager.adapters().await?;

    for adapter in adapter_list.iter() {
        let info = adapter.adapter_info().await.unwrap_or("No name adapter".to_string());
        tracing::debug!(adapter = %info, "Found Bluetooth adapter");
    }

    Ok(adapter_list.into_iter().next())
}

async fn find_peripheral(adapter: &Adapter, address: &str) -> btleplug::Result<Option<PlatformPeripheral>> {
    let peripherals = adapter.peripherals().await?;
    Ok(peripherals
        .into_iter()
        .find(|p| p.address().to_string().eq_ignore_ascii_case(address)))
}

/// Scan until `address` shows up in the adapter's peripheral list.
async fn locate(adapter: &Adapter, address: &str) -> btleplug::Result<PlatformPeripheral> {
    if let Some(peripheral) = find_peripheral(adapter, address).await? {
        return Ok(peripheral);
    }

    adapter.start_scan(ScanFilter::default()).await?;
    loop {
        tokio::time::sleep(LOCATE_POLL).await;
        if let Some(peripheral) = find_peripheral(adapter, address).await? {
            return Ok(peripheral);
        }
    }
}

/// Locate and connect to `address` within `timeout`. Peripherals that are
/// already connected (e.g. handed off by the control plane) are reused.
async fn connect_peripheral(adapter: &Adapter, address: &str, timeout: Duration) -> Result<PlatformPeripheral, ConnectError> {
    let rejected = |e: btleplug::Error| ConnectError::new(address, ConnectCause::Rejected(e.to_string()));
    let deadline = Instant::now() + timeout;

    let located = tokio::time::timeout_at(deadline, locate(adapter, address)).await;
    if let Err(e) = adapter.stop_scan().await {
        tracing::debug!(error = %e, "Failed to stop scan");
    }
    let peripheral = match located {
        Ok(result) => result.map_err(rejected)?,
        Err(_) => return Err(ConnectError::new(address, ConnectCause::NotFound)),
    };

    if !peripheral.is_connected().await.map_err(rejected)? {
        tokio::time::timeout_at(deadline, peripheral.connect())
            .await
            .map_err(|_| ConnectError::new(address, ConnectCause::Timeout(timeout)))?
            .map_err(rejected)?;
    } else {
        tracing::info!(%address, "Peripheral already connected, reusing link");
    }

    Ok(peripheral)
}

/// The control plane's radio, backed by the first system adapter.
#[derive(Default)]
pub struct BtleRadio {
    adapter: Option<Adapter>,
    held: Option<PlatformPeripheral>,
}

impl BtleRadio {
    async fn adapter(&mut self) -> btleplug::Result<Option<Adapter>> {
        if self.adapter.is_none() {
            self.adapter = first_adapter().await?;
        }
        Ok(self.adapter.clone())
    }

    async fn release_held(&mut self) {
        let Some(peripheral) = self.held.take() else { return; };
        if let Err(e) = peripheral.disconnect().await {
            tracing::warn!(address = %peripheral.address(), error = %e, "Failed to release peripheral");
        }
    }
}

impl Radio for BtleRadio {
    async fn scan(&mut self, window: Duration) -> Result<Vec<DeviceRecord>, ScanError> {
        let failed = |e: btleplug::Error| ScanError::Failed(e.to_string());
        let adapter = self.adapter().await.map_err(failed)?.ok_or(ScanError::AdapterUnavailable)?;

        adapter.start_scan(ScanFilter::default()).await.map_err(failed)?;
        tokio::time::sleep(window).await;
        let peripherals = adapter.peripherals().await;
        if let Err(e) = adapter.stop_scan().await {
            tracing::debug!(error = %e, "Failed to stop scan");
        }

        // peripherals may include devices that are no longer advertising
        let mut devices = vec![];
        for peripheral in peripherals.map_err(failed)? {
            let properties = peripheral.properties().await.map_err(failed)?;
            let (display_name, signal_strength) = match properties {
                Some(properties) => (properties.local_name, properties.rssi),
                None => (None, None),
            };
            devices.push(DeviceRecord {
                address: peripheral.address().to_string(),
                display_name: display_name.unwrap_or_else(|| "Unknown".to_string()),
                signal_strength,
            });
        }

        Ok(devices)
    }

    async fn connect(&mut self, address: &str, timeout: Duration) -> Result<(), ConnectError> {
        let adapter = self
            .adapter()
            .await
            .map_err(|e| ConnectError::new(address, ConnectCause::Rejected(e.to_string())))?
            .ok_or_else(|| ConnectError::new(address, ConnectCause::AdapterUnavailable))?;

        let peripheral = connect_peripheral(&adapter, address, timeout).await?;

        let same_device = self
            .held
            .as_ref()
            .is_some_and(|held| held.address() == peripheral.address());
        if !same_device {
            self.release_held().await;
        }
        self.held = Some(peripheral);
        Ok(())
    }
}

/// The worker's heart-rate sensor over btleplug.
pub struct BtleSensor {
    timeout: Duration,
    peripheral: Option<PlatformPeripheral>,
    characteristic: Option<Characteristic>,
}

impl BtleSensor {
    pub fn new(timeout: Duration) -> Self {
        BtleSensor {
            timeout,
            peripheral: None,
            characteristic: None,
        }
    }
}

impl HeartRateSensor for BtleSensor {
    async fn connect(&mut self, address: &str) -> Result<(), ConnectError> {
        let adapter = first_adapter()
            .await
            .map_err(|e| ConnectError::new(address, ConnectCause::Rejected(e.to_string())))?
            .ok_or_else(|| ConnectError::new(address, ConnectCause::AdapterUnavailable))?;

        let peripheral = connect_peripheral(&adapter, address, self.timeout).await?;

        tracing::debug!(%address, "Discovering services");
        peripheral
            .discover_services()
            .await
            .map_err(|e| ConnectError::new(address, ConnectCause::Rejected(e.to_string())))?;

        self.peripheral = Some(peripheral);
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<NotificationStream, SubscriptionError> {
        let notify_failed = |e: btleplug::Error| SubscriptionError::NotifyFailed(e.to_string());
        let peripheral = self
            .peripheral
            .as_ref()
            .ok_or_else(|| SubscriptionError::NotifyFailed("not connected".to_string()))?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == HEART_RATE_MEASUREMENT_UUID && c.properties.contains(CharPropFlags::NOTIFY))
            .ok_or(SubscriptionError::CharacteristicMissing)?;

        let notifications = peripheral.notifications().await.map_err(notify_failed)?;
        tracing::debug!(uuid = %characteristic.uuid, "Subscribing to characteristic");
        peripheral.subscribe(&characteristic).await.map_err(notify_failed)?;
        self.characteristic = Some(characteristic);

        let heart_rates = notifications.filter_map(|data| {
            future::ready((data.uuid == HEART_RATE_MEASUREMENT_UUID).then_some(data.value))
        });
        Ok(Box::pin(heart_rates))
    }

    async fn unsubscribe(&mut self) -> Result<(), SessionError> {
        let (Some(peripheral), Some(characteristic)) = (&self.peripheral, self.characteristic.take()) else {
            return Ok(());
        };
        peripheral
            .unsubscribe(&characteristic)
            .await
            .map_err(|e| SessionError::Ble(e.to_string()))
    }

    async fn disconnect(&mut self) -> Result<(), SessionError> {
        let Some(peripheral) = self.peripheral.take() else { return Ok(()); };
        peripheral
            .disconnect()
            .await
            .map_err(|e| SessionError::Ble(e.to_string()))
    }
}
