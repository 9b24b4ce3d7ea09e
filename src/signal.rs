use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::{ConnectError, ScanError};

/// A device seen during discovery. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    pub address: String,
    #[serde(rename = "name")]
    pub display_name: String,
    #[serde(rename = "rssi")]
    pub signal_strength: Option<i16>,
}

/// Work posted from request threads onto the BLE loop thread. Each job
/// carries the slot its caller is blocked on.
pub enum Job {
    Scan {
        window: Duration,
        reply: oneshot::Sender<Result<Vec<DeviceRecord>, ScanError>>,
    },
    Connect {
        address: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<(), ConnectError>>,
    },
}
