//! Control plane state: the exclusion gate, the connection manager, the
//! worker supervisor and the last submitted zone payload.
//!
//! Every operation here blocks; HTTP handlers call them from the blocking
//! thread pool.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;

use crate::error::{ApiError, ApiResult};
use crate::manager::ConnectionManager;
use crate::signal::DeviceRecord;
use crate::worker::{WorkerStatus, WorkerSupervisor};
use crate::zones::{self, ZoneTable};

pub const SCAN_BUSY: &str = "scan in progress";
pub const CONNECT_BUSY: &str = "connect in progress";
pub const ADDRESS_REQUIRED: &str = "Device address is required.";
pub const INVALID_ZONES: &str = "Invalid data format";

pub struct ControlPlane {
    manager: ConnectionManager,
    gate: Mutex<()>,
    worker: Mutex<WorkerSupervisor>,
    zones: Mutex<Option<Value>>,
    zones_path: PathBuf,
}

impl ControlPlane {
    pub fn new(manager: ConnectionManager, worker: WorkerSupervisor, zones_path: impl Into<PathBuf>) -> Self {
        Self {
            manager,
            gate: Mutex::new(()),
            worker: Mutex::new(worker),
            zones: Mutex::new(None),
            zones_path: zones_path.into(),
        }
    }

    pub fn zones_path(&self) -> &Path {
        &self.zones_path
    }

    /// Take the exclusion gate without waiting; a held gate means another
    /// scan or connect is in flight.
    fn try_gate(&self, busy: &'static str) -> ApiResult<MutexGuard<'_, ()>> {
        match self.gate.try_lock() {
            Ok(guard) => Ok(guard),
            // The gate guards no data, so a panic while holding it leaves
            // nothing inconsistent.
            Err(std::sync::TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(std::sync::TryLockError::WouldBlock) => Err(ApiError::Busy(busy)),
        }
    }

    fn supervisor(&self) -> MutexGuard<'_, WorkerSupervisor> {
        self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn list_devices(&self) -> ApiResult<Vec<DeviceRecord>> {
        let _gate = self.try_gate(SCAN_BUSY)?;
        Ok(self.manager.scan()?)
    }

    /// Connect to `address` and, only if that succeeds, replace the
    /// monitoring worker with one bound to it.
    pub fn connect(&self, address: Option<&str>) -> ApiResult<String> {
        let address = address
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or(ApiError::Validation(ADDRESS_REQUIRED))?;

        let _gate = self.try_gate(CONNECT_BUSY)?;
        self.manager.connect(address)?;

        let status = self.supervisor().replace(address).inspect_err(|e| {
            tracing::error!(%address, error = %e, "No monitoring worker is running");
        })?;
        tracing::info!(%address, pid = status.pid, "Started LED monitoring");

        Ok(format!("Connected to {address} and started LED monitoring."))
    }

    /// Store the payload and overwrite the zone artifact. Workers pick it
    /// up on their next start.
    pub fn set_zones(&self, payload: Value) -> ApiResult<()> {
        if !payload.is_object() {
            return Err(ApiError::Validation(INVALID_ZONES));
        }

        match ZoneTable::from_payload(&payload) {
            Some(table) => tracing::info!(zones = table.len(), "Received heart rate zones"),
            None => tracing::warn!("Zone payload has no \"zones\" list"),
        }

        zones::write_artifact(&self.zones_path, &payload)?;
        *self.zones.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(payload);
        Ok(())
    }

    pub fn zones(&self) -> Option<Value> {
        self.zones
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn worker_status(&self) -> Option<WorkerStatus> {
        self.supervisor().status()
    }

    /// Stop the worker. Called once on server shutdown.
    pub fn shutdown(&self) -> ApiResult<()> {
        Ok(self.supervisor().stop()?)
    }
}
