//! Connection manager: a dedicated thread running a single-threaded tokio
//! runtime that owns the radio. Request threads hand it [`Job`]s and block
//! on the reply.

use std::future::Future;
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::{ConnectCause, ConnectError, ScanError};
use crate::signal::{DeviceRecord, Job};

/// Scan and connect primitives of the control plane's radio.
pub trait Radio: Send + 'static {
    fn scan(&mut self, window: Duration) -> impl Future<Output = Result<Vec<DeviceRecord>, ScanError>>;

    fn connect(&mut self, address: &str, timeout: Duration) -> impl Future<Output = Result<(), ConnectError>>;
}

#[derive(Debug, Clone, Copy)]
pub struct ManagerSettings {
    pub scan_window: Duration,
    pub connect_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            scan_window: Duration::from_secs(5),
            connect_timeout: crate::session::CONNECT_TIMEOUT,
        }
    }
}

pub struct ConnectionManager {
    jobs: mpsc::UnboundedSender<Job>,
    thread: Option<JoinHandle<()>>,
    settings: ManagerSettings,
}

impl ConnectionManager {
    /// Spawn the loop thread. `make_radio` runs on that thread, so radios
    /// that need a runtime at construction are fine.
    pub fn start<R, F>(make_radio: F, settings: ManagerSettings) -> io::Result<Self>
    where
        R: Radio,
        F: FnOnce() -> R + Send + 'static,
    {
        let (jobs, rx) = mpsc::unbounded_channel();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let thread = thread::Builder::new()
            .name("ble-loop".into())
            .spawn(move || {
                let radio = make_radio();
                runtime.block_on(run_loop(radio, rx));
                tracing::info!("Connection manager stopped");
            })?;

        Ok(Self {
            jobs,
            thread: Some(thread),
            settings,
        })
    }

    /// Discover nearby devices. Blocks the calling thread; must not be
    /// called from inside an async context.
    pub fn scan(&self) -> Result<Vec<DeviceRecord>, ScanError> {
        let (reply, rx) = oneshot::channel();
        let job = Job::Scan {
            window: self.settings.scan_window,
            reply,
        };
        if self.jobs.send(job).is_err() {
            return Err(ScanError::ManagerStopped);
        }
        rx.blocking_recv().unwrap_or(Err(ScanError::ManagerStopped))
    }

    /// Connect to `address`. Blocks the calling thread like [`Self::scan`].
    pub fn connect(&self, address: &str) -> Result<(), ConnectError> {
        let stopped = || ConnectError::new(address, ConnectCause::ManagerStopped);
        let (reply, rx) = oneshot::channel();
        let job = Job::Connect {
            address: address.to_string(),
            timeout: self.settings.connect_timeout,
            reply,
        };
        if self.jobs.send(job).is_err() {
            return Err(stopped());
        }
        rx.blocking_recv().unwrap_or_else(|_| Err(stopped()))
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // Closing the channel ends the loop once the current job finishes.
        let (closed, _) = mpsc::unbounded_channel();
        drop(std::mem::replace(&mut self.jobs, closed));
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Connection manager thread panicked");
            }
        }
    }
}

async fn run_loop<R: Radio>(mut radio: R, mut jobs: mpsc::UnboundedReceiver<Job>) {
    tracing::info!("Connection manager started");

    while let Some(job) = jobs.recv().await {
        match job {
            Job::Scan { window, reply } => {
                tracing::info!(window_secs = window.as_secs(), "Scanning for Bluetooth devices");
                let result = radio.scan(window).await;
                match &result {
                    Ok(devices) => tracing::info!(found = devices.len(), "Scan complete"),
                    Err(e) => tracing::warn!(error = %e, "Scan failed"),
                }
                let _ = reply.send(result);
            }
            Job::Connect {
                address,
                timeout,
                reply,
            } => {
                tracing::info!(%address, "Attempting to connect");
                let result = radio.connect(&address, timeout).await;
                match &result {
                    Ok(()) => tracing::info!(%address, "Connected"),
                    Err(e) => tracing::warn!(error = %e, "Connection failed"),
                }
                let _ = reply.send(result);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc as std_mpsc, Arc, Mutex};
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::Radio;
    use crate::error::{ConnectCause, ConnectError, ScanError};
    use crate::signal::DeviceRecord;

    /// In-memory radio. Scans can be held open until the test releases them.
    #[derive(Default)]
    pub struct FakeRadio {
        pub devices: Vec<DeviceRecord>,
        pub unreachable: Vec<String>,
        pub fail_scans: bool,
        pub scan_started: Option<std_mpsc::Sender<()>>,
        pub scan_release: Option<mpsc::UnboundedReceiver<()>>,
        pub in_flight: Arc<AtomicUsize>,
        pub max_in_flight: Arc<AtomicUsize>,
        pub connects: Arc<Mutex<Vec<String>>>,
    }

    impl FakeRadio {
        fn enter(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        }

        fn leave(&self) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn device(address: &str, name: &str, rssi: i16) -> DeviceRecord {
        DeviceRecord {
            address: address.to_string(),
            display_name: name.to_string(),
            signal_strength: Some(rssi),
        }
    }

    impl Radio for FakeRadio {
        async fn scan(&mut self, _window: Duration) -> Result<Vec<DeviceRecord>, ScanError> {
            self.enter();
            if let Some(started) = &self.scan_started {
                let _ = started.send(());
            }
            if let Some(release) = &mut self.scan_release {
                release.recv().await;
            }
            self.leave();
            if self.fail_scans {
                return Err(ScanError::AdapterUnavailable);
            }
            Ok(self.devices.clone())
        }

        async fn connect(&mut self, address: &str, _timeout: Duration) -> Result<(), ConnectError> {
            self.enter();
            self.connects.lock().unwrap().push(address.to_string());
            self.leave();
            if self.unreachable.iter().any(|a| a == address) {
                return Err(ConnectError::new(address, ConnectCause::NotFound));
            }
            Ok(())
        }
    }
}
