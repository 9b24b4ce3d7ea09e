//! Shared helpers for the HTTP integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;

use pulseglow::control::ControlPlane;
use pulseglow::error::{ConnectCause, ConnectError, ScanError};
use pulseglow::manager::{ConnectionManager, ManagerSettings, Radio};
use pulseglow::server::build_router;
use pulseglow::signal::DeviceRecord;
use pulseglow::worker::{WorkerCommand, WorkerSupervisor};

/// Radio that answers from memory. A scan can be held open until the test
/// sends on the release channel.
#[derive(Default)]
pub struct StubRadio {
    pub devices: Vec<DeviceRecord>,
    pub unreachable: Vec<String>,
    pub scan_started: Option<mpsc::UnboundedSender<()>>,
    pub scan_release: Option<mpsc::UnboundedReceiver<()>>,
    pub connects: Arc<Mutex<Vec<String>>>,
}

impl Radio for StubRadio {
    async fn scan(&mut self, _window: Duration) -> Result<Vec<DeviceRecord>, ScanError> {
        if let Some(started) = &self.scan_started {
            let _ = started.send(());
        }
        if let Some(release) = &mut self.scan_release {
            release.recv().await;
        }
        Ok(self.devices.clone())
    }

    async fn connect(&mut self, address: &str, _timeout: Duration) -> Result<(), ConnectError> {
        self.connects.lock().unwrap().push(address.to_string());
        if self.unreachable.iter().any(|a| a == address) {
            return Err(ConnectError::new(address, ConnectCause::NotFound));
        }
        Ok(())
    }
}

pub fn device(address: &str, name: &str, rssi: Option<i16>) -> DeviceRecord {
    DeviceRecord {
        address: address.to_string(),
        display_name: name.to_string(),
        signal_strength: rssi,
    }
}

/// A worker stand-in that sleeps until it is signalled.
pub fn sleeper() -> WorkerCommand {
    WorkerCommand::new("sh").arg("-c").arg("exec sleep 30").arg("worker")
}

pub fn build_test_app(radio: StubRadio, zones_path: &Path) -> (Router, Arc<ControlPlane>) {
    let manager = ConnectionManager::start(move || radio, ManagerSettings::default()).unwrap();
    let supervisor = WorkerSupervisor::new(sleeper(), Duration::from_secs(5));
    let plane = Arc::new(ControlPlane::new(manager, supervisor, zones_path));
    (build_router(plane.clone()), plane)
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post_raw(app: Router, uri: &str, body: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: &Value) -> Response<Body> {
    post_raw(app, uri, &body.to_string()).await
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
