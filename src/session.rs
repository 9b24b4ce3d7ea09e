//! One heart-rate sensor, end to end: connect, subscribe, stream samples
//! into the mapper, and tear down on cancellation or failure.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{ConnectCause, ConnectError, SessionError, SubscriptionError};
use crate::led::LedSink;
use crate::mapper::{heart_rate_from_payload, HeartRateMapper};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound for each teardown step; a vanished device must not keep the
/// worker alive.
const TEARDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(3);

/// Raw heart-rate measurement payloads.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// The radio side of a session. Implemented over btleplug and by the
/// simulator.
pub trait HeartRateSensor {
    fn connect(&mut self, address: &str) -> impl Future<Output = Result<(), ConnectError>> + Send;

    fn subscribe(
        &mut self,
    ) -> impl Future<Output = Result<NotificationStream, SubscriptionError>> + Send;

    fn unsubscribe(&mut self) -> impl Future<Output = Result<(), SessionError>> + Send;

    fn disconnect(&mut self) -> impl Future<Output = Result<(), SessionError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Subscribed,
    Streaming,
    Disconnecting,
    Closed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Subscribed => "subscribed",
            SessionState::Streaming => "streaming",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub struct Session<T, S> {
    sensor: T,
    mapper: HeartRateMapper<S>,
    connect_timeout: Duration,
    state: SessionState,
    connected: bool,
    subscribed: bool,
}

impl<T: HeartRateSensor, S: LedSink> Session<T, S> {
    pub fn new(sensor: T, mapper: HeartRateMapper<S>) -> Self {
        Self {
            sensor,
            mapper,
            connect_timeout: CONNECT_TIMEOUT,
            state: SessionState::Idle,
            connected: false,
            subscribed: false,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session until `cancel` fires or a fatal error occurs.
    ///
    /// Teardown (unsubscribe, blank strip, disconnect) runs on every exit
    /// path. Cancellation ends in `Closed` and `Ok(())`; errors end in
    /// `Failed`.
    pub async fn run(&mut self, address: &str, cancel: &CancellationToken) -> Result<(), SessionError> {
        let outcome = self.stream(address, cancel).await;
        self.teardown().await;

        match outcome {
            Ok(()) => {
                self.transition(SessionState::Closed);
                Ok(())
            }
            Err(e) => {
                tracing::error!(%address, error = %e, "Monitoring session failed");
                self.transition(SessionState::Failed);
                Err(e)
            }
        }
    }

    async fn stream(&mut self, address: &str, cancel: &CancellationToken) -> Result<(), SessionError> {
        self.transition(SessionState::Connecting);
        let timeout = self.connect_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            result = tokio::time::timeout(timeout, self.sensor.connect(address)) => {
                result.map_err(|_| ConnectError::new(address, ConnectCause::Timeout(timeout)))??;
            }
        }
        self.connected = true;
        tracing::info!(%address, "Connected to heart rate sensor");

        let mut notifications = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            result = self.sensor.subscribe() => result?,
        };
        self.subscribed = true;
        self.transition(SessionState::Subscribed);
        tracing::info!(%address, "Monitoring heart rate");

        loop {
            let payload = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = notifications.next() => next.ok_or(SessionError::StreamClosed)?,
            };

            if self.state == SessionState::Subscribed {
                self.transition(SessionState::Streaming);
            }

            let Some(heart_rate) = heart_rate_from_payload(&payload) else {
                tracing::warn!(?payload, "Ignoring short heart rate notification");
                continue;
            };
            if let Err(e) = self.mapper.on_sample(heart_rate) {
                tracing::warn!(heart_rate, error = %e, "Failed to update LEDs");
            }
        }
    }

    async fn teardown(&mut self) {
        self.transition(SessionState::Disconnecting);

        if self.subscribed {
            match tokio::time::timeout(TEARDOWN_STEP_TIMEOUT, self.sensor.unsubscribe()).await {
                Ok(Ok(())) => tracing::info!("Unsubscribed from heart rate notifications"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Failed to unsubscribe"),
                Err(_) => tracing::warn!("Timed out unsubscribing"),
            }
            self.subscribed = false;
        }

        if let Err(e) = self.mapper.blank() {
            tracing::warn!(error = %e, "Failed to blank LEDs");
        }

        if self.connected {
            match tokio::time::timeout(TEARDOWN_STEP_TIMEOUT, self.sensor.disconnect()).await {
                Ok(Ok(())) => tracing::info!("Disconnected from heart rate sensor"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Failed to disconnect"),
                Err(_) => tracing::warn!("Timed out disconnecting"),
            }
            self.connected = false;
        }
    }

    fn transition(&mut self, next: SessionState) {
        tracing::info!(from = %self.state, to = %next, "Session state");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures::channel::mpsc;

    use super::*;
    use crate::led::testing::MemorySink;
    use crate::led::{LedStrip, Rgb};
    use crate::zones::{ZoneEntry, ZoneTable};

    #[derive(Default)]
    struct Calls {
        connects: usize,
        unsubscribes: usize,
        disconnects: usize,
    }

    /// Sensor double fed from a channel of synthetic notifications.
    struct ScriptedSensor {
        notifications: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
        connect_hangs: bool,
        connect_error: Option<ConnectCause>,
        subscribe_fails: bool,
        calls: Arc<Mutex<Calls>>,
    }

    impl ScriptedSensor {
        fn new(notifications: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
            Self {
                notifications: Some(notifications),
                connect_hangs: false,
                connect_error: None,
                subscribe_fails: false,
                calls: Arc::default(),
            }
        }
    }

    impl HeartRateSensor for ScriptedSensor {
        async fn connect(&mut self, address: &str) -> Result<(), ConnectError> {
            self.calls.lock().unwrap().connects += 1;
            if self.connect_hangs {
                futures::future::pending::<()>().await;
            }
            match self.connect_error.clone() {
                Some(cause) => Err(ConnectError::new(address, cause)),
                None => Ok(()),
            }
        }

        async fn subscribe(&mut self) -> Result<NotificationStream, SubscriptionError> {
            if self.subscribe_fails {
                return Err(SubscriptionError::CharacteristicMissing);
            }
            let rx = self.notifications.take().expect("subscribed twice");
            Ok(Box::pin(rx))
        }

        async fn unsubscribe(&mut self) -> Result<(), SessionError> {
            self.calls.lock().unwrap().unsubscribes += 1;
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), SessionError> {
            self.calls.lock().unwrap().disconnects += 1;
            Ok(())
        }
    }

    fn scenario_zones() -> ZoneTable {
        ZoneTable::new(vec![
            ZoneEntry::new(1, 0, 60, Some(Rgb::from_u32(0xFFC0CB))).unwrap(),
            ZoneEntry::new(2, 61, 65, Some(Rgb::from_u32(0x0000FF))).unwrap(),
            ZoneEntry::new(5, 76, 999, Some(Rgb::from_u32(0xFF0000))).unwrap(),
        ])
    }

    fn session(sensor: ScriptedSensor, sink: &MemorySink) -> Session<ScriptedSensor, MemorySink> {
        let mapper = HeartRateMapper::new(scenario_zones(), 1.0, LedStrip::new(sink.clone(), 20));
        Session::new(sensor, mapper)
    }

    async fn wait_for_fills(sink: &MemorySink, count: usize) {
        while sink.fills().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn cancellation_mid_stream_blanks_and_unsubscribes() {
        let (tx, rx) = mpsc::unbounded();
        let sensor = ScriptedSensor::new(rx);
        let calls = sensor.calls.clone();
        let sink = MemorySink::default();
        let mut session = session(sensor, &sink);
        let cancel = CancellationToken::new();

        let driver = async {
            tx.unbounded_send(vec![0x00, 63]).unwrap();
            tx.unbounded_send(vec![0x00, 120]).unwrap();
            wait_for_fills(&sink, 2).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(session.run("AA:BB", &cancel), driver);

        assert!(result.is_ok());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            sink.colors(),
            vec![Rgb::from_u32(0x0000FF), Rgb::from_u32(0xFF0000), Rgb::OFF]
        );
        let calls = calls.lock().unwrap();
        assert_eq!(calls.unsubscribes, 1);
        assert_eq!(calls.disconnects, 1);
    }

    #[tokio::test]
    async fn cancellation_while_connecting_still_blanks() {
        let (_tx, rx) = mpsc::unbounded();
        let mut sensor = ScriptedSensor::new(rx);
        sensor.connect_hangs = true;
        let calls = sensor.calls.clone();
        let sink = MemorySink::default();
        let mut session = session(sensor, &sink);
        let cancel = CancellationToken::new();

        let driver = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(session.run("AA:BB", &cancel), driver);

        assert!(result.is_ok());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(sink.colors(), vec![Rgb::OFF]);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.connects, 1);
        assert_eq!(calls.unsubscribes, 0);
        assert_eq!(calls.disconnects, 0);
    }

    #[tokio::test]
    async fn connect_timeout_fails_session() {
        let (_tx, rx) = mpsc::unbounded();
        let mut sensor = ScriptedSensor::new(rx);
        sensor.connect_hangs = true;
        let sink = MemorySink::default();
        let mut session = session(sensor, &sink).with_connect_timeout(Duration::from_millis(20));

        let err = session
            .run("AA:BB", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SessionError::Connect(ConnectError {
                cause: ConnectCause::Timeout(_),
                ..
            })
        ));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(sink.colors(), vec![Rgb::OFF]);
    }

    #[tokio::test]
    async fn connect_error_fails_without_retry() {
        let (_tx, rx) = mpsc::unbounded();
        let mut sensor = ScriptedSensor::new(rx);
        sensor.connect_error = Some(ConnectCause::NotFound);
        let calls = sensor.calls.clone();
        let sink = MemorySink::default();
        let mut session = session(sensor, &sink);

        let err = session
            .run("AA:BB", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Connect(_)));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(calls.lock().unwrap().connects, 1);
    }

    #[tokio::test]
    async fn subscription_failure_is_fatal() {
        let (_tx, rx) = mpsc::unbounded();
        let mut sensor = ScriptedSensor::new(rx);
        sensor.subscribe_fails = true;
        let calls = sensor.calls.clone();
        let sink = MemorySink::default();
        let mut session = session(sensor, &sink);

        let err = session
            .run("AA:BB", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SessionError::Subscription(SubscriptionError::CharacteristicMissing)
        ));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(sink.colors(), vec![Rgb::OFF]);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.unsubscribes, 0);
        assert_eq!(calls.disconnects, 1);
    }

    #[tokio::test]
    async fn dropped_stream_fails_after_blanking() {
        let (tx, rx) = mpsc::unbounded();
        let sensor = ScriptedSensor::new(rx);
        let sink = MemorySink::default();
        let mut session = session(sensor, &sink);

        tx.unbounded_send(vec![0x00, 50]).unwrap();
        tx.unbounded_send(vec![0x00]).unwrap();
        drop(tx);

        let err = session
            .run("AA:BB", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::StreamClosed));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(sink.colors(), vec![Rgb::from_u32(0xFFC0CB), Rgb::OFF]);
    }
}
