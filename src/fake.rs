use std::time::Duration;

use futures::stream;
use rand::Rng;

use crate::error::{ConnectError, SessionError, SubscriptionError};
use crate::session::{HeartRateSensor, NotificationStream};

const SAMPLE_INTERVAL: Duration = Duration::from_millis(800);

/// Stand-in sensor producing random heart rates between 50 and 70 bpm, for
/// running the LED pipeline without hardware.
#[derive(Debug, Default)]
pub struct FakeSensor {
    subscribed: bool,
}

impl HeartRateSensor for FakeSensor {
    async fn connect(&mut self, address: &str) -> Result<(), ConnectError> {
        tracing::info!(%address, "Simulating heart rate sensor");
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<NotificationStream, SubscriptionError> {
        self.subscribed = true;
        let samples = stream::unfold((), |()| async {
            tokio::time::sleep(SAMPLE_INTERVAL).await;
            let heart_rate: u8 = rand::thread_rng().gen_range(50..70);
            Some((vec![0x00, heart_rate], ()))
        });
        Ok(Box::pin(samples))
    }

    async fn unsubscribe(&mut self) -> Result<(), SessionError> {
        if self.subscribed {
            tracing::info!("Stopped simulated notifications");
        }
        self.subscribed = false;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), SessionError> {
        Ok(())
    }
}
