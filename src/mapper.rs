use anyhow::Result;

use crate::led::{render, LedSink, LedStrip, Rgb};
use crate::zones::ZoneTable;

/// Turns heart-rate samples into strip colors using a fixed zone table.
pub struct HeartRateMapper<S> {
    zones: ZoneTable,
    brightness: f32,
    strip: LedStrip<S>,
    current_zone: Option<u8>,
}

impl<S: LedSink> HeartRateMapper<S> {
    pub fn new(zones: ZoneTable, brightness: f32, strip: LedStrip<S>) -> Self {
        Self {
            zones,
            brightness,
            strip,
            current_zone: None,
        }
    }

    /// Resolve the zone for `heart_rate` and push its color to the strip.
    pub fn on_sample(&mut self, heart_rate: u8) -> Result<(u8, Rgb)> {
        let zone = self.zones.resolve_zone(heart_rate as u16);
        let color = render(zone, &self.zones, self.brightness);

        if self.current_zone != Some(zone) {
            tracing::info!(heart_rate, zone, color = %color, "Entered zone");
            self.current_zone = Some(zone);
        }
        tracing::debug!(heart_rate, zone, color = %color, "Heart rate sample");

        self.strip.show(color)?;
        Ok((zone, color))
    }

    pub fn blank(&mut self) -> Result<()> {
        self.current_zone = None;
        self.strip.blank()
    }

    pub fn zones(&self) -> &ZoneTable {
        &self.zones
    }
}

/// Heart rate is the second byte of a measurement notification.
pub fn heart_rate_from_payload(payload: &[u8]) -> Option<u8> {
    payload.get(1).copied()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::led::testing::MemorySink;

    #[test]
    fn samples_drive_strip_colors() {
        let zones = ZoneTable::from_payload(&json!({
            "zones": [
                {"range": "0-60 bpm", "zone": 1},
                {"range": "61-65 bpm", "zone": 2},
                {"range": "76-999 bpm", "zone": 5}
            ]
        }))
        .unwrap();
        let sink = MemorySink::default();
        let mut mapper = HeartRateMapper::new(zones, 1.0, LedStrip::new(sink.clone(), 4));

        assert_eq!(mapper.on_sample(63).unwrap(), (2, Rgb::from_u32(0x0000FF)));
        assert_eq!(mapper.on_sample(120).unwrap(), (5, Rgb::from_u32(0xFF0000)));
        mapper.blank().unwrap();

        assert_eq!(
            sink.fills(),
            vec![
                (4, Rgb::from_u32(0x0000FF)),
                (4, Rgb::from_u32(0xFF0000)),
                (4, Rgb::OFF),
            ]
        );
    }

    #[test]
    fn payload_extraction_uses_second_byte() {
        assert_eq!(heart_rate_from_payload(&[0x00, 72]), Some(72));
        assert_eq!(heart_rate_from_payload(&[0x16, 64, 0x10, 0x03]), Some(64));
        assert_eq!(heart_rate_from_payload(&[0x00]), None);
        assert_eq!(heart_rate_from_payload(&[]), None);
    }
}
