use std::fmt;
use std::str::FromStr;

use anyhow::Result;

use crate::zones::ZoneTable;

/// 24-bit color as pushed to the strip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const OFF: Rgb = Rgb::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub const fn from_u32(value: u32) -> Self {
        Self {
            r: ((value >> 16) & 0xFF) as u8,
            g: ((value >> 8) & 0xFF) as u8,
            b: (value & 0xFF) as u8,
        }
    }

    pub const fn to_u32(self) -> u32 {
        ((self.r as u32) << 16) | ((self.g as u32) << 8) | self.b as u32
    }

    /// Scale every channel by `brightness`, truncating toward zero.
    /// Values outside `[0, 1]` are clamped.
    pub fn scaled(self, brightness: f32) -> Self {
        let brightness = if brightness.is_nan() {
            0.0
        } else {
            brightness.clamp(0.0, 1.0)
        };
        let scale = |channel: u8| (channel as f32 * brightness) as u8;

        Self {
            r: scale(self.r),
            g: scale(self.g),
            b: scale(self.b),
        }
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:06X}", self.to_u32())
    }
}

impl FromStr for Rgb {
    type Err = String;

    /// Accepts `#RRGGBB`, `0xRRGGBB` or bare `RRGGBB`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let hex = s
            .strip_prefix('#')
            .or_else(|| s.strip_prefix("0x"))
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);

        if hex.len() != 6 {
            return Err(format!("expected six hex digits, got {s:?}"));
        }

        u32::from_str_radix(hex, 16)
            .map(Rgb::from_u32)
            .map_err(|e| format!("invalid color {s:?}: {e}"))
    }
}

/// Look up the zone's color and apply brightness. Zones without a color
/// render as off.
pub fn render(zone: u8, table: &ZoneTable, brightness: f32) -> Rgb {
    table
        .color_for(zone)
        .map(|color| color.scaled(brightness))
        .unwrap_or(Rgb::OFF)
}

/// Something that can fill an entire LED strip with one color.
pub trait LedSink {
    fn fill(&mut self, count: usize, color: Rgb) -> Result<()>;
}

impl<S: LedSink + ?Sized> LedSink for Box<S> {
    fn fill(&mut self, count: usize, color: Rgb) -> Result<()> {
        (**self).fill(count, color)
    }
}

pub struct LedStrip<S> {
    sink: S,
    count: usize,
}

impl<S: LedSink> LedStrip<S> {
    pub fn new(sink: S, count: usize) -> Self {
        Self { sink, count }
    }

    pub fn show(&mut self, color: Rgb) -> Result<()> {
        self.sink.fill(self.count, color)
    }

    pub fn blank(&mut self) -> Result<()> {
        self.sink.fill(self.count, Rgb::OFF)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Sink used when no strip hardware is configured: every fill is logged.
#[derive(Debug, Default)]
pub struct TraceSink;

impl LedSink for TraceSink {
    fn fill(&mut self, count: usize, color: Rgb) -> Result<()> {
        tracing::info!(leds = count, color = %color, "LED fill");
        Ok(())
    }
}

#[cfg(feature = "spi")]
pub use spi::SpiSink;

#[cfg(feature = "spi")]
mod spi {
    use anyhow::{anyhow, Context, Result};
    use linux_embedded_hal::spidev::{SpiModeFlags, SpidevOptions};
    use linux_embedded_hal::SpidevBus;
    use smart_leds::{SmartLedsWrite, RGB8};
    use ws2812_spi::Ws2812;

    use super::{LedSink, Rgb};

    /// ws2812-spi expects a bus clock between 2 and 3.8 MHz.
    const SPI_CLOCK_HZ: u32 = 3_000_000;

    /// WS2812 strip on a Linux spidev bus (e.g. `/dev/spidev0.0`).
    pub struct SpiSink {
        strip: Ws2812<SpidevBus>,
    }

    impl SpiSink {
        pub fn open(device: &str) -> Result<Self> {
            let mut bus = SpidevBus::open(device)
                .with_context(|| format!("failed to open SPI device {device}"))?;
            let options = SpidevOptions::new()
                .bits_per_word(8)
                .max_speed_hz(SPI_CLOCK_HZ)
                .mode(SpiModeFlags::SPI_MODE_0)
                .build();
            bus.configure(&options)
                .with_context(|| format!("failed to configure SPI device {device}"))?;

            Ok(Self {
                strip: Ws2812::new(bus),
            })
        }
    }

    impl LedSink for SpiSink {
        fn fill(&mut self, count: usize, color: Rgb) -> Result<()> {
            let pixel = RGB8::new(color.r, color.g, color.b);
            self.strip
                .write(std::iter::repeat(pixel).take(count))
                .map_err(|e| anyhow!("SPI write failed: {e:?}"))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use anyhow::Result;

    use super::{LedSink, Rgb};

    /// Records every fill so tests can inspect what reached the strip.
    #[derive(Clone, Default)]
    pub struct MemorySink {
        fills: Arc<Mutex<Vec<(usize, Rgb)>>>,
    }

    impl MemorySink {
        pub fn fills(&self) -> Vec<(usize, Rgb)> {
            self.fills.lock().unwrap().clone()
        }

        pub fn colors(&self) -> Vec<Rgb> {
            self.fills().into_iter().map(|(_, color)| color).collect()
        }
    }

    impl LedSink for MemorySink {
        fn fill(&mut self, count: usize, color: Rgb) -> Result<()> {
            self.fills.lock().unwrap().push((count, color));
            Ok(())
        }
    }
}
