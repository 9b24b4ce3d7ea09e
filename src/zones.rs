//! Heart-rate zone table and the shared zone artifact.
//!
//! The control plane writes the operator's payload verbatim to a JSON file;
//! each monitoring worker reads it once at startup. The expected shape is
//!
//! ```json
//! {"zones": [{"range": "61-65 bpm", "zone": 2, "color": "#0000FF"}]}
//! ```
//!
//! `color` is optional; zones without one use [`default_color`].

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::ConfigError;
use crate::led::Rgb;

/// Zone reported when no entry contains the sample.
pub const DEFAULT_ZONE: u8 = 1;

/// Built-in colors for zones 1 to 5.
pub fn default_color(zone: u8) -> Option<Rgb> {
    let value = match zone {
        1 => 0xFFC0CB, // pink
        2 => 0x0000FF, // blue
        3 => 0x00FF00, // green
        4 => 0xFFFF00, // yellow
        5 => 0xFF0000, // red
        _ => return None,
    };
    Some(Rgb::from_u32(value))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneEntry {
    pub zone: u8,
    pub lower: u16,
    pub upper: u16,
    pub color: Option<Rgb>,
}

impl ZoneEntry {
    pub fn new(zone: u8, lower: u16, upper: u16, color: Option<Rgb>) -> Option<Self> {
        (zone > 0 && lower <= upper).then_some(Self {
            zone,
            lower,
            upper,
            color,
        })
    }

    pub fn contains(&self, sample: u16) -> bool {
        self.lower <= sample && sample <= self.upper
    }

    fn from_value(value: &Value) -> Result<Self, String> {
        let object = value
            .as_object()
            .ok_or_else(|| "zone entry is not an object".to_string())?;

        let range = object
            .get("range")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing \"range\" string".to_string())?;
        let (lower, upper) = parse_range(range)?;

        let zone = object
            .get("zone")
            .and_then(Value::as_u64)
            .filter(|zone| (1..=u8::MAX as u64).contains(zone))
            .ok_or_else(|| "\"zone\" must be an integer between 1 and 255".to_string())?
            as u8;

        let color = match object.get("color") {
            None | Some(Value::Null) => default_color(zone),
            Some(Value::String(s)) => Some(s.parse::<Rgb>()?),
            Some(Value::Number(n)) => n
                .as_u64()
                .filter(|v| *v <= 0xFF_FFFF)
                .map(|v| Rgb::from_u32(v as u32))
                .map(Some)
                .ok_or_else(|| format!("color {n} is not a 24-bit value"))?,
            Some(other) => return Err(format!("unsupported color {other}")),
        };

        Ok(Self {
            zone,
            lower,
            upper,
            color,
        })
    }
}

/// Parses `"<low>-<high> bpm"`. The dash may be an en dash, including the
/// mis-decoded form some clients send.
fn parse_range(raw: &str) -> Result<(u16, u16), String> {
    let cleaned = raw.replace("â€“", "-").replace('–', "-");
    let cleaned = cleaned.trim();
    let cleaned = cleaned.strip_suffix("bpm").unwrap_or(cleaned).trim();

    let (low, high) = cleaned
        .split_once('-')
        .ok_or_else(|| format!("range {raw:?} has no '-' separator"))?;
    let low: u16 = low
        .trim()
        .parse()
        .map_err(|_| format!("invalid lower bound in {raw:?}"))?;
    let high: u16 = high
        .trim()
        .parse()
        .map_err(|_| format!("invalid upper bound in {raw:?}"))?;

    if low > high {
        return Err(format!("range {raw:?} has lower bound above upper bound"));
    }
    Ok((low, high))
}

/// Ordered zone entries; the first entry containing a sample wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneTable {
    entries: Vec<ZoneEntry>,
}

impl ZoneTable {
    pub fn new(entries: Vec<ZoneEntry>) -> Self {
        Self { entries }
    }

    /// Build a table from raw JSON entries. Entries that fail to parse are
    /// logged and dropped; the rest keep their order.
    pub fn from_values(values: &[Value]) -> Self {
        let entries = values
            .iter()
            .filter_map(|value| match ZoneEntry::from_value(value) {
                Ok(entry) => Some(entry),
                Err(reason) => {
                    tracing::warn!(entry = %value, %reason, "Skipping invalid zone entry");
                    None
                }
            })
            .collect();
        Self { entries }
    }

    /// Build a table from a full payload (`{"zones": [...]}`).
    pub fn from_payload(payload: &Value) -> Option<Self> {
        payload
            .get("zones")
            .and_then(Value::as_array)
            .map(|values| Self::from_values(values))
    }

    pub fn entries(&self) -> &[ZoneEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn resolve_zone(&self, sample: u16) -> u8 {
        self.entries
            .iter()
            .find(|entry| entry.contains(sample))
            .map(|entry| entry.zone)
            .unwrap_or(DEFAULT_ZONE)
    }

    /// Color configured for `zone`, falling back to the built-in palette.
    pub fn color_for(&self, zone: u8) -> Option<Rgb> {
        match self.entries.iter().find(|entry| entry.zone == zone) {
            Some(entry) => entry.color,
            None => default_color(zone),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let payload: Value =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        Self::from_payload(&payload).ok_or_else(|| ConfigError::MissingZones(path.to_path_buf()))
    }

    /// Load the artifact, or run with an empty table if it is unusable.
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(table) => {
                tracing::info!(path = %path.display(), zones = table.len(), "Loaded zone table");
                table
            }
            Err(e) => {
                tracing::warn!(error = %e, "Using an empty zone table");
                Self::default()
            }
        }
    }
}

/// Write the payload to `path` by writing a sibling temp file and renaming
/// it over the target, so a starting worker never sees a partial file.
pub fn write_artifact(path: &Path, payload: &Value) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    let tmp = temp_path(path);
    let json = serde_json::to_vec_pretty(payload).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut file = fs::File::create(&tmp).map_err(io_err)?;
    file.write_all(&json).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);

    fs::rename(&tmp, path).map_err(io_err)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "zones.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}
