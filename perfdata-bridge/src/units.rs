//! Perfdata value normalization
//!
//! Nagios plugins emit units without any shared schema (bytes, durations,
//! percentages, physical units...). A raw value token is turned into a
//! number by trying, in order:
//! - byte magnitudes (`4.5M` is read as `4.5MB`), IEC then SI
//! - a fixed table of domain suffixes (`ms`, `RPM`, `Volts`, `degrees_C`, `s`, `%`)
//! - a bare float

use once_cell::sync::Lazy;
use regex::Regex;

use crate::perfdata::PerfdataError;

/// Byte unit systems understood by [`string_to_bytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitSystem {
    /// 1024-based, prefixes `K`, `Ki`, `M`, `Mi`...
    Iec,
    /// 1000-based, prefixes `k`, `M`, `G`, `T`
    Si,
}

static IEC_BYTES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([-+]?\d*\.?\d+)([KMGT]i?)?(b|bit|B)$").expect("valid IEC regex"));
static SI_BYTES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([-+]?\d*\.?\d+)([kMGT])?(b|bit|B)$").expect("valid SI regex"));

/// Suffixes stripped without scaling, checked after `ms`.
const PLAIN_UNITS: [&str; 5] = ["RPM", "Volts", "degrees_C", "s", "%"];

/// Prefixes that mark an otherwise unit-less byte magnitude.
const MAGNITUDE_SUFFIXES: [char; 4] = ['T', 'G', 'M', 'K'];

impl UnitSystem {
    fn base(self) -> f64 {
        match self {
            UnitSystem::Iec => 1024.0,
            UnitSystem::Si => 1000.0,
        }
    }

    fn pattern(self) -> &'static Regex {
        match self {
            UnitSystem::Iec => &IEC_BYTES,
            UnitSystem::Si => &SI_BYTES,
        }
    }
}

/// Parses a byte quantity such as `10KiB`, `4.5MB` or `8bit`.
///
/// Bit units are divided by 8. Returns `None` when the token does not match
/// the grammar of the unit system.
pub fn string_to_bytes(text: &str, system: UnitSystem) -> Option<f64> {
    let caps = system.pattern().captures(text)?;
    let mut magnitude: f64 = caps.get(1)?.as_str().parse().ok()?;
    if matches!(caps.get(3).map(|m| m.as_str()), Some("b") | Some("bit")) {
        magnitude /= 8.0;
    }

    let exponent = match caps.get(2).map(|m| m.as_str()) {
        None => 0,
        Some(prefix) => match prefix.trim_end_matches('i') {
            "k" | "K" => 1,
            "M" => 2,
            "G" => 3,
            "T" => 4,
            _ => return None,
        },
    };

    Some(magnitude * system.base().powi(exponent))
}

/// Domain unit table. `ms` values are multiplied by 1000.
fn string_to_any(value: &str) -> Option<f64> {
    if value.len() < 2 {
        return None;
    }
    if let Some(number) = value.strip_suffix("ms") {
        return number.parse::<f64>().ok().map(|v| v * 1000.0);
    }

    PLAIN_UNITS
        .iter()
        .filter_map(|unit| value.strip_suffix(unit))
        .find_map(|number| number.parse::<f64>().ok())
}

/// Rewrites `4.5M` as `4.5MB` when the part before the suffix is numeric.
fn as_byte_magnitude(value: &str) -> Option<String> {
    let last = value.chars().last()?;
    if !MAGNITUDE_SUFFIXES.contains(&last) {
        return None;
    }
    let number: f64 = value[..value.len() - 1].parse().ok()?;
    Some(format!("{}{}B", number, last))
}

/// Converts one raw perfdata value token into a measurement.
pub fn convert_value(raw: &str) -> Result<f64, PerfdataError> {
    let trimmed = raw.trim();
    let candidate = as_byte_magnitude(trimmed).unwrap_or_else(|| trimmed.to_string());

    string_to_bytes(&candidate, UnitSystem::Iec)
        .or_else(|| string_to_bytes(&candidate, UnitSystem::Si))
        .or_else(|| string_to_any(&candidate))
        .or_else(|| candidate.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .ok_or_else(|| PerfdataError::MalformedValue(raw.to_string()))
}
