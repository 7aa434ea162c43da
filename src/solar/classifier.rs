//! Day/night classification against a solar window

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use super::schedule::{MINUTES_PER_DAY, SolarWindow};

/// Lighting regime the pipeline is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Day,
    Night,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Day => write!(f, "day"),
            Mode::Night => write!(f, "night"),
        }
    }
}

/// Classify a wall-clock time against `window`.
///
/// Comparison happens at minute granularity, seconds are ignored.
pub fn classify(now: NaiveTime, window: &SolarWindow) -> Mode {
    classify_minute(now.hour() * 60 + now.minute(), window)
}

/// Classify a minute of day (`0..1440`) against `window`.
///
/// Boundaries are compared before wrapping at midnight. With the usual
/// ordering (adjusted sunrise before adjusted sunset) night is the circular
/// interval `[sunset + buffer, sunrise - buffer)`, so a buffered sunset that
/// lands after midnight still starts night on its own minute. When the
/// buffers push the adjusted sunrise to or past the adjusted sunset, night
/// shrinks to the minutes strictly between the two. Night always covers at
/// least one minute and never the whole day.
pub fn classify_minute(minute: u32, window: &SolarWindow) -> Mode {
    let day = MINUTES_PER_DAY as i64;
    let day_starts = window.sunrise_minute as i64 - window.sunrise_buffer_min as i64;
    let night_starts = window.sunset_minute as i64 + window.sunset_buffer_min as i64;

    let (night_from, night_len) = if day_starts < night_starts {
        (night_starts, day_starts + day - night_starts)
    } else if day_starts - night_starts > 1 {
        (night_starts + 1, day_starts - night_starts - 1)
    } else {
        (night_starts, 1)
    };
    let night_len = night_len.clamp(1, day - 1);

    let offset = (minute as i64 - night_from).rem_euclid(day);
    if offset < night_len { Mode::Night } else { Mode::Day }
}
