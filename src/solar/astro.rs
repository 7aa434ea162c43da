//! Offline sunrise/sunset computation
//!
//! Implements the NOAA general solar position approximations: fractional
//! year, equation of time and solar declination, then the hour angle at which
//! the sun's center sits 0.833° below the horizon (refraction plus the solar
//! disc radius). Accuracy is within a couple of minutes at mid latitudes,
//! which is far finer than the buffers applied on top.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Utc};
use std::f64::consts::PI;

use super::schedule::{ScheduleError, SunTimes, SunTimesSource};

const SUNRISE_ZENITH_DEG: f64 = 90.833;

/// Computes sun times locally, without any network access.
#[derive(Debug, Clone, Copy, Default)]
pub struct AstronomicalSource;

#[async_trait]
impl SunTimesSource for AstronomicalSource {
    async fn fetch_sun_times(
        &self,
        latitude: f64,
        longitude: f64,
        date: NaiveDate,
    ) -> Result<SunTimes, ScheduleError> {
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(ScheduleError::Parse(format!(
                "coordinates out of range: {}, {}",
                latitude, longitude
            )));
        }
        sun_times(latitude, longitude, date).ok_or(ScheduleError::NoSunEvent { date, latitude })
    }

    fn name(&self) -> &'static str {
        "astronomical"
    }
}

/// Sunrise and sunset for `date` at the given coordinates.
///
/// Returns `None` during polar day or polar night.
pub fn sun_times(latitude: f64, longitude: f64, date: NaiveDate) -> Option<SunTimes> {
    let days_in_year = NaiveDate::from_ymd_opt(date.year(), 12, 31)
        .map(|last| last.ordinal() as f64)
        .unwrap_or(365.0);
    // Evaluated at local solar noon
    let gamma = 2.0 * PI / days_in_year * (date.ordinal() as f64 - 1.0);

    let eq_time = 229.18
        * (0.000075 + 0.001868 * gamma.cos()
            - 0.032077 * gamma.sin()
            - 0.014615 * (2.0 * gamma).cos()
            - 0.040849 * (2.0 * gamma).sin());

    let declination = 0.006918 - 0.399912 * gamma.cos() + 0.070257 * gamma.sin()
        - 0.006758 * (2.0 * gamma).cos()
        + 0.000907 * (2.0 * gamma).sin()
        - 0.002697 * (3.0 * gamma).cos()
        + 0.00148 * (3.0 * gamma).sin();

    let lat = latitude.to_radians();
    let cos_ha = SUNRISE_ZENITH_DEG.to_radians().cos() / (lat.cos() * declination.cos())
        - lat.tan() * declination.tan();
    if !(-1.0..=1.0).contains(&cos_ha) {
        return None;
    }
    let hour_angle = cos_ha.acos().to_degrees();

    let sunrise_min = 720.0 - 4.0 * (longitude + hour_angle) - eq_time;
    let sunset_min = 720.0 - 4.0 * (longitude - hour_angle) - eq_time;

    Some(SunTimes {
        sunrise: utc_at(date, sunrise_min)?,
        sunset: utc_at(date, sunset_min)?,
    })
}

/// `date` at midnight UTC shifted by a (possibly negative) number of minutes.
fn utc_at(date: NaiveDate, minutes: f64) -> Option<DateTime<Utc>> {
    let midnight = date.and_hms_opt(0, 0, 0)?.and_utc();
    let offset = TimeDelta::try_seconds((minutes * 60.0).round() as i64)?;
    midnight.checked_add_signed(offset)
}
