//! Daily sunrise/sunset schedule

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Timelike, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::LocationConfig;

pub const MINUTES_PER_DAY: u32 = 24 * 60;

/// Upper bound on a single sun-times lookup.
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScheduleError {
    #[error("sun-times source unreachable: {0}")]
    Network(String),
    #[error("malformed sun-times response: {0}")]
    Parse(String),
    #[error("no sunrise or sunset on {date} at latitude {latitude:.2}")]
    NoSunEvent { date: NaiveDate, latitude: f64 },
}

/// Sunrise and sunset instants for one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SunTimes {
    pub sunrise: DateTime<Utc>,
    pub sunset: DateTime<Utc>,
}

/// Provider of sunrise/sunset instants for a location and date.
#[async_trait]
pub trait SunTimesSource: Send + Sync {
    async fn fetch_sun_times(
        &self,
        latitude: f64,
        longitude: f64,
        date: NaiveDate,
    ) -> Result<SunTimes, ScheduleError>;

    /// Name of this source for logging
    fn name(&self) -> &'static str;
}

/// Today's day/night boundaries in local minutes of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolarWindow {
    pub sunrise_minute: u32,
    pub sunset_minute: u32,
    pub sunrise_buffer_min: i32,
    pub sunset_buffer_min: i32,
    pub computed_on: NaiveDate,
}

impl SolarWindow {
    pub fn new(
        sunrise_minute: u32,
        sunset_minute: u32,
        sunrise_buffer_min: i32,
        sunset_buffer_min: i32,
        computed_on: NaiveDate,
    ) -> Self {
        Self {
            sunrise_minute: sunrise_minute % MINUTES_PER_DAY,
            sunset_minute: sunset_minute % MINUTES_PER_DAY,
            sunrise_buffer_min,
            sunset_buffer_min,
            computed_on,
        }
    }

    /// Convert UTC sun times into a window expressed in `tz` minutes of day.
    pub fn from_sun_times<Tz: TimeZone>(
        times: &SunTimes,
        sunrise_buffer_min: i32,
        sunset_buffer_min: i32,
        computed_on: NaiveDate,
        tz: &Tz,
    ) -> Self {
        let minute_of_day = |instant: &DateTime<Utc>| {
            let local = instant.with_timezone(tz);
            local.hour() * 60 + local.minute()
        };

        Self::new(
            minute_of_day(&times.sunrise),
            minute_of_day(&times.sunset),
            sunrise_buffer_min,
            sunset_buffer_min,
            computed_on,
        )
    }

    /// Minute of day at which daytime begins (sunrise minus its buffer).
    pub fn day_starts(&self) -> u32 {
        (self.sunrise_minute as i64 - self.sunrise_buffer_min as i64)
            .rem_euclid(MINUTES_PER_DAY as i64) as u32
    }

    /// Minute of day at which night begins (sunset plus its buffer).
    pub fn night_starts(&self) -> u32 {
        (self.sunset_minute as i64 + self.sunset_buffer_min as i64)
            .rem_euclid(MINUTES_PER_DAY as i64) as u32
    }
}

impl std::fmt::Display for SolarWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hm = |m: u32| format!("{:02}:{:02}", m / 60, m % 60);
        write!(
            f,
            "sunrise {} sunset {} (day {}..{}) for {}",
            hm(self.sunrise_minute),
            hm(self.sunset_minute),
            hm(self.day_starts()),
            hm(self.night_starts()),
            self.computed_on
        )
    }
}

/// Owns the current [`SolarWindow`] and refreshes it once per local date.
///
/// A failed refresh keeps the previous window in place and is retried no
/// sooner than `retry_interval` later on the same date.
pub struct SolarSchedule {
    source: Box<dyn SunTimesSource>,
    latitude: f64,
    longitude: f64,
    sunrise_buffer_min: i32,
    sunset_buffer_min: i32,
    retry_interval: Duration,
    window: SolarWindow,
    refreshed_on: Option<NaiveDate>,
    last_failure: Option<(NaiveDate, Instant)>,
    refreshes: u32,
}

impl SolarSchedule {
    /// Create a schedule seeded with the configured fallback window.
    pub fn new(source: Box<dyn SunTimesSource>, location: &LocationConfig, today: NaiveDate) -> Self {
        Self {
            source,
            latitude: location.latitude,
            longitude: location.longitude,
            sunrise_buffer_min: location.sunrise_buffer_min,
            sunset_buffer_min: location.sunset_buffer_min,
            retry_interval: location.schedule_retry(),
            window: SolarWindow::new(
                location.fallback_sunrise_min,
                location.fallback_sunset_min,
                location.sunrise_buffer_min,
                location.sunset_buffer_min,
                today,
            ),
            refreshed_on: None,
            last_failure: None,
            refreshes: 0,
        }
    }

    pub fn current_window(&self) -> &SolarWindow {
        &self.window
    }

    /// Number of successful refreshes so far
    pub fn refresh_count(&self) -> u32 {
        self.refreshes
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    /// Whether a refresh attempt is due for `date`.
    pub fn needs_refresh(&self, date: NaiveDate) -> bool {
        if self.refreshed_on == Some(date) {
            return false;
        }
        match self.last_failure {
            Some((failed_on, at)) if failed_on == date => at.elapsed() >= self.retry_interval,
            _ => true,
        }
    }

    /// Fetch sun times for `date` and replace the window on success.
    pub async fn refresh(&mut self, date: NaiveDate) -> Result<SolarWindow, ScheduleError> {
        let fetch = self
            .source
            .fetch_sun_times(self.latitude, self.longitude, date);

        let result = match tokio::time::timeout(FETCH_TIMEOUT, fetch).await {
            Ok(result) => result,
            Err(_) => Err(ScheduleError::Network(format!(
                "no answer within {:?}",
                FETCH_TIMEOUT
            ))),
        };

        match result {
            Ok(times) => {
                self.window = SolarWindow::from_sun_times(
                    &times,
                    self.sunrise_buffer_min,
                    self.sunset_buffer_min,
                    date,
                    &chrono::Local,
                );
                self.refreshed_on = Some(date);
                self.last_failure = None;
                self.refreshes += 1;
                Ok(self.window)
            }
            Err(e) => {
                self.last_failure = Some((date, Instant::now()));
                Err(e)
            }
        }
    }

    /// Refresh if one is due for `date`; `None` when nothing was attempted.
    pub async fn ensure_current(
        &mut self,
        date: NaiveDate,
    ) -> Option<Result<SolarWindow, ScheduleError>> {
        if !self.needs_refresh(date) {
            return None;
        }
        Some(self.refresh(date).await)
    }
}
