//! Solar schedule and day/night classification
//!
//! - `schedule`: owns today's sunrise/sunset window and refreshes it daily
//! - `classifier`: pure mapping from a wall-clock time to [`Mode`]
//! - `astro`: offline sun-times source based on the NOAA approximations

pub mod astro;
pub mod classifier;
pub mod schedule;

pub use astro::AstronomicalSource;
pub use classifier::{Mode, classify};
pub use schedule::{ScheduleError, SolarSchedule, SolarWindow, SunTimes, SunTimesSource};
