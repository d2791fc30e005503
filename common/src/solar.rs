//! Wall clock and sunrise/sunset computation.
//!
//! The scheduler only sees the [`SunCalculator`] trait, so tests can hand it
//! fabricated solar times instead of running the astronomical formulas.

use std::{sync::OnceLock, time::Instant};

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use sunrise::{Coordinates, SolarDay, SolarEvent};

use crate::error::SolarError;

/// Altitude of the solar disc centre at sunrise/sunset, in degrees
/// (refraction plus apparent radius).
const SUN_ALTITUDE_DEG: f64 = -0.833;

pub trait Clock: Send + Sync {
    /// Milliseconds on a monotonic timeline, used for debounce and blink phase.
    fn now_ms(&self) -> u64;

    fn now_utc(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        static START: OnceLock<Instant> = OnceLock::new();
        START
            .get_or_init(Instant::now)
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SunEvent {
    Sunrise,
    Sunset,
}

impl SunEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sunrise => "sunrise",
            Self::Sunset => "sunset",
        }
    }
}

pub trait SunCalculator: Send + Sync {
    /// Instant of `event` on the given calendar date.
    fn event_time(&self, date: NaiveDate, event: SunEvent) -> Result<DateTime<Utc>, SolarError>;
}

/// Solar calculator backed by the `sunrise` crate.
#[derive(Debug, Clone, Copy)]
pub struct AstronomicalSun {
    latitude: f64,
    longitude: f64,
}

impl AstronomicalSun {
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        Coordinates::new(latitude, longitude)?;
        Some(Self {
            latitude,
            longitude,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

impl SunCalculator for AstronomicalSun {
    fn event_time(&self, date: NaiveDate, event: SunEvent) -> Result<DateTime<Utc>, SolarError> {
        if !sun_crosses_horizon(date, self.latitude) {
            return Err(SolarError::NoSolarEvent {
                date,
                latitude: self.latitude,
            });
        }

        let solar_event = match event {
            SunEvent::Sunrise => SolarEvent::Sunrise,
            SunEvent::Sunset => SolarEvent::Sunset,
        };
        let coordinates = Coordinates::new(self.latitude, self.longitude).ok_or(
            SolarError::InvalidCoordinates {
                latitude: self.latitude,
                longitude: self.longitude,
            },
        )?;
        let instant = SolarDay::new(coordinates, date).event_time(solar_event);

        // The hour-angle formula degrades into garbage rather than failing
        // close to the polar circles.
        let Some(noon) = date.and_hms_opt(12, 0, 0).map(|naive| naive.and_utc()) else {
            return Err(SolarError::OutOfRange(instant.to_rfc3339()));
        };
        if (instant - noon).abs() > Duration::hours(36) {
            return Err(SolarError::OutOfRange(instant.to_rfc3339()));
        }

        Ok(instant)
    }
}

/// Whether the sun rises and sets at all on `date` at `latitude`.
fn sun_crosses_horizon(date: NaiveDate, latitude: f64) -> bool {
    let declination = solar_declination(date);
    let phi = latitude.to_radians();
    let cos_hour_angle = (SUN_ALTITUDE_DEG.to_radians().sin() - phi.sin() * declination.sin())
        / (phi.cos() * declination.cos());
    cos_hour_angle.is_finite() && (-1.0..=1.0).contains(&cos_hour_angle)
}

/// Solar declination in radians (NOAA Fourier approximation).
fn solar_declination(date: NaiveDate) -> f64 {
    let gamma = 2.0 * std::f64::consts::PI / 365.0 * (f64::from(date.ordinal()) - 1.0);
    0.006918 - 0.399912 * gamma.cos() + 0.070257 * gamma.sin() - 0.006758 * (2.0 * gamma).cos()
        + 0.000907 * (2.0 * gamma).sin()
        - 0.002697 * (3.0 * gamma).cos()
        + 0.00148 * (3.0 * gamma).sin()
}

/// Fabricated solar times: the same UTC time of day on every date.
#[derive(Debug, Clone, Copy)]
pub struct FixedSun {
    pub sunrise: chrono::NaiveTime,
    pub sunset: chrono::NaiveTime,
}

impl SunCalculator for FixedSun {
    fn event_time(&self, date: NaiveDate, event: SunEvent) -> Result<DateTime<Utc>, SolarError> {
        let time = match event {
            SunEvent::Sunrise => self.sunrise,
            SunEvent::Sunset => self.sunset,
        };
        Ok(date.and_time(time).and_utc())
    }
}

/// Placeholder used when no rule needs coordinates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSun;

impl SunCalculator for NoSun {
    fn event_time(&self, _date: NaiveDate, _event: SunEvent) -> Result<DateTime<Utc>, SolarError> {
        Err(SolarError::MissingCoordinates)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveTime, Timelike};

    use super::*;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    #[test]
    fn pittsburgh_summer_sunset_is_evening_local() {
        let sun = AstronomicalSun::new(40.443657, -79.942750).unwrap();
        let sunset = sun.event_time(date(2026, 6, 21), SunEvent::Sunset).unwrap();
        let sunrise = sun.event_time(date(2026, 6, 21), SunEvent::Sunrise).unwrap();

        // Sunset around 20:50 EDT = 00:50 UTC the next day.
        assert!(sunset > sunrise);
        let local_hour = (sunset.hour() + 24 - 4) % 24;
        assert!((20..=21).contains(&local_hour), "sunset hour {local_hour}");
        let day_length = sunset - sunrise;
        assert!(day_length > Duration::hours(14) && day_length < Duration::hours(16));
    }

    #[test]
    fn polar_night_is_an_error() {
        let sun = AstronomicalSun::new(78.22, 15.65).unwrap();
        let result = sun.event_time(date(2026, 12, 21), SunEvent::Sunrise);

        assert!(matches!(result, Err(SolarError::NoSolarEvent { .. })));
    }

    #[test]
    fn polar_day_is_an_error() {
        let sun = AstronomicalSun::new(78.22, 15.65).unwrap();
        let result = sun.event_time(date(2026, 6, 21), SunEvent::Sunset);

        assert!(matches!(result, Err(SolarError::NoSolarEvent { .. })));
    }

    #[test]
    fn rejects_invalid_coordinates() {
        assert!(AstronomicalSun::new(95.0, 0.0).is_none());
        assert!(AstronomicalSun::new(0.0, 200.0).is_none());
    }

    #[test]
    fn fixed_sun_returns_same_time_each_day() {
        let sun = FixedSun {
            sunrise: NaiveTime::from_hms_opt(6, 30, 0).unwrap(),
            sunset: NaiveTime::from_hms_opt(19, 45, 0).unwrap(),
        };

        let a = sun.event_time(date(2026, 3, 1), SunEvent::Sunset).unwrap();
        let b = sun.event_time(date(2026, 3, 2), SunEvent::Sunset).unwrap();

        assert_eq!(b - a, Duration::days(1));
        assert_eq!(a.time(), NaiveTime::from_hms_opt(19, 45, 0).unwrap());
    }
}
