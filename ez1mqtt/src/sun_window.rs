//! Daylight interval used to suppress polling at night.
//!
//! Sunrise and sunset follow the NOAA solar position approximation with the
//! usual refraction corrected horizon of -0.833 degrees. The result is accurate
//! to a couple of minutes outside the polar circles, plenty for deciding whether
//! an inverter can be awake.

use std::f64::consts::PI;

use chrono::{
    DateTime, Datelike, Duration, Local, LocalResult, NaiveDate, NaiveDateTime, NaiveTime,
    TimeZone, Utc,
};
use chrono_tz::Tz;
use log::warn;

use crate::error::ConfigError;

const SUN_ZENITH_DEG: f64 = 90.833;

/// Geographic position of the inverter, validated on construction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Position {
    latitude: f64,
    longitude: f64,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, ConfigError> {
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(ConfigError::InvalidCoordinates {
                latitude,
                longitude,
            });
        }
        Ok(Self {
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

/// The zone used to decide which calendar day "now" belongs to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LocalZone {
    Named(Tz),
    System,
}

impl LocalZone {
    /// Explicit configuration wins, then `$TZ`, then the host zone.
    ///
    /// An explicit zone that does not parse is a configuration error. `$TZ` may
    /// legitimately hold a POSIX rule string, so an unknown value there only
    /// falls back to the host zone.
    pub fn resolve(explicit: Option<&str>, env_tz: Option<&str>) -> Result<Self, ConfigError> {
        if let Some(name) = explicit.map(str::trim).filter(|n| !n.is_empty()) {
            return name
                .parse::<Tz>()
                .map(LocalZone::Named)
                .map_err(|_| ConfigError::InvalidTimezone(name.to_string()));
        }
        if let Some(name) = env_tz.map(|n| n.trim().trim_start_matches(':')) {
            if let Ok(tz) = name.parse::<Tz>() {
                return Ok(LocalZone::Named(tz));
            }
            if !name.is_empty() {
                warn!("TZ={name} is not an IANA zone name, using host timezone");
            }
        }
        Ok(LocalZone::System)
    }

    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        match self {
            LocalZone::Named(tz) => instant.with_timezone(tz).date_naive(),
            LocalZone::System => instant.with_timezone(&Local).date_naive(),
        }
    }

    /// First instant of `date` in this zone.
    pub fn start_of_day(&self, date: NaiveDate) -> DateTime<Utc> {
        let naive = date.and_time(NaiveTime::MIN);
        match self {
            LocalZone::Named(tz) => first_valid_local(tz, naive),
            LocalZone::System => first_valid_local(&Local, naive),
        }
    }

    pub fn format(&self, instant: DateTime<Utc>) -> String {
        match self {
            LocalZone::Named(tz) => instant
                .with_timezone(tz)
                .format("%Y-%m-%d %H:%M:%S %Z")
                .to_string(),
            LocalZone::System => instant
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S %:z")
                .to_string(),
        }
    }
}

fn first_valid_local<Z: TimeZone>(zone: &Z, mut naive: NaiveDateTime) -> DateTime<Utc> {
    // a DST gap can swallow midnight, step forward until the local time exists
    for _ in 0..4 {
        match zone.from_local_datetime(&naive) {
            LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => return t.with_timezone(&Utc),
            LocalResult::None => naive += Duration::minutes(30),
        }
    }
    Utc.from_utc_datetime(&naive)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DaylightWindow {
    pub sunrise: DateTime<Utc>,
    pub sunset: DateTime<Utc>,
    /// Polar day or polar night, the window spans the whole local day.
    pub polar: bool,
}

impl DaylightWindow {
    /// True when `instant` lies strictly between sunrise and sunset.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.sunrise < instant && instant < self.sunset
    }

    pub fn is_well_formed(&self) -> bool {
        self.sunrise < self.sunset
    }
}

/// Computes sunrise and sunset of the local calendar day `date`.
///
/// Where the sun does not cross the horizon that day the window covers the
/// whole local day, so polling is never suppressed for weeks on end.
pub fn daylight_window(date: NaiveDate, position: &Position, zone: &LocalZone) -> DaylightWindow {
    let days_in_year = if date.leap_year() { 366.0 } else { 365.0 };
    let gamma = 2.0 * PI / days_in_year * f64::from(date.ordinal0());

    let eq_time_min = 229.18
        * (0.000075 + 0.001868 * gamma.cos()
            - 0.032077 * gamma.sin()
            - 0.014615 * (2.0 * gamma).cos()
            - 0.040849 * (2.0 * gamma).sin());
    let declination = 0.006918 - 0.399912 * gamma.cos() + 0.070257 * gamma.sin()
        - 0.006758 * (2.0 * gamma).cos()
        + 0.000907 * (2.0 * gamma).sin()
        - 0.002697 * (3.0 * gamma).cos()
        + 0.00148 * (3.0 * gamma).sin();

    let lat = position.latitude.to_radians();
    let cos_hour_angle = SUN_ZENITH_DEG.to_radians().cos() / (lat.cos() * declination.cos())
        - lat.tan() * declination.tan();

    if !cos_hour_angle.is_finite() || !(-1.0..=1.0).contains(&cos_hour_angle) {
        let next_date = date.succ_opt().unwrap_or(date);
        return DaylightWindow {
            sunrise: zone.start_of_day(date),
            sunset: zone.start_of_day(next_date),
            polar: true,
        };
    }

    let hour_angle = cos_hour_angle.acos().to_degrees();
    let sunrise_min = 720.0 - 4.0 * (position.longitude + hour_angle) - eq_time_min;
    let sunset_min = 720.0 - 4.0 * (position.longitude - hour_angle) - eq_time_min;

    let utc_midnight = date.and_time(NaiveTime::MIN).and_utc();
    let at = |minutes: f64| utc_midnight + Duration::seconds((minutes * 60.0).round() as i64);

    DaylightWindow {
        sunrise: at(sunrise_min),
        sunset: at(sunset_min),
        polar: false,
    }
}
