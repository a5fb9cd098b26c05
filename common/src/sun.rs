use chrono::{Datelike, NaiveDate};

pub const SECONDS_PER_DAY: u32 = 86_400;

/// Source of sunrise and sunset instants, as seconds after UTC midnight of `date`.
///
/// `None` means the sun does not cross the horizon that day (polar day or night).
pub trait SunTimes: Send + Sync {
    fn sunrise_utc(&self, date: NaiveDate) -> Option<u32>;
    fn sunset_utc(&self, date: NaiveDate) -> Option<u32>;
}

/// Sunrise equation with the usual refraction and elevation corrections.
/// Accurate to a minute or two at mid latitudes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolarCalculator {
    pub latitude: f64,
    /// Degrees, east positive.
    pub longitude: f64,
    /// Metres above the horizon.
    pub elevation: f64,
}

const J2000: f64 = 2_451_545.0;
const UNIX_EPOCH_JD: f64 = 2_440_587.5;
const OBLIQUITY_DEG: f64 = 23.4397;
const CE_DAYS_AT_J2000: i32 = 730_120;
const CE_DAYS_AT_UNIX_EPOCH: i32 = 719_163;

impl SolarCalculator {
    pub fn new(latitude: f64, longitude: f64, elevation: f64) -> Self {
        Self {
            latitude,
            longitude,
            elevation,
        }
    }

    /// Julian dates of sunrise and sunset for `date`.
    fn events(&self, date: NaiveDate) -> Option<(f64, f64)> {
        let days_since_j2000 = f64::from(date.num_days_from_ce() - CE_DAYS_AT_J2000) + 0.0008;
        let mean_solar_noon = days_since_j2000 - self.longitude / 360.0;

        let anomaly = (357.5291 + 0.985_600_28 * mean_solar_noon).rem_euclid(360.0);
        let anomaly_rad = anomaly.to_radians();
        let center = 1.9148 * anomaly_rad.sin()
            + 0.0200 * (2.0 * anomaly_rad).sin()
            + 0.0003 * (3.0 * anomaly_rad).sin();
        let ecliptic_longitude = (anomaly + center + 180.0 + 102.9372).rem_euclid(360.0);
        let ecliptic_rad = ecliptic_longitude.to_radians();

        let transit =
            J2000 + mean_solar_noon + 0.0053 * anomaly_rad.sin() - 0.0069 * (2.0 * ecliptic_rad).sin();

        let sin_declination = ecliptic_rad.sin() * OBLIQUITY_DEG.to_radians().sin();
        let cos_declination = sin_declination.asin().cos();
        let latitude = self.latitude.to_radians();
        let horizon = (-0.833 - 2.076 * self.elevation.max(0.0).sqrt() / 60.0).to_radians();

        let cos_hour_angle = (horizon.sin() - latitude.sin() * sin_declination)
            / (latitude.cos() * cos_declination);
        if !(-1.0..=1.0).contains(&cos_hour_angle) {
            return None;
        }
        let half_day = cos_hour_angle.acos().to_degrees() / 360.0;

        Some((transit - half_day, transit + half_day))
    }

    fn seconds_after_midnight(date: NaiveDate, julian: f64) -> u32 {
        let midnight = UNIX_EPOCH_JD + f64::from(date.num_days_from_ce() - CE_DAYS_AT_UNIX_EPOCH);
        let seconds = ((julian - midnight) * f64::from(SECONDS_PER_DAY)).round() as i64;
        seconds.rem_euclid(i64::from(SECONDS_PER_DAY)) as u32
    }
}

impl SunTimes for SolarCalculator {
    fn sunrise_utc(&self, date: NaiveDate) -> Option<u32> {
        self.events(date)
            .map(|(rise, _)| Self::seconds_after_midnight(date, rise))
    }

    fn sunset_utc(&self, date: NaiveDate) -> Option<u32> {
        self.events(date)
            .map(|(_, set)| Self::seconds_after_midnight(date, set))
    }
}

/// Converts seconds after UTC midnight into seconds after local midnight.
pub fn utc_to_local_time_of_day(utc_seconds: u32, offset_seconds: i32) -> u32 {
    (i64::from(utc_seconds) + i64::from(offset_seconds)).rem_euclid(i64::from(SECONDS_PER_DAY))
        as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> SolarCalculator {
        SolarCalculator::new(47.896_076, 20.380_324, 0.0)
    }

    fn assert_close(actual: u32, expected: u32) {
        let diff = actual.abs_diff(expected);
        assert!(diff <= 120, "expected ~{expected}, got {actual}");
    }

    #[test]
    fn summer_solstice_week_matches_published_tables() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
        // 02:40 and 18:40 UTC.
        assert_close(site().sunrise_utc(date).unwrap(), 9_610);
        assert_close(site().sunset_utc(date).unwrap(), 67_231);
    }

    #[test]
    fn winter_days_are_short() {
        let date = NaiveDate::from_ymd_opt(2024, 12, 21).unwrap();
        let rise = site().sunrise_utc(date).unwrap();
        let set = site().sunset_utc(date).unwrap();
        assert_close(rise, 23_181);
        assert!(set - rise < 9 * 3600);
    }

    #[test]
    fn polar_night_has_no_sunrise() {
        let arctic = SolarCalculator::new(78.22, 15.65, 0.0);
        let date = NaiveDate::from_ymd_opt(2024, 12, 21).unwrap();
        assert_eq!(arctic.sunrise_utc(date), None);
        assert_eq!(arctic.sunset_utc(date), None);
    }

    #[test]
    fn local_conversion_wraps_around_midnight() {
        assert_eq!(utc_to_local_time_of_day(9_610, 7_200), 16_810);
        assert_eq!(utc_to_local_time_of_day(85_000, 7_200), 5_800);
        assert_eq!(utc_to_local_time_of_day(1_000, -3_600), 83_800);
    }
}
