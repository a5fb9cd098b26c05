//! Next-occurrence math for weekly recurring alarms.

use chrono::{DateTime, Datelike, FixedOffset, Timelike};
use log::{debug, warn};

use crate::{
    alarm::{AlarmRecord, AlarmTime, DayMask},
    sun::{utc_to_local_time_of_day, SunTimes, SECONDS_PER_DAY},
};

/// The alarm that fires first and how long until it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Due {
    pub index: usize,
    pub seconds: u32,
}

/// Local time of day for `time` on the calendar day of `now`.
///
/// Sunrise and sunset are looked up for today and reused for every later day
/// of the scan; the drift over a week is a few minutes at most.
pub fn resolve_time_of_day(
    time: AlarmTime,
    now: &DateTime<FixedOffset>,
    sun: &dyn SunTimes,
) -> Option<u32> {
    let utc = match time {
        AlarmTime::At(seconds) => return Some(seconds),
        AlarmTime::Sunrise => sun.sunrise_utc(now.date_naive())?,
        AlarmTime::Sunset => sun.sunset_utc(now.date_naive())?,
    };
    Some(utc_to_local_time_of_day(
        utc,
        now.offset().local_minus_utc(),
    ))
}

/// Seconds from `now` until the next time `time_of_day` falls on an armed day.
///
/// Today only counts when its bit is set and the time is still ahead. Otherwise
/// the following seven days are scanned in order. `None` when no day is armed.
pub fn seconds_until(time_of_day: u32, days: DayMask, now: &DateTime<FixedOffset>) -> Option<u32> {
    let today = now.weekday().num_days_from_sunday();
    let now_seconds = i64::from(now.num_seconds_from_midnight());
    let target = i64::from(time_of_day);

    if days.contains_index(today) && target > now_seconds {
        return u32::try_from(target - now_seconds).ok();
    }

    (1..=7_u32)
        .find(|ahead| days.contains_index(today + ahead))
        .and_then(|ahead| {
            let seconds = i64::from(ahead) * i64::from(SECONDS_PER_DAY) + target - now_seconds;
            u32::try_from(seconds).ok()
        })
}

/// Scans every alarm and returns the earliest. Ties keep the lower index.
pub fn find_earliest_due(
    records: &[AlarmRecord],
    now: &DateTime<FixedOffset>,
    sun: &dyn SunTimes,
) -> Option<Due> {
    let mut best: Option<Due> = None;

    for (index, record) in records.iter().enumerate() {
        let Some(time_of_day) = resolve_time_of_day(record.time, now, sun) else {
            debug!("alarm {index}: no {} today", record.time);
            continue;
        };
        let Some(seconds) = seconds_until(time_of_day, record.days, now) else {
            warn!("alarm {index} has no armed weekday and will never fire");
            continue;
        };

        if best.map_or(true, |current| seconds < current.seconds) {
            best = Some(Due { index, seconds });
        }
    }

    best
}
