use std::{
    sync::OnceLock,
    time::Instant,
};

use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;

use homelink_common::config::DEFAULT_TIMEZONE;

/// Parses the configured zone, falling back to the default zone.
pub fn resolve_timezone(name: &str) -> Tz {
    name.parse().unwrap_or_else(|_| {
        log::warn!("unknown timezone `{name}`, using {DEFAULT_TIMEZONE}");
        chrono_tz::Europe::Budapest
    })
}

pub fn now_in_timezone(tz: Tz) -> DateTime<FixedOffset> {
    let local = Utc::now().with_timezone(&tz);
    local.with_timezone(&local.offset().fix())
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
