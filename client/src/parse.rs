//! Argument value parsers for the CLI.

use chrono::{NaiveTime, Timelike, Weekday};

use homelink_common::{AlarmTime, Color, DayMask, ENVELOPE_SIZE};

/// `sunrise`, `sunset`, `HH:MM` or `HH:MM:SS` in controller-local time.
pub fn alarm_time(value: &str) -> Result<AlarmTime, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "sunrise" => Ok(AlarmTime::Sunrise),
        "sunset" => Ok(AlarmTime::Sunset),
        clock => NaiveTime::parse_from_str(clock, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(clock, "%H:%M"))
            .map(|time| AlarmTime::At(time.num_seconds_from_midnight()))
            .map_err(|_| format!("`{value}` is not sunrise, sunset, HH:MM or HH:MM:SS")),
    }
}

/// `all`, `weekdays`, `weekend`, or a comma list of day names (`mon,wed,fri`).
pub fn days(value: &str) -> Result<DayMask, String> {
    use Weekday::*;

    let value = value.trim().to_ascii_lowercase();
    let days: Vec<Weekday> = match value.as_str() {
        "all" | "daily" => return Ok(DayMask::ALL),
        "weekdays" => vec![Mon, Tue, Wed, Thu, Fri],
        "weekend" => vec![Sat, Sun],
        list => list
            .split(',')
            .map(|day| {
                day.trim()
                    .parse::<Weekday>()
                    .map_err(|_| format!("`{day}` is not a day name"))
            })
            .collect::<Result<_, _>>()?,
    };
    Ok(DayMask::from_weekdays(days))
}

/// `r,g,b` with each channel in `0..=255`.
pub fn color(value: &str) -> Result<Color, String> {
    let channels = value
        .split(',')
        .map(|part| part.trim().parse::<u8>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| format!("`{value}`: {err}"))?;
    match channels.as_slice() {
        [r, g, b] => Ok(Color::new(*r, *g, *b)),
        _ => Err(format!("`{value}` must have exactly three channels")),
    }
}

/// Up to one envelope of hex bytes; whitespace is ignored.
pub fn hex_bytes(value: &str) -> Result<Vec<u8>, String> {
    let digits: Vec<char> = value.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err("hex input has an odd number of digits".to_string());
    }
    let bytes = digits
        .chunks(2)
        .map(|pair| {
            let text: String = pair.iter().collect();
            u8::from_str_radix(&text, 16).map_err(|_| format!("`{text}` is not a hex byte"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if bytes.len() > ENVELOPE_SIZE {
        return Err(format!("{} bytes exceed one envelope", bytes.len()));
    }
    Ok(bytes)
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn times_accept_clock_and_sun_events() {
        assert_eq!(alarm_time("07:30"), Ok(AlarmTime::At(27_000)));
        assert_eq!(alarm_time("23:59:59"), Ok(AlarmTime::At(86_399)));
        assert_eq!(alarm_time("Sunset"), Ok(AlarmTime::Sunset));
        assert!(alarm_time("24:00").is_err());
        assert!(alarm_time("noon").is_err());
    }

    #[test]
    fn day_lists_map_to_sunday_based_bits() {
        assert_eq!(days("all"), Ok(DayMask::ALL));
        assert_eq!(days("sun,sat").map(DayMask::bits), Ok(0b100_0001));
        assert_eq!(days("weekdays").map(DayMask::bits), Ok(0b011_1110));
        assert!(days("mon,someday").is_err());
    }

    #[test]
    fn colors_need_three_bytes() {
        assert_eq!(color("255, 0,16"), Ok(Color::new(255, 0, 16)));
        assert!(color("1,2").is_err());
        assert!(color("1,2,300").is_err());
    }

    #[test]
    fn hex_input_is_bounded() {
        assert_eq!(hex_bytes("01 02 ff"), Ok(vec![1, 2, 255]));
        assert!(hex_bytes("abc").is_err());
        assert!(hex_bytes(&"00".repeat(ENVELOPE_SIZE + 1)).is_err());
        assert_eq!(to_hex(&[0, 171]), "00ab");
    }
}
