use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Searches stop after this many years without a match (e.g. `0 0 30 2 *`).
const SEARCH_HORIZON_YEARS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    restricted: bool,
}

impl Field {
    fn contains(self, value: u32) -> bool {
        self.bits & (1_u64 << value) != 0
    }
}

/// Parsed cron expression: `min hour dom month dow`, optionally preceded by a
/// seconds field. Supports `*`, lists, ranges, steps and month/weekday names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    seconds: Field,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, String> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        let (seconds, rest) = match parts.len() {
            5 => ("0", &parts[..]),
            6 => (parts[0], &parts[1..]),
            other => {
                return Err(format!(
                    "expected 5 or 6 fields (sec? min hour dom month dow), got {other}"
                ));
            }
        };

        let mut days_of_week = parse_field(rest[4], 0, 7, Some(&WEEKDAY_NAMES), "day-of-week")?;
        // 7 is an alias for Sunday.
        if days_of_week.contains(7) {
            days_of_week.bits = (days_of_week.bits & !(1 << 7)) | 1;
        }

        Ok(Self {
            expression: parts.join(" "),
            seconds: parse_field(seconds, 0, 59, None, "second")?,
            minutes: parse_field(rest[0], 0, 59, None, "minute")?,
            hours: parse_field(rest[1], 0, 23, None, "hour")?,
            days_of_month: parse_field(rest[2], 1, 31, None, "day-of-month")?,
            months: parse_field(rest[3], 1, 12, Some(&MONTH_NAMES), "month")?,
            days_of_week,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First occurrence strictly after `after`, evaluated in `timezone`.
    pub fn next_after(&self, after: DateTime<Utc>, timezone: FixedOffset) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&timezone).naive_local();
        let mut probe = local.with_nanosecond(0)? + Duration::seconds(1);
        let horizon = local.year() + SEARCH_HORIZON_YEARS;

        while probe.year() <= horizon {
            if !self.months.contains(probe.month()) {
                probe = first_of_next_month(probe.date())?;
                continue;
            }
            if !self.day_matches(probe.date()) {
                probe = probe.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(probe.hour()) {
                probe = probe.with_minute(0)?.with_second(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(probe.minute()) {
                probe = probe.with_second(0)? + Duration::minutes(1);
                continue;
            }
            if !self.seconds.contains(probe.second()) {
                probe += Duration::seconds(1);
                continue;
            }
            return timezone
                .from_local_datetime(&probe)
                .single()
                .map(|value| value.with_timezone(&Utc));
        }
        None
    }

    /// Longest gap between consecutive occurrences over a short sample after
    /// `from`. Daily schedules yield 24 hours.
    pub fn period_hint(&self, from: DateTime<Utc>, timezone: FixedOffset) -> Option<Duration> {
        let mut previous = self.next_after(from, timezone)?;
        let mut longest: Option<Duration> = None;
        for _ in 0..8 {
            let Some(next) = self.next_after(previous, timezone) else {
                break;
            };
            let gap = next - previous;
            longest = Some(longest.map_or(gap, |current| current.max(gap)));
            previous = next;
        }
        longest
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (
            self.days_of_month.restricted,
            self.days_of_week.restricted,
        ) {
            // Classic cron: when both are restricted either one may match.
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

impl std::fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Parses `UTC`, `Z`, `+08:00`, `-0530`, `+09` or `UTC+08:00` into a fixed offset.
pub fn parse_timezone(raw: &str) -> Result<FixedOffset, String> {
    let trimmed = raw.trim();
    let upper = trimmed.to_ascii_uppercase();
    let offset = upper
        .strip_prefix("UTC")
        .or_else(|| upper.strip_prefix("GMT"))
        .unwrap_or(&upper);
    if offset.is_empty() || offset == "Z" {
        return FixedOffset::east_opt(0).ok_or_else(|| "invalid zero offset".to_string());
    }

    let (sign, digits) = match offset.as_bytes().first() {
        Some(b'+') => (1, &offset[1..]),
        Some(b'-') => (-1, &offset[1..]),
        _ => {
            return Err(format!(
                "unsupported timezone {trimmed:?}: use UTC or a fixed offset like +08:00"
            ));
        }
    };
    let compact: String = digits.chars().filter(|c| *c != ':').collect();
    let (hours, minutes) = match compact.len() {
        1 | 2 => (compact.as_str(), "0"),
        4 => (&compact[..2], &compact[2..]),
        _ => return Err(format!("invalid offset {trimmed:?}")),
    };
    let hours: i32 = hours
        .parse()
        .map_err(|_| format!("invalid offset hours in {trimmed:?}"))?;
    let minutes: i32 = minutes
        .parse()
        .map_err(|_| format!("invalid offset minutes in {trimmed:?}"))?;
    if hours > 14 || minutes > 59 {
        return Err(format!("offset out of range: {trimmed:?}"));
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| format!("offset out of range: {trimmed:?}"))
}

pub fn format_timezone(offset: FixedOffset) -> String {
    if offset.local_minus_utc() == 0 {
        "UTC".to_string()
    } else {
        offset.to_string()
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDateTime> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn parse_field(
    raw: &str,
    min: u32,
    max: u32,
    names: Option<&[&str]>,
    label: &str,
) -> Result<Field, String> {
    let mut bits = 0_u64;
    let mut restricted = true;

    for item in raw.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid {label} step {step:?}"))?;
                if step == 0 {
                    return Err(format!("{label} step must be positive"));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if range == "*" {
            if step.is_none() && raw == "*" {
                restricted = false;
            }
            (min, max)
        } else if let Some((start, end)) = range.split_once('-') {
            (
                parse_value(start, min, names, label)?,
                parse_value(end, min, names, label)?,
            )
        } else {
            let start = parse_value(range, min, names, label)?;
            // `5/15` means "from 5 to the end, every 15".
            (start, if step.is_some() { max } else { start })
        };

        if start < min || end > max || start > end {
            return Err(format!(
                "{label} range {range:?} outside {min}-{max}"
            ));
        }
        let step = step.unwrap_or(1);
        let mut value = start;
        while value <= end {
            bits |= 1_u64 << value;
            value += step;
        }
    }

    if bits == 0 {
        return Err(format!("empty {label} field"));
    }
    Ok(Field { bits, restricted })
}

fn parse_value(raw: &str, min: u32, names: Option<&[&str]>, label: &str) -> Result<u32, String> {
    if let Ok(value) = raw.parse::<u32>() {
        return Ok(value);
    }
    let upper = raw.to_ascii_uppercase();
    names
        .and_then(|names| names.iter().position(|name| *name == upper))
        .and_then(|index| u32::try_from(index).ok())
        .map(|index| index + min)
        .ok_or_else(|| format!("invalid {label} value {raw:?}"))
}
