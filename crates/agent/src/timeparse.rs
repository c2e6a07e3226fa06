use casebook_core::chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc,
};
use regex::Regex;
use std::sync::OnceLock;

/// All conversational dates are interpreted in UTC+8.
pub fn conversation_tz() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).expect("UTC+8 is a valid offset")
}

pub fn now_local() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&conversation_tz())
}

/// A parsed point in time. `used_default_time` marks the 18:00 fallback so
/// replies can label it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedTime {
    pub at: DateTime<FixedOffset>,
    pub used_default_time: bool,
}

const DEFAULT_HOUR: u32 = 18;

fn time_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\d{1,2})\s*[点:：]\s*(\d{1,2})?\s*(半)?").expect("time pattern compiles")
    })
}

/// Relative day offset for a day word, if present.
fn day_offset(text: &str) -> Option<i64> {
    const WORDS: &[(&str, i64)] = &[
        ("大后天", 3),
        ("后天", 2),
        ("明天", 1),
        ("今天", 0),
        ("今晚", 0),
        ("昨天", -1),
        ("前天", -2),
    ];
    WORDS
        .iter()
        .find(|(word, _)| text.contains(word))
        .map(|(_, offset)| *offset)
}

fn weekday_offset(text: &str, now: DateTime<FixedOffset>) -> Option<i64> {
    const DAYS: &[(&str, u32)] = &[
        ("一", 1),
        ("二", 2),
        ("三", 3),
        ("四", 4),
        ("五", 5),
        ("六", 6),
        ("日", 7),
        ("天", 7),
    ];
    let next_week = text.contains("下周") || text.contains("下星期");
    let marker = if next_week { "下周" } else { "周" };
    let index = text.find(marker)?;
    let after = &text[index + marker.len()..];

    let target = DAYS
        .iter()
        .find(|(name, _)| after.starts_with(name))
        .map(|(_, number)| *number)?;
    let today = now.weekday().number_from_monday() as i64;
    let mut offset = target as i64 - today;
    if next_week {
        offset += 7;
    } else if offset < 0 {
        offset += 7;
    }
    Some(offset)
}

/// Hour/minute mentioned in the text, adjusted by 上午/下午/晚上 markers.
fn time_of_day(text: &str) -> Option<(u32, u32)> {
    let captures = time_pattern().captures(text)?;
    let mut hour: u32 = captures.get(1)?.as_str().parse().ok()?;
    let minute: u32 = match (captures.get(2), captures.get(3)) {
        (Some(minutes), _) => minutes.as_str().parse().ok()?,
        (None, Some(_half)) => 30,
        (None, None) => 0,
    };

    let afternoon = text.contains("下午") || text.contains("晚上") || text.contains("傍晚");
    if afternoon && hour < 12 {
        hour += 12;
    }
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

/// Parses a reminder time from free text. Returns None when no usable time
/// expression is found. A missing clock time defaults to 18:00, labeled.
pub fn parse_reminder_time(text: &str, now: DateTime<FixedOffset>) -> Option<ParsedTime> {
    let offset = day_offset(text).or_else(|| weekday_offset(text, now));
    let clock = time_of_day(text);

    if offset.is_none() && clock.is_none() {
        return None;
    }

    let date: NaiveDate = (now + Duration::days(offset.unwrap_or(0))).date_naive();
    let (hour, minute, used_default) = match clock {
        Some((hour, minute)) => (hour, minute, false),
        None => (DEFAULT_HOUR, 0, true),
    };

    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    let at = conversation_tz().from_local_datetime(&date.and_time(time)).single()?;
    Some(ParsedTime { at, used_default_time: used_default })
}

/// Inclusive epoch-ms range `[00:00:00, 23:59:59]` for a day word in the
/// conversation timezone.
pub fn day_range_ms(text: &str, now: DateTime<FixedOffset>) -> Option<(i64, i64)> {
    if text.contains("本周") || text.contains("这周") {
        let monday = now.date_naive()
            - Duration::days(now.weekday().number_from_monday() as i64 - 1);
        return week_range(monday);
    }
    if text.contains("下周") && weekday_offset(text, now).is_none() {
        let monday = now.date_naive()
            + Duration::days(8 - now.weekday().number_from_monday() as i64);
        return week_range(monday);
    }

    let offset = day_offset(text).or_else(|| weekday_offset(text, now))?;
    let date = (now + Duration::days(offset)).date_naive();
    day_bounds(date)
}

fn week_range(monday: NaiveDate) -> Option<(i64, i64)> {
    let (start, _) = day_bounds(monday)?;
    let (_, end) = day_bounds(monday + Duration::days(6))?;
    Some((start, end))
}

fn day_bounds(date: NaiveDate) -> Option<(i64, i64)> {
    let tz = conversation_tz();
    let start = tz.from_local_datetime(&date.and_time(NaiveTime::MIN)).single()?;
    let end = tz
        .from_local_datetime(&date.and_time(NaiveTime::from_hms_opt(23, 59, 59)?))
        .single()?;
    Some((start.timestamp_millis(), end.timestamp_millis()))
}
