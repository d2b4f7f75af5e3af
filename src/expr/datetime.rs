use chrono::{DateTime, Datelike, Timelike, Utc};

/// Date-part extraction and formatting. Week numbering is ISO-8601.

pub fn year(ts: &DateTime<Utc>) -> i64 {
    ts.year() as i64
}

pub fn month(ts: &DateTime<Utc>) -> i64 {
    ts.month() as i64
}

pub fn day_of_month(ts: &DateTime<Utc>) -> i64 {
    ts.day() as i64
}

/// 1 (Sunday) through 7 (Saturday).
pub fn day_of_week(ts: &DateTime<Utc>) -> i64 {
    ts.weekday().num_days_from_sunday() as i64 + 1
}

pub fn day_of_year(ts: &DateTime<Utc>) -> i64 {
    ts.ordinal() as i64
}

pub fn iso_week(ts: &DateTime<Utc>) -> i64 {
    ts.iso_week().week() as i64
}

pub fn iso_week_year(ts: &DateTime<Utc>) -> i64 {
    ts.iso_week().year() as i64
}

pub fn hour(ts: &DateTime<Utc>) -> i64 {
    ts.hour() as i64
}

pub fn minute(ts: &DateTime<Utc>) -> i64 {
    ts.minute() as i64
}

pub fn second(ts: &DateTime<Utc>) -> i64 {
    ts.second() as i64
}

pub fn millisecond(ts: &DateTime<Utc>) -> i64 {
    (ts.nanosecond() / 1_000_000) as i64
}

/// Format with `%`-directives. Unknown directives pass through verbatim.
pub fn format(ts: &DateTime<Utc>, spec: &str) -> String {
    let mut out = String::with_capacity(spec.len() + 8);
    let mut chars = spec.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str(&format!("{:04}", ts.year())),
            Some('m') => out.push_str(&format!("{:02}", ts.month())),
            Some('d') => out.push_str(&format!("{:02}", ts.day())),
            Some('H') => out.push_str(&format!("{:02}", ts.hour())),
            Some('M') => out.push_str(&format!("{:02}", ts.minute())),
            Some('S') => out.push_str(&format!("{:02}", ts.second())),
            Some('L') => out.push_str(&format!("{:03}", millisecond(ts))),
            Some('j') => out.push_str(&format!("{:03}", ts.ordinal())),
            Some('w') => out.push_str(&day_of_week(ts).to_string()),
            Some('u') => out.push_str(&(ts.weekday().num_days_from_monday() + 1).to_string()),
            Some('G') => out.push_str(&format!("{:04}", iso_week_year(ts))),
            Some('V') => out.push_str(&format!("{:02}", iso_week(ts))),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_parts() {
        // 2024-02-29 is a Thursday.
        let t = ts("2024-02-29T13:45:30.250Z");
        assert_eq!(year(&t), 2024);
        assert_eq!(month(&t), 2);
        assert_eq!(day_of_month(&t), 29);
        assert_eq!(day_of_week(&t), 5);
        assert_eq!(day_of_year(&t), 60);
        assert_eq!(hour(&t), 13);
        assert_eq!(minute(&t), 45);
        assert_eq!(second(&t), 30);
        assert_eq!(millisecond(&t), 250);
    }

    #[test]
    fn test_iso_week_boundaries() {
        // 2021-01-01 is a Friday and belongs to ISO week 53 of 2020.
        let t = ts("2021-01-01T00:00:00Z");
        assert_eq!(iso_week(&t), 53);
        assert_eq!(iso_week_year(&t), 2020);

        let t = ts("2021-01-04T00:00:00Z"); // first Monday
        assert_eq!(iso_week(&t), 1);
    }

    #[test]
    fn test_format() {
        let t = ts("2024-03-07T09:05:02.007Z");
        assert_eq!(format(&t, "%Y-%m-%d %H:%M:%S.%L"), "2024-03-07 09:05:02.007");
        assert_eq!(format(&t, "week %V of %G"), "week 10 of 2024");
        assert_eq!(format(&t, "100%%"), "100%");
        let epoch = Utc.timestamp_millis_opt(0).unwrap();
        assert_eq!(format(&epoch, "%Y-%m-%d"), "1970-01-01");
    }
}
