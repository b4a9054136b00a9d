//! Calendar-aware elapsed-time rendering and comment freshness checks.

use chrono::{DateTime, Datelike, Months, Utc};

const MINUTES_PER_HOUR: i64 = 60;
const MINUTES_PER_DAY: i64 = 24 * MINUTES_PER_HOUR;

/// Render the gap between `from` and `now` using the two largest non-zero
/// calendar units, for example `1 month 2 days` or `3 hours`.
///
/// Years and months honour calendar boundaries, so a review filed on the
/// 31st of January is one month old on the 28th of February. A trailing
/// minutes entry is dropped when a larger unit already appears, and gaps
/// under one minute (including a `from` in the future) render as
/// `less than 1 minute`.
#[must_use]
pub fn format_duration(from: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let mut entries: Vec<String> = Vec::new();
    let mut minutes_last = false;
    for (value, unit) in calendar_parts(from, now) {
        if value == 0 {
            continue;
        }
        if value == 1 {
            entries.push(format!("1 {unit}"));
        } else {
            entries.push(format!("{value} {unit}s"));
        }
        minutes_last = unit == "minute";
    }
    if entries.len() > 1 && minutes_last {
        entries.pop();
    }
    if entries.is_empty() {
        return String::from("less than 1 minute");
    }
    entries.truncate(2);
    entries.join(" ")
}

/// Report whether the latest comment activity falls inside a freshness
/// window of `days` whole days before `now`.
///
/// A zero-day window never matches, so callers can pass the raw value of
/// an optional threshold without special-casing it.
#[must_use]
pub fn has_new_comments(last_activity: DateTime<Utc>, days: u32, now: DateTime<Utc>) -> bool {
    days > 0 && now.signed_duration_since(last_activity).num_days() < i64::from(days)
}

/// Break the span between two instants into ordered calendar units.
fn calendar_parts(from: DateTime<Utc>, to: DateTime<Utc>) -> [(i64, &'static str); 5] {
    if to <= from {
        return [
            (0, "year"),
            (0, "month"),
            (0, "day"),
            (0, "hour"),
            (0, "minute"),
        ];
    }
    let mut whole_months = i64::from(to.year()) * 12 + i64::from(to.month())
        - i64::from(from.year()) * 12
        - i64::from(from.month());
    // The raw month count overshoots when `to` sits earlier in its month
    // than `from` does in its own.
    if whole_months > 0 && shift_months(from, whole_months) > to {
        whole_months -= 1;
    }
    if whole_months < 0 {
        whole_months = 0;
    }
    let anchor = shift_months(from, whole_months);
    let total_minutes = to.signed_duration_since(anchor).num_minutes().max(0);
    [
        (whole_months.div_euclid(12), "year"),
        (whole_months.rem_euclid(12), "month"),
        (total_minutes.div_euclid(MINUTES_PER_DAY), "day"),
        (
            total_minutes.rem_euclid(MINUTES_PER_DAY).div_euclid(MINUTES_PER_HOUR),
            "hour",
        ),
        (total_minutes.rem_euclid(MINUTES_PER_HOUR), "minute"),
    ]
}

/// Advance an instant by a positive number of months, clamping to the last
/// day of the target month where needed.
fn shift_months(from: DateTime<Utc>, months: i64) -> DateTime<Utc> {
    u32::try_from(months)
        .ok()
        .and_then(|count| from.checked_add_months(Months::new(count)))
        .unwrap_or(from)
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "Tests panic on failure")]
mod tests {
    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;

    fn moment(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[rstest]
    #[case::exact_month(moment(2018, 2, 2, 0, 0, 0), moment(2018, 3, 2, 0, 0, 0), "1 month")]
    #[case::created_in_future(
        moment(2018, 3, 2, 0, 0, 0),
        moment(2018, 2, 2, 0, 0, 0),
        "less than 1 minute"
    )]
    #[case::seconds_only(
        moment(2018, 1, 1, 0, 0, 0),
        moment(2018, 1, 1, 0, 0, 30),
        "less than 1 minute"
    )]
    #[case::month_and_days(
        moment(2018, 1, 1, 12, 0, 0),
        moment(2018, 2, 3, 12, 0, 0),
        "1 month 2 days"
    )]
    #[case::plural_units(
        moment(2016, 1, 1, 0, 0, 0),
        moment(2018, 4, 1, 0, 0, 0),
        "2 years 3 months"
    )]
    #[case::trailing_minutes_dropped(
        moment(2018, 1, 1, 0, 0, 0),
        moment(2018, 1, 1, 1, 5, 0),
        "1 hour"
    )]
    #[case::minutes_alone(moment(2018, 1, 1, 0, 0, 0), moment(2018, 1, 1, 0, 5, 0), "5 minutes")]
    #[case::truncated_to_two_units(
        moment(2017, 1, 1, 0, 0, 0),
        moment(2018, 1, 3, 3, 0, 0),
        "1 year 2 days"
    )]
    #[case::month_end_clamped(
        moment(2018, 1, 31, 0, 0, 0),
        moment(2018, 3, 1, 0, 0, 0),
        "1 month 1 day"
    )]
    fn renders_two_largest_calendar_units(
        #[case] created: DateTime<Utc>,
        #[case] now: DateTime<Utc>,
        #[case] rendered: &str,
    ) {
        assert_eq!(format_duration(created, now), rendered);
    }

    #[rstest]
    #[case::within_window(599, 600, true)]
    #[case::at_window_boundary(600, 600, false)]
    #[case::outside_window(601, 600, false)]
    #[case::zero_window(1, 0, false)]
    fn flags_recent_comment_activity(
        #[case] days_ago: i64,
        #[case] window: u32,
        #[case] fresh: bool,
    ) {
        let now = moment(2018, 6, 1, 0, 0, 0);
        let last = now - chrono::Duration::days(days_ago);
        assert_eq!(has_new_comments(last, window, now), fresh);
    }
}
