//! Relative-age filtering for harvested reviews.

use chrono::{DateTime, Days, Duration, Months, Utc};

use crate::error::HarvestError;

/// Direction of an age comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgeState {
    /// Keep reviews created strictly before the cutoff.
    Older,
    /// Keep reviews created strictly after the cutoff.
    Newer,
}

/// Cutoff filter comparing review creation times against a fixed instant.
///
/// Built from CLI or config tokens such as `older 1y 3m`: a direction word
/// followed by one or more `<number><unit>` spans with units `y`, `m`, `d`,
/// `h`, and `min`. The spans are subtracted from `now` with calendar-aware
/// year and month arithmetic to produce the cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Age {
    state: AgeState,
    cutoff: DateTime<Utc>,
}

impl Age {
    /// Parse age tokens into a cutoff relative to `now`.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::InvalidAge`] when fewer than two tokens are
    /// given, when the first token is neither `older` nor `newer`, or when
    /// any span token does not match `<number><unit>`.
    pub fn parse(tokens: &[String], now: DateTime<Utc>) -> Result<Self, HarvestError> {
        if tokens.len() < 2 {
            return Err(HarvestError::InvalidAge {
                message: String::from("Missing arguments"),
            });
        }
        let mut iter = tokens.iter();
        let state = match iter.next().map(String::as_str) {
            Some("older") => AgeState::Older,
            Some("newer") => AgeState::Newer,
            _ => {
                return Err(HarvestError::InvalidAge {
                    message: String::from("Wrong or missing state, only older/newer is allowed"),
                });
            }
        };
        let mut years = 0_u32;
        let mut months = 0_u32;
        let mut days = 0_u32;
        let mut hours = 0_u32;
        let mut minutes = 0_u32;
        for token in iter {
            let Some((value, unit)) = split_span(token) else {
                return Err(HarvestError::InvalidAge {
                    message: format!("Invalid unit {token}"),
                });
            };
            // A repeated unit overrides the earlier span.
            match unit {
                "y" => years = value,
                "m" => months = value,
                "d" => days = value,
                "h" => hours = value,
                "min" => minutes = value,
                _ => {
                    return Err(HarvestError::InvalidAge {
                        message: format!("Invalid unit {token}"),
                    });
                }
            }
        }
        let cutoff = subtract_span(now, years, months, days, hours, minutes).ok_or_else(|| {
            HarvestError::InvalidAge {
                message: String::from("age is out of range"),
            }
        })?;
        Ok(Self { state, cutoff })
    }

    /// Report whether a review created at `created` passes the filter.
    ///
    /// Both directions compare strictly, so a review created exactly at the
    /// cutoff is excluded either way.
    #[must_use]
    pub fn allows(&self, created: DateTime<Utc>) -> bool {
        match self.state {
            AgeState::Older => created < self.cutoff,
            AgeState::Newer => created > self.cutoff,
        }
    }

    /// The direction of this filter.
    #[must_use]
    pub const fn state(&self) -> AgeState {
        self.state
    }

    /// The instant reviews are compared against.
    #[must_use]
    pub const fn cutoff(&self) -> DateTime<Utc> {
        self.cutoff
    }
}

/// Split a span token into its count and unit suffix.
fn split_span(token: &str) -> Option<(u32, &str)> {
    let digits_end = token
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(token.len());
    if digits_end == 0 {
        return None;
    }
    let (digits, unit) = token.split_at(digits_end);
    let value = digits.parse::<u32>().ok()?;
    Some((value, unit))
}

/// Subtract a calendar span from an instant, month units first.
fn subtract_span(
    now: DateTime<Utc>,
    years: u32,
    months: u32,
    days: u32,
    hours: u32,
    minutes: u32,
) -> Option<DateTime<Utc>> {
    let month_total = years.checked_mul(12)?.checked_add(months)?;
    let shifted = now
        .checked_sub_months(Months::new(month_total))?
        .checked_sub_days(Days::new(u64::from(days)))?;
    shifted.checked_sub_signed(Duration::hours(i64::from(hours)) + Duration::minutes(i64::from(minutes)))
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "Tests panic on failure")]
mod tests {
    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;

    fn tokens(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|part| String::from(*part)).collect()
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 6, 15, 12, 0, 0).unwrap()
    }

    #[rstest]
    #[case::missing_span(&["older"], "Missing arguments")]
    #[case::no_tokens(&[], "Missing arguments")]
    #[case::unknown_state(&["oldest", "1y"], "Wrong or missing state, only older/newer is allowed")]
    #[case::span_first(&["1y", "older"], "Wrong or missing state, only older/newer is allowed")]
    #[case::unknown_unit(&["older", "1w"], "Invalid unit 1w")]
    #[case::missing_count(&["older", "y"], "Invalid unit y")]
    #[case::trailing_garbage(&["newer", "1y2"], "Invalid unit 1y2")]
    fn rejects_malformed_tokens(#[case] parts: &[&str], #[case] message: &str) {
        let error = Age::parse(&tokens(parts), fixed_now()).unwrap_err();
        assert_eq!(
            error,
            HarvestError::InvalidAge {
                message: String::from(message),
            }
        );
    }

    #[rstest]
    #[case::years_and_months(&["older", "1y", "2m"], (2017, 4, 15, 12, 0))]
    #[case::days(&["older", "10d"], (2018, 6, 5, 12, 0))]
    #[case::hours_and_minutes(&["newer", "2h", "30min"], (2018, 6, 15, 9, 30))]
    #[case::repeated_unit_overrides(&["older", "2d", "5d"], (2018, 6, 10, 12, 0))]
    #[case::months_across_year_boundary(&["older", "7m"], (2017, 11, 15, 12, 0))]
    fn subtracts_spans_from_now(
        #[case] parts: &[&str],
        #[case] cutoff: (i32, u32, u32, u32, u32),
    ) {
        let age = Age::parse(&tokens(parts), fixed_now()).unwrap();
        let (y, mo, d, h, mi) = cutoff;
        assert_eq!(age.cutoff(), Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap());
    }

    #[rstest]
    #[case::older_passes_before_cutoff(&["older", "1d"], -2, true)]
    #[case::older_excludes_cutoff_itself(&["older", "1d"], 0, false)]
    #[case::older_rejects_after_cutoff(&["older", "1d"], 2, false)]
    #[case::newer_passes_after_cutoff(&["newer", "1d"], 2, true)]
    #[case::newer_excludes_cutoff_itself(&["newer", "1d"], 0, false)]
    #[case::newer_rejects_before_cutoff(&["newer", "1d"], -2, false)]
    fn compares_strictly(#[case] parts: &[&str], #[case] offset_hours: i64, #[case] allowed: bool) {
        let age = Age::parse(&tokens(parts), fixed_now()).unwrap();
        let created = age.cutoff() + Duration::hours(offset_hours);
        assert_eq!(age.allows(created), allowed);
    }
}
