//! Age buckets for superseded data.
//!
//! A row whose `_valid_to` is bounded belongs to the historical bucket that
//! closes at the first granularity boundary strictly after the last instant
//! it was valid. Unbounded rows are current and carry no bucket.

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime};

use crate::relation::END_OF_TIME;

/// Granularity of historical buckets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RecencyPartition {
    /// Buckets close on Mondays.
    #[default]
    Week,
    /// Buckets close on the first of each month.
    Month,
    /// Buckets close on January, April, July and October 1st.
    Quarter,
    /// Buckets close on January 1st.
    Year,
}

impl RecencyPartition {
    /// First boundary strictly after `date`.
    pub fn round_to_next(self, date: NaiveDate) -> NaiveDate {
        let next = match self {
            RecencyPartition::Week => {
                let offset = 7 - date.weekday().num_days_from_monday();
                date.checked_add_days(Days::new(u64::from(offset)))
            }
            RecencyPartition::Month => first_of_month(date.year(), date.month() + 1),
            RecencyPartition::Quarter => {
                let quarter_start = (date.month() - 1) / 3 * 3 + 1;
                first_of_month(date.year(), quarter_start + 3)
            }
            RecencyPartition::Year => NaiveDate::from_ymd_opt(date.year() + 1, 1, 1),
        };
        next.unwrap_or(NaiveDate::MAX)
    }

    /// Bucket of a row with upper validity bound `valid_to`; `None` is current.
    ///
    /// Bounds outside the calendar range are treated as current too.
    pub fn bucket_for(self, valid_to: i64) -> Option<NaiveDate> {
        if valid_to == END_OF_TIME {
            return None;
        }
        let last_valid = DateTime::from_timestamp_micros(valid_to.saturating_sub(1))?;
        Some(self.round_to_next(last_valid.date_naive()))
    }
}

fn first_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    if month > 12 {
        NaiveDate::from_ymd_opt(year + 1, month - 12, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month, 1)
    }
}

/// Micros at UTC midnight of `date`.
pub fn date_to_micros(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_micros()
}

/// Recency branch key of a bucket; current data sorts last.
pub fn bucket_boundary(bucket: Option<NaiveDate>) -> i64 {
    bucket.map(date_to_micros).unwrap_or(END_OF_TIME)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn week_rounds_to_strictly_next_monday() {
        let week = RecencyPartition::Week;
        // 2024-01-10 is a Wednesday
        assert_eq!(
            week.bucket_for(date_to_micros(date(2024, 1, 10))),
            Some(date(2024, 1, 15))
        );
        // a bound of Monday midnight was last valid on Sunday
        assert_eq!(
            week.bucket_for(date_to_micros(date(2024, 1, 15))),
            Some(date(2024, 1, 15))
        );
        assert_eq!(
            week.bucket_for(date_to_micros(date(2024, 1, 15)) + 1),
            Some(date(2024, 1, 22))
        );
    }

    #[test]
    fn month_quarter_and_year_boundaries() {
        let vt = date_to_micros(date(2024, 12, 20));
        assert_eq!(RecencyPartition::Month.bucket_for(vt), Some(date(2025, 1, 1)));
        assert_eq!(RecencyPartition::Quarter.bucket_for(vt), Some(date(2025, 1, 1)));
        assert_eq!(RecencyPartition::Year.bucket_for(vt), Some(date(2025, 1, 1)));

        let vt = date_to_micros(date(2024, 5, 2));
        assert_eq!(RecencyPartition::Month.bucket_for(vt), Some(date(2024, 6, 1)));
        assert_eq!(RecencyPartition::Quarter.bucket_for(vt), Some(date(2024, 7, 1)));

        // exactly on a boundary stays in the bucket closing there
        let vt = date_to_micros(date(2024, 4, 1));
        assert_eq!(RecencyPartition::Quarter.bucket_for(vt), Some(date(2024, 4, 1)));
    }

    #[test]
    fn unbounded_rows_are_current() {
        assert_eq!(RecencyPartition::Week.bucket_for(END_OF_TIME), None);
        assert_eq!(bucket_boundary(None), END_OF_TIME);
        assert_eq!(
            bucket_boundary(Some(date(1970, 1, 2))),
            86_400_000_000
        );
    }
}
