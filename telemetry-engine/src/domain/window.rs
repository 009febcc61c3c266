use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::{Duration, Month, OffsetDateTime, Time};

use super::reading::to_utc;

/// Bucketing granularity. Windows are aligned to UTC calendar boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowSize {
    Hour,
    Day,
    Month,
}

impl WindowSize {
    /// Coarsest first.
    pub const COARSE_TO_FINE: [WindowSize; 3] = [WindowSize::Month, WindowSize::Day, WindowSize::Hour];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }

    /// Start of the window containing `ts`.
    pub fn floor(&self, ts: OffsetDateTime) -> OffsetDateTime {
        let ts = to_utc(ts);
        match self {
            Self::Hour => ts
                .replace_time(Time::MIDNIGHT)
                .saturating_add(Duration::hours(i64::from(ts.hour()))),
            Self::Day => ts.replace_time(Time::MIDNIGHT),
            Self::Month => ts.replace_time(Time::MIDNIGHT).saturating_sub(Duration::days(
                i64::from(ts.day()) - 1,
            )),
        }
    }

    /// Smallest window boundary `>= ts`.
    pub fn ceil(&self, ts: OffsetDateTime) -> OffsetDateTime {
        let floor = self.floor(ts);
        if floor == to_utc(ts) {
            floor
        } else {
            self.next(floor)
        }
    }

    /// Start of the window following the one starting at `start`.
    pub fn next(&self, start: OffsetDateTime) -> OffsetDateTime {
        match self {
            Self::Hour => start.saturating_add(Duration::HOUR),
            Self::Day => start.saturating_add(Duration::DAY),
            Self::Month => {
                let (year, month) = match start.month() {
                    Month::December => (start.year() + 1, Month::January),
                    m => (start.year(), m.next()),
                };
                start
                    .replace_day(1)
                    .and_then(|d| d.replace_month(month))
                    .and_then(|d| d.replace_year(year))
                    .unwrap_or(start)
            }
        }
    }

    /// Number of windows [`starts_in`](Self::starts_in) returns for the same
    /// range, computed without listing them.
    pub fn count_in(&self, from: OffsetDateTime, to: OffsetDateTime) -> u64 {
        if from >= to {
            return 0;
        }
        let first = self.floor(from);
        let last = self.floor(to);
        let whole = match self {
            Self::Hour => (last - first).whole_hours(),
            Self::Day => (last - first).whole_days(),
            Self::Month => {
                let ordinal = |t: OffsetDateTime| i64::from(t.year()) * 12 + i64::from(u8::from(t.month()));
                ordinal(last) - ordinal(first)
            }
        };
        let partial = i64::from(last < to);
        u64::try_from(whole + partial).unwrap_or(0)
    }

    /// Window starts covering `[from, to)`, in ascending order.
    pub fn starts_in(&self, from: OffsetDateTime, to: OffsetDateTime) -> Vec<OffsetDateTime> {
        let mut out = Vec::new();
        if from >= to {
            return out;
        }
        let mut cur = self.floor(from);
        while cur < to {
            out.push(cur);
            let next = self.next(cur);
            if next <= cur {
                break;
            }
            cur = next;
        }
        out
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WindowSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hour" | "1h" => Ok(Self::Hour),
            "day" | "1d" => Ok(Self::Day),
            "month" => Ok(Self::Month),
            other => Err(format!("unknown window size '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn floor_aligns_to_calendar_boundaries() {
        let ts = datetime!(2024-03-17 13:45:12 UTC);
        assert_eq!(WindowSize::Hour.floor(ts), datetime!(2024-03-17 13:00:00 UTC));
        assert_eq!(WindowSize::Day.floor(ts), datetime!(2024-03-17 00:00:00 UTC));
        assert_eq!(WindowSize::Month.floor(ts), datetime!(2024-03-01 00:00:00 UTC));
    }

    #[test]
    fn floor_normalizes_offsets() {
        let ts = datetime!(2024-03-01 01:30:00 +02:00);
        assert_eq!(WindowSize::Day.floor(ts), datetime!(2024-02-29 00:00:00 UTC));
        assert_eq!(WindowSize::Month.floor(ts), datetime!(2024-02-01 00:00:00 UTC));
    }

    #[test]
    fn next_month_rolls_over_year() {
        let dec = datetime!(2023-12-01 00:00:00 UTC);
        assert_eq!(WindowSize::Month.next(dec), datetime!(2024-01-01 00:00:00 UTC));
        let jan = datetime!(2024-01-01 00:00:00 UTC);
        assert_eq!(WindowSize::Month.next(jan), datetime!(2024-02-01 00:00:00 UTC));
    }

    #[test]
    fn ceil_keeps_boundaries_and_rounds_up_otherwise() {
        let boundary = datetime!(2024-01-02 00:00:00 UTC);
        assert_eq!(WindowSize::Day.ceil(boundary), boundary);
        assert_eq!(
            WindowSize::Day.ceil(datetime!(2024-01-02 00:00:01 UTC)),
            datetime!(2024-01-03 00:00:00 UTC)
        );
    }

    #[test]
    fn starts_in_covers_partial_edges() {
        let starts = WindowSize::Hour.starts_in(
            datetime!(2024-01-01 00:30:00 UTC),
            datetime!(2024-01-01 02:00:00 UTC),
        );
        assert_eq!(
            starts,
            vec![datetime!(2024-01-01 00:00:00 UTC), datetime!(2024-01-01 01:00:00 UTC)]
        );
        assert!(WindowSize::Hour
            .starts_in(datetime!(2024-01-01 02:00:00 UTC), datetime!(2024-01-01 01:00:00 UTC))
            .is_empty());
    }

    #[test]
    fn count_in_agrees_with_starts_in() {
        let ranges = [
            (datetime!(2024-01-01 00:30:00 UTC), datetime!(2024-01-01 02:00:00 UTC)),
            (datetime!(2024-01-01 00:00:00 UTC), datetime!(2024-01-01 00:00:00 UTC)),
            (datetime!(2023-11-15 12:00:00 UTC), datetime!(2024-03-01 00:00:00 UTC)),
            (datetime!(2023-11-15 12:00:00 UTC), datetime!(2024-03-01 00:00:01 UTC)),
            (datetime!(2024-02-28 23:59:59 +01:00), datetime!(2024-03-02 00:00:00 -05:00)),
        ];
        for size in WindowSize::COARSE_TO_FINE {
            for (from, to) in ranges {
                assert_eq!(size.count_in(from, to), size.starts_in(from, to).len() as u64, "{size} {from} {to}");
            }
        }
        assert_eq!(
            WindowSize::Hour.count_in(datetime!(2000-01-01 00:00:00 UTC), datetime!(2001-01-01 00:00:00 UTC)),
            366 * 24
        );
    }
}
