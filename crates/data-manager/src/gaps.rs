use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use trading_core::{Gap, GapKind, TimeRange, Timeframe};

use crate::calendar::TradingCalendar;

/// Classify every missing grid point of `range` and coalesce adjacent
/// points of the same kind into maximal gaps.
pub fn classify_gaps(
    timeframe: Timeframe,
    range: TimeRange,
    present: &BTreeSet<DateTime<Utc>>,
    calendar: &TradingCalendar,
) -> Vec<Gap> {
    let mut gaps: Vec<Gap> = Vec::new();

    for ts in timeframe.grid(range.start, range.end) {
        if present.contains(&ts) {
            continue;
        }
        let kind = classify_point(timeframe, ts, calendar);
        match gaps.last_mut() {
            // Extend the previous gap when this point is its immediate
            // grid successor and shares its kind.
            Some(last) if last.kind == kind && timeframe.next(last.end) == ts => {
                last.end = ts;
                last.points += 1;
            }
            _ => gaps.push(Gap {
                start: ts,
                end: ts,
                kind,
                points: 1,
            }),
        }
    }
    gaps
}

fn classify_point(timeframe: Timeframe, ts: DateTime<Utc>, calendar: &TradingCalendar) -> GapKind {
    if timeframe != Timeframe::Week1 && timeframe != Timeframe::Month1 && calendar.is_weekend(ts) {
        return GapKind::Weekend;
    }
    if timeframe == Timeframe::Day1 || timeframe.is_intraday() {
        if calendar.is_holiday(ts) {
            return GapKind::Holiday;
        }
    }
    if timeframe.is_intraday() && calendar.is_outside_trading_hours(ts) {
        return GapKind::OutsideTradingHours;
    }
    GapKind::Data
}

/// Fetchable ranges: `Data` gaps split into chunks of at most
/// `cap_points` grid points so no single provider call is unbounded.
pub fn fetch_ranges(gaps: &[Gap], timeframe: Timeframe, cap_points: usize) -> Vec<TimeRange> {
    let cap_points = cap_points.max(1);
    let mut ranges = Vec::new();
    for gap in gaps.iter().filter(|g| g.kind == GapKind::Data) {
        let mut chunk_start = gap.start;
        let mut count = 0usize;
        let mut ts = gap.start;
        loop {
            count += 1;
            let next = timeframe.next(ts);
            if count == cap_points || ts == gap.end {
                ranges.push(TimeRange::new(chunk_start, ts).expect("ordered gap bounds"));
                if ts == gap.end {
                    break;
                }
                chunk_start = next;
                count = 0;
            }
            ts = next;
        }
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: &str, end: &str) -> TimeRange {
        TimeRange::new(start.parse().unwrap(), end.parse().unwrap()).unwrap()
    }

    fn present(days: &[&str]) -> BTreeSet<DateTime<Utc>> {
        days.iter().map(|d| d.parse().unwrap()).collect()
    }

    #[test]
    fn weekend_and_data_gaps_classified_separately() {
        // Bars for Jan 2-5 and Jan 9-12, 2024; Jan 6/7 is a weekend and
        // Jan 8 (Monday) is a genuine data hole.
        let have = present(&[
            "2024-01-02T00:00:00Z",
            "2024-01-03T00:00:00Z",
            "2024-01-04T00:00:00Z",
            "2024-01-05T00:00:00Z",
            "2024-01-09T00:00:00Z",
            "2024-01-10T00:00:00Z",
            "2024-01-11T00:00:00Z",
            "2024-01-12T00:00:00Z",
        ]);
        let gaps = classify_gaps(
            Timeframe::Day1,
            range("2024-01-02T00:00:00Z", "2024-01-12T00:00:00Z"),
            &have,
            &TradingCalendar::default(),
        );

        assert_eq!(gaps.len(), 2);
        assert_eq!(gaps[0].kind, GapKind::Weekend);
        assert_eq!(gaps[0].points, 2);
        assert_eq!(gaps[1].kind, GapKind::Data);
        assert_eq!(gaps[1].start, "2024-01-08T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert_eq!(gaps[1].points, 1);
    }

    #[test]
    fn holiday_points_are_not_data_gaps() {
        let gaps = classify_gaps(
            Timeframe::Day1,
            range("2024-01-01T00:00:00Z", "2024-01-02T00:00:00Z"),
            &present(&["2024-01-02T00:00:00Z"]),
            &TradingCalendar::default(),
        );
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].kind, GapKind::Holiday);
    }

    #[test]
    fn intraday_off_session_points_classified() {
        // Monday 2024-01-08, hourly grid over the whole day; only the
        // session hours should be data gaps.
        let gaps = classify_gaps(
            Timeframe::Hour1,
            range("2024-01-08T00:00:00Z", "2024-01-08T23:00:00Z"),
            &BTreeSet::new(),
            &TradingCalendar::default(),
        );
        let data_points: usize = gaps
            .iter()
            .filter(|g| g.kind == GapKind::Data)
            .map(|g| g.points)
            .sum();
        let off_points: usize = gaps
            .iter()
            .filter(|g| g.kind == GapKind::OutsideTradingHours)
            .map(|g| g.points)
            .sum();
        // Session 14:30-21:00 UTC covers hourly points 15..=20 plus 14:00?
        // 14:00 is before the open, so 6 in-session points.
        assert_eq!(data_points, 6);
        assert_eq!(off_points, 24 - 6);
    }

    #[test]
    fn fetch_ranges_chunked_by_cap() {
        let gap = Gap {
            start: "2024-01-01T00:00:00Z".parse().unwrap(),
            end: "2024-01-10T00:00:00Z".parse().unwrap(),
            kind: GapKind::Data,
            points: 10,
        };
        let ranges = fetch_ranges(&[gap], Timeframe::Day1, 4);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0], range("2024-01-01T00:00:00Z", "2024-01-04T00:00:00Z"));
        assert_eq!(ranges[1], range("2024-01-05T00:00:00Z", "2024-01-08T00:00:00Z"));
        assert_eq!(ranges[2], range("2024-01-09T00:00:00Z", "2024-01-10T00:00:00Z"));
    }

    #[test]
    fn non_data_gaps_are_never_fetched() {
        let gap = Gap {
            start: "2024-01-06T00:00:00Z".parse().unwrap(),
            end: "2024-01-07T00:00:00Z".parse().unwrap(),
            kind: GapKind::Weekend,
            points: 2,
        };
        assert!(fetch_ranges(&[gap], Timeframe::Day1, 100).is_empty());
    }
}
