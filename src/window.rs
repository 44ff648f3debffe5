use chrono::{DateTime, Duration, Utc};

/// Inclusive range of completion instants a group looks back over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl RollWindow {
    /// `[now - weeks, now]`. Zero weeks collapses the window onto `now`; a
    /// width reaching past the representable range starts at the earliest instant.
    pub fn trailing(now: DateTime<Utc>, number_of_weeks: i32) -> Self {
        let weeks = i64::from(number_of_weeks.max(0));
        let from = Duration::try_weeks(weeks)
            .and_then(|width| now.checked_sub_signed(width))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self { from, to: now }
    }

    /// Rolls that were never completed fall outside every window.
    pub fn contains(&self, completed_at: Option<DateTime<Utc>>) -> bool {
        completed_at.is_some_and(|at| at >= self.from && at <= self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 16, 9, 30, 0).unwrap()
    }

    #[test]
    fn window_spans_requested_weeks() {
        let window = RollWindow::trailing(now(), 2);
        assert_eq!(window.from, now() - Duration::days(14));
        assert_eq!(window.to, now());
    }

    #[test]
    fn both_ends_are_inclusive() {
        let window = RollWindow::trailing(now(), 2);
        assert!(window.contains(Some(window.from)));
        assert!(window.contains(Some(window.to)));
        assert!(!window.contains(Some(window.from - Duration::seconds(1))));
        assert!(!window.contains(Some(window.to + Duration::seconds(1))));
    }

    #[test]
    fn zero_weeks_only_matches_the_reference_instant() {
        let window = RollWindow::trailing(now(), 0);
        assert!(window.contains(Some(now())));
        assert!(!window.contains(Some(now() - Duration::seconds(1))));
    }

    #[test]
    fn oversized_window_clamps_instead_of_overflowing() {
        let window = RollWindow::trailing(now(), 20_000_000);
        assert_eq!(window.from, DateTime::<Utc>::MIN_UTC);
        assert_eq!(window.to, now());
        assert!(window.contains(Some(Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0).unwrap())));

        let widest = RollWindow::trailing(now(), i32::MAX);
        assert_eq!(widest.from, DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn incomplete_rolls_are_excluded() {
        let window = RollWindow::trailing(now(), 52);
        assert!(!window.contains(None));
    }
}
