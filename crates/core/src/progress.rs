//! Plan-level completion percentage.
//!
//! Every code path that needs a plan's progress goes through [`aggregate`].

use crate::model::Day;

/// Completion percentage of all sessions under `days`, rounded half up.
///
/// Returns `0` for a plan without sessions. Day order does not matter.
#[must_use]
pub fn aggregate(days: &[Day]) -> u8 {
    let (done, total) = days
        .iter()
        .flat_map(|day| day.sessions())
        .fold((0_u64, 0_u64), |(done, total), session| {
            (done + u64::from(session.is_completed()), total + 1)
        });
    percentage(done, total)
}

/// `round(100 * done / total)` in integer arithmetic; `0` when `total == 0`.
#[must_use]
pub fn percentage(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let done = done.min(total);
    let rounded = (200 * done + total) / (2 * total);
    u8::try_from(rounded).unwrap_or(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Session;
    use proptest::prelude::*;

    fn day(number: u32, completed: &[bool]) -> Day {
        let sessions = completed
            .iter()
            .map(|done| {
                let mut s = Session::new("S", "", 10).unwrap();
                if *done {
                    s.mark_completed();
                }
                s
            })
            .collect();
        Day::new(number, "2024-01-01", sessions)
    }

    #[test]
    fn empty_plan_is_zero() {
        assert_eq!(aggregate(&[]), 0);
        assert_eq!(aggregate(&[day(1, &[]), day(2, &[])]), 0);
    }

    #[test]
    fn half_of_four_is_fifty() {
        let mut days = vec![day(1, &[false, false, false, false])];
        assert_eq!(aggregate(&days), 0);
        days[0].sessions_mut()[0].mark_completed();
        days[0].sessions_mut()[2].mark_completed();
        assert_eq!(aggregate(&days), 50);
    }

    #[test]
    fn rounds_half_up() {
        // 1/8 = 12.5% and 1/3 = 33.33%
        assert_eq!(percentage(1, 8), 13);
        assert_eq!(percentage(1, 3), 33);
        assert_eq!(percentage(2, 3), 67);
    }

    #[test]
    fn counts_across_days() {
        let days = vec![day(1, &[true, false]), day(2, &[true]), day(3, &[false])];
        assert_eq!(aggregate(&days), 50);
    }

    proptest! {
        #[test]
        fn aggregate_matches_formula(tree in prop::collection::vec(prop::collection::vec(any::<bool>(), 0..8), 0..8)) {
            let days: Vec<Day> = tree
                .iter()
                .enumerate()
                .map(|(i, flags)| day(u32::try_from(i + 1).unwrap(), flags))
                .collect();
            let total = tree.iter().map(Vec::len).sum::<usize>();
            let done = tree.iter().flatten().filter(|d| **d).count();
            let expected = if total == 0 {
                0
            } else {
                (100.0 * done as f64 / total as f64).round() as u8
            };
            prop_assert_eq!(aggregate(&days), expected);
        }

        #[test]
        fn aggregate_ignores_day_order(tree in prop::collection::vec(prop::collection::vec(any::<bool>(), 0..6), 1..6)) {
            let days: Vec<Day> = tree.iter().map(|flags| day(1, flags)).collect();
            let mut reversed = days.clone();
            reversed.reverse();
            prop_assert_eq!(aggregate(&days), aggregate(&reversed));
        }
    }
}
