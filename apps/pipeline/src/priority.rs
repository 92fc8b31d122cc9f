//! Priority policy for ranking jobs.
//!
//! Small applicant pools finish fast, so they jump ahead of large backlogs in
//! the priority queue. The tier depends on nothing but the applicant count.

use serde::{Deserialize, Serialize};

/// Priority tier published with a ranking message. Values are broker priorities (0–10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low = 1,
    Normal = 5,
    High = 8,
    Critical = 10,
}

impl Priority {
    /// Step function over the applicant pool size, breakpoints at 10, 50 and 100.
    pub fn for_applicant_count(count: u64) -> Self {
        match count {
            0..=10 => Priority::Critical,
            11..=50 => Priority::High,
            51..=100 => Priority::Normal,
            _ => Priority::Low,
        }
    }

    pub fn value(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakpoints() {
        assert_eq!(Priority::for_applicant_count(0), Priority::Critical);
        assert_eq!(Priority::for_applicant_count(10), Priority::Critical);
        assert_eq!(Priority::for_applicant_count(11), Priority::High);
        assert_eq!(Priority::for_applicant_count(50), Priority::High);
        assert_eq!(Priority::for_applicant_count(51), Priority::Normal);
        assert_eq!(Priority::for_applicant_count(100), Priority::Normal);
        assert_eq!(Priority::for_applicant_count(101), Priority::Low);
        assert_eq!(Priority::for_applicant_count(u64::MAX), Priority::Low);
    }

    #[test]
    fn test_values_are_broker_priorities() {
        assert_eq!(Priority::Critical.value(), 10);
        assert_eq!(Priority::High.value(), 8);
        assert_eq!(Priority::Normal.value(), 5);
        assert_eq!(Priority::Low.value(), 1);
    }

    #[test]
    fn test_non_increasing_in_count() {
        let mut previous = Priority::for_applicant_count(0).value();
        for count in 1..=250 {
            let current = Priority::for_applicant_count(count).value();
            assert!(
                current <= previous,
                "priority rose from {previous} to {current} at count {count}"
            );
            previous = current;
        }
    }
}
