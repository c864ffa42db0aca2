use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, warn};

/// Daily request budget against the provider, reset at 00:00 UTC.
#[derive(Debug)]
pub struct DailyQuota {
    ceiling: u32,
    used: u32,
    day: NaiveDate,
    exhausted_logged: bool,
}

impl DailyQuota {
    pub fn new(ceiling: u32, now: DateTime<Utc>) -> Self {
        DailyQuota {
            ceiling,
            used: 0,
            day: now.date_naive(),
            exhausted_logged: false,
        }
    }

    /// Count one request. `false` means the budget is spent for today and
    /// no request may be made.
    pub fn try_consume(&mut self, now: DateTime<Utc>) -> bool {
        self.roll_over(now);
        if self.used >= self.ceiling {
            if !self.exhausted_logged {
                warn!(
                    used = self.used,
                    ceiling = self.ceiling,
                    "Daily request quota exhausted, failing fast until 00:00 UTC"
                );
                self.exhausted_logged = true;
            }
            return false;
        }
        self.used += 1;
        true
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    fn roll_over(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.day {
            if self.used > 0 {
                info!(previous_day = %self.day, used = self.used, "Daily request quota reset");
            }
            self.day = today;
            self.used = 0;
            self.exhausted_logged = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ceiling_and_midnight_reset() {
        let evening = Utc.with_ymd_and_hms(2024, 5, 4, 23, 59, 0).unwrap();
        let mut quota = DailyQuota::new(3, evening);
        assert!(quota.try_consume(evening));
        assert!(quota.try_consume(evening));
        assert!(quota.try_consume(evening));
        assert!(!quota.try_consume(evening));
        assert_eq!(quota.used(), 3);

        let midnight = Utc.with_ymd_and_hms(2024, 5, 5, 0, 0, 0).unwrap();
        assert!(quota.try_consume(midnight));
        assert_eq!(quota.used(), 1);
    }
}
