use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use diarist_config::DiaryConfig;
use tracing::warn;

/// Maps users to the timezone their diary dates are computed in.
#[derive(Debug, Clone)]
pub struct TimezoneResolver {
    default_tz: Tz,
    per_user: HashMap<String, Tz>,
}

impl Default for TimezoneResolver {
    fn default() -> Self {
        Self::new(chrono_tz::UTC)
    }
}

impl TimezoneResolver {
    pub fn new(default_tz: Tz) -> Self {
        Self {
            default_tz,
            per_user: HashMap::new(),
        }
    }

    pub fn from_config(config: &DiaryConfig) -> Self {
        let mut resolver = Self::new(parse_tz(&config.timezone));
        for (user_id, name) in &config.user_timezones {
            resolver.per_user.insert(user_id.clone(), parse_tz(name));
        }
        resolver
    }

    pub fn with_user(mut self, user_id: impl Into<String>, tz: Tz) -> Self {
        self.per_user.insert(user_id.into(), tz);
        self
    }

    pub fn tz_for(&self, user_id: &str) -> Tz {
        self.per_user.get(user_id).copied().unwrap_or(self.default_tz)
    }

    pub fn date_of(&self, user_id: &str, timestamp: DateTime<Utc>) -> NaiveDate {
        timestamp.with_timezone(&self.tz_for(user_id)).date_naive()
    }
}

fn parse_tz(name: &str) -> Tz {
    name.parse().unwrap_or_else(|_| {
        warn!(tz = %name, "unrecognised timezone, falling back to UTC");
        chrono_tz::UTC
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn date_follows_user_timezone() {
        let mut config = DiaryConfig::default();
        config
            .user_timezones
            .insert("ou_ny".to_string(), "America/New_York".to_string());
        let resolver = TimezoneResolver::from_config(&config);

        // 2025-03-14 20:00 UTC is already the 15th in Shanghai.
        let ts = Utc.with_ymd_and_hms(2025, 3, 14, 20, 0, 0).unwrap();
        assert_eq!(
            resolver.date_of("ou_cn", ts),
            NaiveDate::from_ymd_opt(2025, 3, 15).unwrap()
        );
        assert_eq!(
            resolver.date_of("ou_ny", ts),
            NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
        );
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let config = DiaryConfig {
            timezone: "Mars/Olympus_Mons".to_string(),
            ..DiaryConfig::default()
        };
        let resolver = TimezoneResolver::from_config(&config);
        assert_eq!(resolver.tz_for("anyone"), chrono_tz::UTC);
    }
}
