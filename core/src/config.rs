//! Operational configuration snapshot.
//!
//! Admin-editable parameters arrive as `(key, value, type)` string triples.
//! [`BookingConfig::from_entries`] parses them defensively: an invalid value
//! is logged and the documented default is kept, so a bad admin edit never
//! takes the service down. The resulting snapshot is immutable and passed
//! explicitly into every decision for the duration of one operation.

use crate::assignment::SelectionPolicy;
use chrono::{Duration, FixedOffset, NaiveTime, Offset, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Declared type of a configuration value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigValueType {
    /// `true` / `false`
    Bool,
    /// Base-10 integer
    Int,
    /// Free-form string
    String,
}

impl ConfigValueType {
    /// Parses the stored type column; unknown names are treated as strings
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Self::Bool,
            "int" | "integer" | "number" => Self::Int,
            _ => Self::String,
        }
    }
}

/// One admin configuration row
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// Configuration key
    pub key: String,
    /// Raw value
    pub value: String,
    /// Declared type
    #[serde(rename = "type")]
    pub value_type: ConfigValueType,
}

impl ConfigEntry {
    /// Creates an entry
    pub fn new(key: impl Into<String>, value: impl Into<String>, value_type: ConfigValueType) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            value_type,
        }
    }
}

/// Recognized configuration keys
pub mod keys {
    /// Opening time, `HH:MM`
    pub const WORKING_HOURS_START: &str = "working_hours_start";
    /// Closing time, `HH:MM`
    pub const WORKING_HOURS_END: &str = "working_hours_end";
    /// Comma-separated weekdays (names or 0-6 with 0 = Sunday)
    pub const WORKING_DAYS: &str = "working_days";
    /// Advance-booking horizon in days
    pub const BOOKING_ADVANCE_DAYS: &str = "booking_advance_days";
    /// Free-cancellation cutoff in hours before start
    pub const BOOKING_CANCELLATION_HOURS: &str = "booking_cancellation_hours";
    /// Buffer between a worker's jobs in minutes
    pub const BOOKING_BUFFER_TIME_MINUTES: &str = "booking_buffer_time_minutes";
    /// Hold lifetime before payment is initiated
    pub const BOOKING_HOLD_TIME_MINUTES: &str = "booking_hold_time_minutes";
    /// Abandoned wallet payment timeout
    pub const WALLET_PAYMENT_TIMEOUT_MINUTES: &str = "wallet_payment_timeout_minutes";
    /// Backstop for gateway payments whose callback never arrives
    pub const GATEWAY_PAYMENT_TIMEOUT_MINUTES: &str = "gateway_payment_timeout_minutes";
    /// Dispatch automatically once funded
    pub const AUTO_ASSIGN_WORKERS_ON_BOOKING: &str = "auto_assign_workers_on_booking";
    /// Minutes a worker has to accept an offer
    pub const WORKER_ACCEPTANCE_TIMEOUT_MINUTES: &str = "worker_acceptance_timeout_minutes";
    /// Late-cancellation fee as a percentage of the total price
    pub const BOOKING_CANCELLATION_FEE_PERCENT: &str = "booking_cancellation_fee_percent";
    /// `rating` or `least_recent`
    pub const WORKER_SELECTION_POLICY: &str = "worker_selection_policy";
    /// Offset of local business time from UTC in minutes
    pub const TIMEZONE_OFFSET_MINUTES: &str = "timezone_offset_minutes";
}

/// Immutable configuration snapshot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingConfig {
    /// Opening time (local)
    pub working_hours_start: NaiveTime,
    /// Closing time (local)
    pub working_hours_end: NaiveTime,
    /// Days the business operates
    pub working_days: Vec<Weekday>,
    /// Advance-booking horizon in days
    pub booking_advance_days: i64,
    /// Free-cancellation cutoff in hours
    pub booking_cancellation_hours: i64,
    /// Buffer minutes between a worker's jobs
    pub booking_buffer_time_minutes: i64,
    /// Hold lifetime in minutes
    pub booking_hold_time_minutes: i64,
    /// Wallet payment timeout in minutes
    pub wallet_payment_timeout_minutes: i64,
    /// Gateway payment backstop in minutes
    pub gateway_payment_timeout_minutes: i64,
    /// Dispatch automatically once funded
    pub auto_assign_workers_on_booking: bool,
    /// Offer acceptance timeout in minutes
    pub worker_acceptance_timeout_minutes: i64,
    /// Late-cancellation fee percentage
    pub booking_cancellation_fee_percent: u32,
    /// Candidate ordering
    pub worker_selection_policy: SelectionPolicy,
    /// Local offset from UTC in minutes
    pub timezone_offset_minutes: i32,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            working_hours_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            working_hours_end: NaiveTime::from_hms_opt(18, 0, 0).unwrap_or_default(),
            working_days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
            ],
            booking_advance_days: 30,
            booking_cancellation_hours: 24,
            booking_buffer_time_minutes: 30,
            booking_hold_time_minutes: 10,
            wallet_payment_timeout_minutes: 15,
            gateway_payment_timeout_minutes: 60,
            auto_assign_workers_on_booking: true,
            worker_acceptance_timeout_minutes: 15,
            booking_cancellation_fee_percent: 10,
            worker_selection_policy: SelectionPolicy::HighestRating,
            timezone_offset_minutes: 0,
        }
    }
}

impl BookingConfig {
    /// Builds a snapshot from admin rows, falling back to defaults per key.
    ///
    /// Unknown keys are ignored. When a key appears twice the last row wins.
    #[must_use]
    pub fn from_entries(entries: &[ConfigEntry]) -> Self {
        let mut config = Self::default();
        for entry in entries {
            config.apply(entry);
        }

        if config.working_hours_end <= config.working_hours_start {
            let defaults = Self::default();
            tracing::warn!(
                start = %config.working_hours_start,
                end = %config.working_hours_end,
                "working hours window is empty, using defaults"
            );
            config.working_hours_start = defaults.working_hours_start;
            config.working_hours_end = defaults.working_hours_end;
        }

        config
    }

    fn apply(&mut self, entry: &ConfigEntry) {
        let value = entry.value.trim();
        match entry.key.as_str() {
            keys::WORKING_HOURS_START => set(&mut self.working_hours_start, entry, parse_time(value)),
            keys::WORKING_HOURS_END => set(&mut self.working_hours_end, entry, parse_time(value)),
            keys::WORKING_DAYS => set(&mut self.working_days, entry, parse_weekdays(value)),
            keys::BOOKING_ADVANCE_DAYS => {
                set(&mut self.booking_advance_days, entry, int_in(entry, 0, 3650));
            },
            keys::BOOKING_CANCELLATION_HOURS => {
                set(&mut self.booking_cancellation_hours, entry, int_in(entry, 0, 24 * 365));
            },
            keys::BOOKING_BUFFER_TIME_MINUTES => {
                set(&mut self.booking_buffer_time_minutes, entry, int_in(entry, 0, 24 * 60));
            },
            keys::BOOKING_HOLD_TIME_MINUTES => {
                set(&mut self.booking_hold_time_minutes, entry, int_in(entry, 1, 24 * 60));
            },
            keys::WALLET_PAYMENT_TIMEOUT_MINUTES => {
                set(&mut self.wallet_payment_timeout_minutes, entry, int_in(entry, 1, 24 * 60));
            },
            keys::GATEWAY_PAYMENT_TIMEOUT_MINUTES => {
                set(&mut self.gateway_payment_timeout_minutes, entry, int_in(entry, 1, 7 * 24 * 60));
            },
            keys::AUTO_ASSIGN_WORKERS_ON_BOOKING => {
                set(&mut self.auto_assign_workers_on_booking, entry, parse_bool(entry));
            },
            keys::WORKER_ACCEPTANCE_TIMEOUT_MINUTES => {
                set(&mut self.worker_acceptance_timeout_minutes, entry, int_in(entry, 1, 24 * 60));
            },
            keys::BOOKING_CANCELLATION_FEE_PERCENT => {
                let parsed = int_in(entry, 0, 100).and_then(|v| u32::try_from(v).ok());
                set(&mut self.booking_cancellation_fee_percent, entry, parsed);
            },
            keys::WORKER_SELECTION_POLICY => {
                set(&mut self.worker_selection_policy, entry, SelectionPolicy::parse(value));
            },
            keys::TIMEZONE_OFFSET_MINUTES => {
                let parsed = int_in(entry, -14 * 60, 14 * 60).and_then(|v| i32::try_from(v).ok());
                set(&mut self.timezone_offset_minutes, entry, parsed);
            },
            _ => {},
        }
    }

    /// Local business timezone
    #[must_use]
    pub fn timezone(&self) -> FixedOffset {
        FixedOffset::east_opt(self.timezone_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    /// Buffer between a worker's jobs
    #[must_use]
    pub fn buffer(&self) -> Duration {
        Duration::minutes(self.booking_buffer_time_minutes)
    }

    /// Hold lifetime
    #[must_use]
    pub fn hold_time(&self) -> Duration {
        Duration::minutes(self.booking_hold_time_minutes)
    }

    /// Wallet payment timeout
    #[must_use]
    pub fn wallet_payment_timeout(&self) -> Duration {
        Duration::minutes(self.wallet_payment_timeout_minutes)
    }

    /// Gateway payment backstop
    #[must_use]
    pub fn gateway_payment_timeout(&self) -> Duration {
        Duration::minutes(self.gateway_payment_timeout_minutes)
    }

    /// Free-cancellation cutoff
    #[must_use]
    pub fn cancellation_cutoff(&self) -> Duration {
        Duration::hours(self.booking_cancellation_hours)
    }

    /// Offer acceptance timeout
    #[must_use]
    pub fn acceptance_timeout(&self) -> Duration {
        Duration::minutes(self.worker_acceptance_timeout_minutes)
    }
}

fn set<T>(slot: &mut T, entry: &ConfigEntry, parsed: Option<T>) {
    match parsed {
        Some(value) => *slot = value,
        None => tracing::warn!(
            key = %entry.key,
            value = %entry.value,
            declared_type = ?entry.value_type,
            "invalid configuration value, keeping default"
        ),
    }
}

fn int_in(entry: &ConfigEntry, min: i64, max: i64) -> Option<i64> {
    if entry.value_type != ConfigValueType::Int {
        return None;
    }
    entry
        .value
        .trim()
        .parse::<i64>()
        .ok()
        .filter(|v| (min..=max).contains(v))
}

fn parse_bool(entry: &ConfigEntry) -> Option<bool> {
    if entry.value_type != ConfigValueType::Bool {
        return None;
    }
    match entry.value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .ok()
}

fn parse_weekdays(value: &str) -> Option<Vec<Weekday>> {
    let mut days = Vec::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let day = match part.parse::<u8>() {
            Ok(0 | 7) => Weekday::Sun,
            Ok(1) => Weekday::Mon,
            Ok(2) => Weekday::Tue,
            Ok(3) => Weekday::Wed,
            Ok(4) => Weekday::Thu,
            Ok(5) => Weekday::Fri,
            Ok(6) => Weekday::Sat,
            Ok(_) => return None,
            Err(_) => part.parse::<Weekday>().ok()?,
        };
        if !days.contains(&day) {
            days.push(day);
        }
    }
    (!days.is_empty()).then_some(days)
}
