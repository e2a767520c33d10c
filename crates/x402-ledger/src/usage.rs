//! Per-subject, per-UTC-day spend accounting.

use chrono::{DateTime, Utc};

use crate::{clock::Clock, errors::Result, store::UsageStore, types::UsageRecord};

/// The UTC calendar date used to bucket daily spend, `YYYY-MM-DD`.
pub fn day_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// Tracks cumulative daily spend. No rollover job exists: crossing midnight
/// UTC simply starts a fresh zero-valued bucket under a new day key.
pub struct UsageAggregator<'g, S, C> {
    store: &'g S,
    clock: &'g C,
}

impl<'g, S: UsageStore, C: Clock> UsageAggregator<'g, S, C> {
    pub fn new(store: &'g S, clock: &'g C) -> Self {
        UsageAggregator { store, clock }
    }

    pub fn today(&self) -> String {
        day_key(self.clock.now())
    }

    /// Today's cumulative spend for the subject; 0 when no record exists.
    pub fn daily_spend(&self, subject_key: &str) -> Result<u64> {
        self.store.daily_spend(subject_key, &self.today())
    }

    /// Atomic upsert-and-increment; returns the new daily total.
    pub fn add_spend(&self, subject_key: &str, amount: u64) -> Result<u64> {
        let day = self.today();
        let total = self.store.add_spend(subject_key, &day, amount)?;

        #[cfg(feature = "tracing")]
        tracing::debug!("Spend recorded: subject='{subject_key}', day='{day}', total={total}");

        Ok(total)
    }

    /// Today's usage row for the subject, zero-valued when nothing was
    /// spent yet.
    pub fn today_record(&self, subject_key: &str) -> Result<UsageRecord> {
        let day_key = self.today();
        let spend_minor_units = self.store.daily_spend(subject_key, &day_key)?;
        Ok(UsageRecord {
            subject_key: subject_key.to_string(),
            day_key,
            spend_minor_units,
        })
    }

    /// Administrative/test reset of one day's record.
    pub fn reset_daily_spend(&self, subject_key: &str) -> Result<()> {
        self.store.reset_daily_spend(subject_key, &self.today())
    }
}
