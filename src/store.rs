//! # Call Store
//!
//! The business directory and call/transcript records the relay reports to.
//!
//! ## Key Components:
//! - **BusinessProfile**: who answers a dialed number, and how
//! - **CallStore**: async interface for looking up businesses and recording
//!   calls and transcripts
//! - **InMemoryCallStore**: process-local implementation seeded from config
//!
//! Instructions for the model are composed per call from the base
//! instructions and the called business.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Opening hours for one day of the week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaySchedule {
    pub day: String,
    pub is_open: bool,
    #[serde(default)]
    pub opening_time: Option<String>,
    #[serde(default)]
    pub closing_time: Option<String>,
}

/// A business that answers calls on `phone_number`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessProfile {
    pub phone_number: String,
    pub name: String,
    #[serde(default)]
    pub operator_instructions: String,
    #[serde(default)]
    pub schedule: Vec<DaySchedule>,
}

/// One line of a call transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub text: String,
    pub is_agent: bool,
    pub at: DateTime<Utc>,
}

/// A recorded call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRecord {
    pub id: String,
    pub caller_number: String,
    pub phone_number_id: u64,
    /// `YYYY-MM-DD`, UTC.
    pub date: String,
    /// `HH:MM:SS`, 24-hour, UTC.
    pub time: String,
    /// `HH:MM:SS`; `00:00:00` until the call finishes.
    pub duration: String,
    pub transcripts: Vec<TranscriptEntry>,
}

#[async_trait]
pub trait CallStore: Send + Sync {
    /// Business answering the dialed number, if any.
    async fn find_business(&self, called_number: &str) -> Result<Option<BusinessProfile>>;

    /// Register the caller number if unseen and create a call record.
    async fn open_call(&self, caller_number: &str) -> Result<CallRecord>;

    async fn append_transcript(&self, call_id: &str, text: &str, is_agent: bool) -> Result<()>;

    /// Record the measured call duration.
    async fn finish_call(&self, call_id: &str, duration: Duration) -> Result<()>;

    async fn get_call(&self, call_id: &str) -> Result<Option<CallRecord>>;
}

/// Render a schedule one day per line:
/// `"<day>: Open from <open> to <close>"` or `"<day>: Closed"`.
pub fn describe_schedule(schedule: &[DaySchedule]) -> String {
    schedule
        .iter()
        .map(|day| {
            if day.is_open {
                format!(
                    "{}: Open from {} to {}",
                    day.day,
                    day.opening_time.as_deref().unwrap_or("N/A"),
                    day.closing_time.as_deref().unwrap_or("N/A")
                )
            } else {
                format!("{}: Closed", day.day)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Base instructions followed by the business details, if a business was found.
pub fn compose_instructions(base: &str, business: Option<&BusinessProfile>) -> String {
    let mut instructions = base.to_string();

    if let Some(business) = business {
        instructions.push_str(&format!("Business name is {}. ", business.name));
        if business.schedule.is_empty() {
            instructions.push_str("Business schedule information is unavailable. ");
        } else {
            instructions.push_str(&format!(
                "Business's schedule is {} ",
                describe_schedule(&business.schedule)
            ));
        }
        instructions.push_str(&format!(
            "Business tele operator instructions are {}. ",
            business.operator_instructions
        ));
    }

    instructions
}

/// Format a duration as `HH:MM:SS`, truncating fractions of a second.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// [`CallStore`] kept in process memory.
pub struct InMemoryCallStore {
    businesses: HashMap<String, BusinessProfile>,
    phone_numbers: RwLock<HashMap<String, u64>>,
    calls: RwLock<HashMap<String, CallRecord>>,
    next_phone_id: AtomicU64,
}

impl InMemoryCallStore {
    pub fn new(businesses: Vec<BusinessProfile>) -> Self {
        Self {
            businesses: businesses
                .into_iter()
                .map(|business| (business.phone_number.clone(), business))
                .collect(),
            phone_numbers: RwLock::new(HashMap::new()),
            calls: RwLock::new(HashMap::new()),
            next_phone_id: AtomicU64::new(1),
        }
    }

    #[cfg(test)]
    pub fn call_count(&self) -> usize {
        self.calls.read().len()
    }
}

#[async_trait]
impl CallStore for InMemoryCallStore {
    async fn find_business(&self, called_number: &str) -> Result<Option<BusinessProfile>> {
        Ok(self.businesses.get(called_number).cloned())
    }

    async fn open_call(&self, caller_number: &str) -> Result<CallRecord> {
        let phone_number_id = *self
            .phone_numbers
            .write()
            .entry(caller_number.to_string())
            .or_insert_with(|| self.next_phone_id.fetch_add(1, Ordering::Relaxed));

        let now = Utc::now();
        let record = CallRecord {
            id: Uuid::new_v4().to_string(),
            caller_number: caller_number.to_string(),
            phone_number_id,
            date: now.format("%Y-%m-%d").to_string(),
            time: now.format("%H:%M:%S").to_string(),
            duration: format_duration(Duration::ZERO),
            transcripts: Vec::new(),
        };

        self.calls.write().insert(record.id.clone(), record.clone());
        info!(call_id = %record.id, caller = %caller_number, "Call record opened");
        Ok(record)
    }

    async fn append_transcript(&self, call_id: &str, text: &str, is_agent: bool) -> Result<()> {
        let mut calls = self.calls.write();
        let call = calls
            .get_mut(call_id)
            .ok_or_else(|| anyhow!("Unknown call '{}'", call_id))?;

        call.transcripts.push(TranscriptEntry {
            text: text.to_string(),
            is_agent,
            at: Utc::now(),
        });
        debug!(call_id, is_agent, "Transcript appended");
        Ok(())
    }

    async fn finish_call(&self, call_id: &str, duration: Duration) -> Result<()> {
        let mut calls = self.calls.write();
        let call = calls
            .get_mut(call_id)
            .ok_or_else(|| anyhow!("Unknown call '{}'", call_id))?;

        call.duration = format_duration(duration);
        info!(call_id, duration = %call.duration, "Call record finished");
        Ok(())
    }

    async fn get_call(&self, call_id: &str) -> Result<Option<CallRecord>> {
        Ok(self.calls.read().get(call_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bakery() -> BusinessProfile {
        BusinessProfile {
            phone_number: "+15550100".to_string(),
            name: "Corner Bakery".to_string(),
            operator_instructions: "Offer the daily special".to_string(),
            schedule: vec![
                DaySchedule {
                    day: "monday".to_string(),
                    is_open: true,
                    opening_time: Some("08:00".to_string()),
                    closing_time: Some("17:00".to_string()),
                },
                DaySchedule {
                    day: "tuesday".to_string(),
                    is_open: true,
                    opening_time: None,
                    closing_time: Some("12:00".to_string()),
                },
                DaySchedule {
                    day: "sunday".to_string(),
                    is_open: false,
                    opening_time: None,
                    closing_time: None,
                },
            ],
        }
    }

    #[test]
    fn test_describe_schedule() {
        assert_eq!(
            describe_schedule(&bakery().schedule),
            "monday: Open from 08:00 to 17:00\ntuesday: Open from N/A to 12:00\nsunday: Closed"
        );
        assert_eq!(describe_schedule(&[]), "");
    }

    #[test]
    fn test_compose_instructions() {
        let base = "You are a receptionist. ";
        assert_eq!(compose_instructions(base, None), base);

        let composed = compose_instructions(base, Some(&bakery()));
        assert!(composed.starts_with(base));
        assert!(composed.contains("Business name is Corner Bakery. "));
        assert!(composed.contains("Business's schedule is monday: Open from 08:00 to 17:00\n"));
        assert!(composed.ends_with("Business tele operator instructions are Offer the daily special. "));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "00:00:00");
        assert_eq!(format_duration(Duration::from_millis(61_900)), "00:01:01");
        assert_eq!(format_duration(Duration::from_secs(3 * 3600 + 5)), "03:00:05");
    }

    #[tokio::test]
    async fn test_call_lifecycle() {
        let store = InMemoryCallStore::new(vec![bakery()]);

        assert_eq!(
            store.find_business("+15550100").await.unwrap().map(|b| b.name),
            Some("Corner Bakery".to_string())
        );
        assert!(store.find_business("+19999999").await.unwrap().is_none());

        let first = store.open_call("+15557777").await.unwrap();
        let second = store.open_call("+15557777").await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(first.phone_number_id, second.phone_number_id);
        assert_eq!(first.duration, "00:00:00");

        store.append_transcript(&first.id, "hello", false).await.unwrap();
        store.append_transcript(&first.id, "hi, how can I help?", true).await.unwrap();
        store.finish_call(&first.id, Duration::from_secs(75)).await.unwrap();

        let record = store.get_call(&first.id).await.unwrap().unwrap();
        assert_eq!(record.transcripts.len(), 2);
        assert!(record.transcripts[1].is_agent);
        assert_eq!(record.duration, "00:01:15");

        assert!(store.append_transcript("missing", "x", true).await.is_err());
        assert_eq!(store.call_count(), 2);
    }
}
