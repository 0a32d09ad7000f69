// Domain records shared by the parser, the reconciliation engine and the read side

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SellMode {
    Online,
    Offline,
}

impl SellMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SellMode::Online => "online",
            SellMode::Offline => "offline",
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, SellMode::Online)
    }
}

impl Default for SellMode {
    fn default() -> Self {
        SellMode::Offline
    }
}

impl fmt::Display for SellMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SellMode {
    type Err = ValidationIssue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(SellMode::Online),
            "offline" => Ok(SellMode::Offline),
            _ => Err(ValidationIssue::InvalidSellMode(value.to_string())),
        }
    }
}

// Records produced by the XML parser. Every value here has already been validated.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvent {
    pub base_event_id: String,
    pub title: String,
    pub organizer_company_id: Option<String>,
    pub plans: Vec<ParsedPlan>,
}

impl ParsedEvent {
    /// True when at least one of the plans in this sighting is sold online.
    pub fn observed_online(&self) -> bool {
        self.plans.iter().any(|plan| plan.sell_mode.is_online())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPlan {
    pub base_plan_id: String,
    pub sell_mode: SellMode,
    pub starts_at: NaiveDateTime,
    pub ends_at: NaiveDateTime,
    pub sell_from: Option<NaiveDateTime>,
    pub sell_to: Option<NaiveDateTime>,
    pub sold_out: bool,
    pub capacity: Option<u32>,
    pub zones: Vec<ParsedZone>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedZone {
    pub base_zone_id: String,
    pub name: String,
    pub capacity: u32,
    pub price: f64,
    pub numbered: bool,
}

// Which level of the Event -> Plan -> Zone hierarchy an item error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Event,
    Plan,
    Zone,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemKind::Event => "event",
            ItemKind::Plan => "plan",
            ItemKind::Zone => "zone",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum ValidationIssue {
    #[error("missing required attribute `{0}`")]
    MissingField(&'static str),

    #[error("attribute `{field}` is not a valid number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("attribute `{field}` must not be negative, got {value}")]
    Negative { field: &'static str, value: String },

    #[error("attribute `{field}` is not a valid date-time: {value:?}")]
    InvalidDateTime { field: &'static str, value: String },

    #[error("unknown sell mode {0:?}")]
    InvalidSellMode(String),

    #[error("plan ends at {ends_at} before it starts at {starts_at}")]
    EndsBeforeStart {
        starts_at: NaiveDateTime,
        ends_at: NaiveDateTime,
    },
}

/// An Event, Plan or Zone that was dropped during parsing, with enough of its
/// ancestry to find it in the source document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemError {
    pub kind: ItemKind,
    pub base_event_id: Option<String>,
    pub base_plan_id: Option<String>,
    pub base_zone_id: Option<String>,
    pub issue: ValidationIssue,
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}", self.kind)?;
        if let Some(id) = &self.base_event_id {
            write!(f, " event={id}")?;
        }
        if let Some(id) = &self.base_plan_id {
            write!(f, " plan={id}")?;
        }
        if let Some(id) = &self.base_zone_id {
            write!(f, " zone={id}")?;
        }
        write!(f, ": {}", self.issue)
    }
}

// Stored records, as returned by the read side
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub id: i64,
    pub provider_name: String,
    pub base_event_id: String,
    pub title: String,
    pub organizer_company_id: Option<String>,
    pub ever_online: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub is_stale: bool,
    pub plans: Vec<PlanRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanRecord {
    pub id: i64,
    pub base_plan_id: String,
    pub sell_mode: SellMode,
    pub starts_at: NaiveDateTime,
    pub ends_at: NaiveDateTime,
    pub sell_from: Option<NaiveDateTime>,
    pub sell_to: Option<NaiveDateTime>,
    pub sold_out: bool,
    pub capacity: Option<u32>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub is_stale: bool,
    pub zones: Vec<ZoneRecord>,
}

impl PlanRecord {
    pub fn start_date(&self) -> NaiveDate {
        self.starts_at.date()
    }

    pub fn start_time(&self) -> NaiveTime {
        self.starts_at.time()
    }

    pub fn end_date(&self) -> NaiveDate {
        self.ends_at.date()
    }

    pub fn end_time(&self) -> NaiveTime {
        self.ends_at.time()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneRecord {
    pub id: i64,
    pub base_zone_id: String,
    pub name: String,
    pub capacity: u32,
    pub price: f64,
    pub numbered: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub is_stale: bool,
}
