//! Health-data endpoints exposed by the v1 developer API.

use super::ApiError;
use chrono::{Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A readable API resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Profile,
    BodyMeasurement,
    Cycles,
    Recovery,
    Sleep,
    Workouts,
}

impl Resource {
    pub const ALL: [Resource; 6] = [
        Resource::Profile,
        Resource::BodyMeasurement,
        Resource::Cycles,
        Resource::Recovery,
        Resource::Sleep,
        Resource::Workouts,
    ];

    /// Path relative to the API base URL
    pub fn path(&self) -> &'static str {
        match self {
            Resource::Profile => "/user/profile/basic",
            Resource::BodyMeasurement => "/user/measurement/body",
            Resource::Cycles => "/cycle",
            Resource::Recovery => "/recovery",
            Resource::Sleep => "/activity/sleep",
            Resource::Workouts => "/activity/workout",
        }
    }

    /// Collections are paginated and filtered by date range.
    pub fn is_collection(&self) -> bool {
        !matches!(self, Resource::Profile | Resource::BodyMeasurement)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Resource::Profile => "profile",
            Resource::BodyMeasurement => "body",
            Resource::Cycles => "cycles",
            Resource::Recovery => "recovery",
            Resource::Sleep => "sleep",
            Resource::Workouts => "workouts",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Resource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resource::ALL
            .into_iter()
            .find(|r| r.name() == s)
            .ok_or_else(|| {
                let names: Vec<_> = Resource::ALL.iter().map(|r| r.name()).collect();
                format!("unknown resource '{}', expected one of: {}", s, names.join(", "))
            })
    }
}

/// Inclusive range of whole UTC days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// From `days` days ago through today. Fails if the start falls outside the
    /// representable calendar.
    pub fn last_days(days: u32) -> Result<Self, ApiError> {
        let end = Utc::now().date_naive();
        let start = end
            .checked_sub_days(Days::new(u64::from(days)))
            .ok_or(ApiError::InvalidRange(days))?;
        Ok(Self { start, end })
    }

    /// `start`/`end` query parameters covering both days in full.
    pub fn query(&self) -> [(&'static str, String); 2] {
        [
            ("start", format!("{}T00:00:00.000Z", self.start.format("%Y-%m-%d"))),
            ("end", format!("{}T23:59:59.999Z", self.end.format("%Y-%m-%d"))),
        ]
    }
}

/// One page of a collection endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub records: Vec<serde_json::Value>,
    /// Cursor for the following page. `None` on the last page.
    #[serde(default)]
    pub next_token: Option<String>,
}
