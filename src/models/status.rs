use std::{
    fmt::{Display, Formatter, Result},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Queued,
    Delivered,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Queued => "queued",
            EventStatus::Delivered => "delivered",
        }
    }
}

impl Display for EventStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(EventStatus::Queued),
            "delivered" => Ok(EventStatus::Delivered),
            other => Err(anyhow::anyhow!("Unknown event status '{}'", other)),
        }
    }
}
