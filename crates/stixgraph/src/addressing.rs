//! Mapping feeds to physical collections.
//!
//! ```text
//!   time_based            feed_1700000000     one collection per insertion
//!   grouped               feed_grouped        one evergreen collection
//!   grouped_by_<n>_days   feed_1699920000     one per n-day bucket
//!   static                feed_static         emptied on every batch
//!
//!   edges                 edge_<collection>
//!   mirror tables         <collection>_<suffix>
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Collection shared by every feed's metadata records.
pub const META_COLLECTION: &str = "meta_history";

pub const EDGE_PREFIX: &str = "edge_";

const SECONDS_PER_DAY: i64 = 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StorageParadigm {
    TimeBased,
    Grouped,
    /// Bucketed by a window of this many days, aligned on the epoch.
    GroupedByDays(u32),
    Static,
}

impl Default for StorageParadigm {
    fn default() -> Self {
        StorageParadigm::TimeBased
    }
}

impl StorageParadigm {
    pub fn grouped_by_month() -> Self {
        StorageParadigm::GroupedByDays(30)
    }

    pub fn grouped_by_week() -> Self {
        StorageParadigm::GroupedByDays(7)
    }

    pub fn grouped_by_day() -> Self {
        StorageParadigm::GroupedByDays(1)
    }

    /// Physical object collection for a feed inserting at `date`.
    pub fn collection_name(&self, feed_name: &str, date: DateTime<Utc>) -> String {
        match self {
            StorageParadigm::TimeBased => format!("{feed_name}_{}", date.timestamp()),
            StorageParadigm::Grouped => format!("{feed_name}_grouped"),
            StorageParadigm::GroupedByDays(days) => {
                let window = i64::from((*days).max(1)) * SECONDS_PER_DAY;
                let ts = date.timestamp();
                format!("{feed_name}_{}", ts - ts.rem_euclid(window))
            }
            StorageParadigm::Static => format!("{feed_name}_static"),
        }
    }

    /// Whether only the newest version of a feed should be read.
    ///
    /// Other paradigms keep one physical collection per feed (or bucket) and
    /// always qualify, whatever the reference date.
    pub fn is_time_based(&self) -> bool {
        matches!(self, StorageParadigm::TimeBased)
    }

    pub fn identifier(&self) -> String {
        match self {
            StorageParadigm::TimeBased => "time_based".to_string(),
            StorageParadigm::Grouped => "grouped".to_string(),
            StorageParadigm::GroupedByDays(days) => format!("grouped_by_{days}_days"),
            StorageParadigm::Static => "static".to_string(),
        }
    }
}

/// Edge collection paired with an object collection.
pub fn edge_collection_name(collection: &str) -> String {
    format!("{EDGE_PREFIX}{collection}")
}

impl fmt::Display for StorageParadigm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier())
    }
}

impl FromStr for StorageParadigm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "time_based" => Ok(StorageParadigm::TimeBased),
            "grouped" => Ok(StorageParadigm::Grouped),
            "static" => Ok(StorageParadigm::Static),
            other => other
                .strip_prefix("grouped_by_")
                .and_then(|rest| rest.strip_suffix("_days"))
                .and_then(|days| days.parse::<u32>().ok())
                .filter(|days| *days > 0)
                .map(StorageParadigm::GroupedByDays)
                .ok_or_else(|| Error::UnknownStorageParadigm(other.to_string())),
        }
    }
}

impl TryFrom<String> for StorageParadigm {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StorageParadigm> for String {
    fn from(paradigm: StorageParadigm) -> Self {
        paradigm.identifier()
    }
}
