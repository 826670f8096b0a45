// Broker event envelope

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What happened to the entity carried in the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// A published event. Immutable once handed to the broker; every subscriber
/// receives its own clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T> {
    pub kind: EventKind,
    pub payload: T,
    pub timestamp: DateTime<Utc>,
}

impl<T> Event<T> {
    pub fn new(kind: EventKind, payload: T) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }
}
