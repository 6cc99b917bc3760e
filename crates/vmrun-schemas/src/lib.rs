//! vmrun-schemas
//!
//! Shared data model for instance lifecycle events, derived runs and the
//! hardware-profile catalog. No IO lives here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Provider reference
// ---------------------------------------------------------------------------

/// Cloud-provider specific identity of an instance.
///
/// The reconciliation engine never looks inside this value; it exists so the
/// surrounding system can map an `Instance` back to its provider object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum ProviderRef {
    Aws { instance_id: String, region: String },
    Azure { vm_id: String, resource_group: String },
    Gcp { instance_id: String, zone: String },
}

impl ProviderRef {
    pub fn cloud_type(&self) -> &'static str {
        match self {
            ProviderRef::Aws { .. } => "aws",
            ProviderRef::Azure { .. } => "azure",
            ProviderRef::Gcp { .. } => "gcp",
        }
    }

    /// The provider's own identifier for the instance.
    pub fn provider_instance_id(&self) -> &str {
        match self {
            ProviderRef::Aws { instance_id, .. } => instance_id,
            ProviderRef::Azure { vm_id, .. } => vm_id,
            ProviderRef::Gcp { instance_id, .. } => instance_id,
        }
    }
}

/// A tracked virtual machine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: Uuid,
    /// Opaque key of the owning cloud account. Managed outside this workspace.
    pub account_ref: String,
    pub provider: ProviderRef,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PowerOn,
    PowerOff,
    AttributeChange,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PowerOn => "power_on",
            EventType::PowerOff => "power_off",
            EventType::AttributeChange => "attribute_change",
        }
    }

    pub fn parse(s: &str) -> Result<Self, EventValidationError> {
        match s.trim() {
            "power_on" => Ok(EventType::PowerOn),
            "power_off" => Ok(EventType::PowerOff),
            "attribute_change" => Ok(EventType::AttributeChange),
            other => Err(EventValidationError::UnknownEventType(other.to_string())),
        }
    }

    /// Whether events of this type may carry a hardware profile.
    pub fn carries_profile(&self) -> bool {
        !matches!(self, EventType::PowerOff)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event as submitted by an ingestion source, before it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub instance_id: Uuid,
    pub event_type: EventType,
    pub occurred_at: DateTime<Utc>,
    /// Hardware profile identifier (instance type name) in effect from
    /// `occurred_at` onwards.
    pub profile_id: Option<String>,
    /// Provider-specific payload, stored opaque.
    pub provider_fields: Option<Value>,
}

impl NewEvent {
    pub fn power_on(
        instance_id: Uuid,
        occurred_at: DateTime<Utc>,
        profile_id: impl Into<String>,
    ) -> Self {
        Self {
            instance_id,
            event_type: EventType::PowerOn,
            occurred_at,
            profile_id: Some(profile_id.into()),
            provider_fields: None,
        }
    }

    pub fn power_off(instance_id: Uuid, occurred_at: DateTime<Utc>) -> Self {
        Self {
            instance_id,
            event_type: EventType::PowerOff,
            occurred_at,
            profile_id: None,
            provider_fields: None,
        }
    }

    pub fn attribute_change(
        instance_id: Uuid,
        occurred_at: DateTime<Utc>,
        profile_id: impl Into<String>,
    ) -> Self {
        Self {
            instance_id,
            event_type: EventType::AttributeChange,
            occurred_at,
            profile_id: Some(profile_id.into()),
            provider_fields: None,
        }
    }

    /// Structural checks applied before an event is appended.
    ///
    /// - `power_off` must not carry a profile.
    /// - `attribute_change` must carry a non-empty profile.
    /// - A profile, when present, must not be blank.
    pub fn validate(&self) -> Result<(), EventValidationError> {
        match (&self.event_type, self.profile_id.as_deref()) {
            (EventType::PowerOff, Some(_)) => Err(EventValidationError::UnexpectedProfile),
            (EventType::AttributeChange, None) => Err(EventValidationError::MissingProfile),
            (_, Some(p)) if p.trim().is_empty() => Err(EventValidationError::BlankProfile),
            _ => Ok(()),
        }
    }
}

/// An appended, immutable event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Insertion sequence. Breaks ties between events with equal `occurred_at`.
    pub event_seq: i64,
    pub instance_id: Uuid,
    pub event_type: EventType,
    pub occurred_at: DateTime<Utc>,
    pub profile_id: Option<String>,
    pub provider_fields: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Replay order key: `(occurred_at, event_seq)`.
    pub fn replay_key(&self) -> (DateTime<Utc>, i64) {
        (self.occurred_at, self.event_seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventValidationError {
    UnknownEventType(String),
    UnexpectedProfile,
    MissingProfile,
    BlankProfile,
}

impl fmt::Display for EventValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventValidationError::UnknownEventType(s) => write!(
                f,
                "unknown event type '{s}': expected power_on | power_off | attribute_change"
            ),
            EventValidationError::UnexpectedProfile => {
                write!(f, "power_off events must not carry a hardware profile")
            }
            EventValidationError::MissingProfile => {
                write!(f, "attribute_change events require a hardware profile")
            }
            EventValidationError::BlankProfile => write!(f, "hardware profile must not be blank"),
        }
    }
}

impl std::error::Error for EventValidationError {}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Catalog entry: numeric specs for a hardware profile identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub profile_id: String,
    pub memory_gib: f64,
    pub vcpu: i32,
    /// Provider label (e.g. "aws"); informational only.
    pub provider: Option<String>,
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// A maximal span during which an instance ran with one hardware profile.
///
/// Covers `[start_time, end_time)`. `end_time == None` means the instance is
/// still running as of the latest known event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub instance_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub instance_type: Option<String>,
    pub memory_gib: Option<f64>,
    pub vcpu: Option<i32>,
}

impl Run {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Half-open interval intersection; an open end is treated as +infinity.
    pub fn overlaps(&self, other: &Run) -> bool {
        let self_before_other = matches!(self.end_time, Some(end) if end <= other.start_time);
        let other_before_self = matches!(other.end_time, Some(end) if end <= self.start_time);
        !(self_before_other || other_before_self)
    }

    /// True when the run intersects the window `[start, end)`.
    pub fn intersects(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        let ends_before = matches!(self.end_time, Some(e) if e <= start);
        !ends_before && self.start_time < end
    }
}
