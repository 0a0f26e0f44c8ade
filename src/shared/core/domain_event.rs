// Domain event envelope.
//
// Purpose
// - Wrap a typed payload with the identity and timing every consumer needs.
//
// Versioning and evolution
// - Prefer additive payload changes. A breaking change bumps `event_version` for that payload.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub trait EventPayload: Serialize + Clone + Send + Sync {
    /// Name of the aggregate kind this payload belongs to, e.g. `wallet`.
    const AGGREGATE_TYPE: &'static str;

    fn event_type(&self) -> &'static str;

    fn event_version(&self) -> i32 {
        1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainEvent<P> {
    pub event_id: Uuid,
    pub aggregate_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub payload: P,
}

impl<P: EventPayload> DomainEvent<P> {
    pub fn new(aggregate_id: Uuid, occurred_at: DateTime<Utc>, payload: P) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            aggregate_id,
            occurred_at,
            payload,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    pub fn aggregate_type(&self) -> &'static str {
        P::AGGREGATE_TYPE
    }
}
