//! Domain event stream
//!
//! Every successful core mutation emits one event after its transaction
//! commits. Audit logging subscribes to this stream instead of wrapping
//! calls.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::warning::Warning;

/// A committed state change
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    CreditReserved {
        limit_id: Uuid,
        amount: i64,
        business_ref: String,
        operator: Uuid,
        used_after: i64,
        available_after: i64,
    },
    CreditReleased {
        limit_id: Uuid,
        amount: i64,
        business_ref: String,
        operator: Uuid,
        used_after: i64,
    },
    CreditFrozen {
        limit_id: Uuid,
        amount: i64,
        business_ref: String,
        operator: Uuid,
        frozen_after: i64,
    },
    CreditUnfrozen {
        limit_id: Uuid,
        amount: i64,
        business_ref: String,
        operator: Uuid,
        frozen_after: i64,
    },
    LimitAdjusted {
        limit_id: Uuid,
        adjust_request_id: Uuid,
        old_total: i64,
        new_total: i64,
        approver: Uuid,
    },
    PledgeInitiated {
        receipt_id: Uuid,
        endorsement_id: Uuid,
        owner_id: Uuid,
        financier_id: Uuid,
        amount: i64,
    },
    PledgeConfirmed {
        receipt_id: Uuid,
        endorsement_id: Uuid,
        pledge_record_id: Uuid,
        financing_record_id: Uuid,
        principal: i64,
        anchor_tx_ref: String,
    },
    PledgeRejected {
        receipt_id: Uuid,
        endorsement_id: Uuid,
        reason: String,
    },
    PledgeCancelled {
        receipt_id: Uuid,
        endorsement_id: Uuid,
    },
    PledgeReleased {
        receipt_id: Uuid,
        endorsement_id: Uuid,
        pledge_record_id: Uuid,
        repay_amount: i64,
        anchor_tx_ref: String,
    },
    WarningRaised {
        warning: Warning,
        raised_at: DateTime<Utc>,
    },
}

/// Broadcast bus for domain events.
///
/// Cheap to clone; emitting with no live subscribers is not an error.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: DomainEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Domain event emitted with no subscribers");
        }
    }
}

/// Drains the event stream into structured audit records.
///
/// Runs until the bus is dropped. Lagged receivers skip to the live edge and
/// log how many events were missed rather than stalling emitters.
pub async fn run_audit_subscriber(mut rx: broadcast::Receiver<DomainEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(payload) => {
                    tracing::info!(target: "audit", %payload, "domain event");
                }
                Err(e) => {
                    tracing::error!(target: "audit", error = %e, ?event, "unserializable event");
                }
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(target: "audit", missed, "audit subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_emitted_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(DomainEvent::PledgeCancelled {
            receipt_id: Uuid::nil(),
            endorsement_id: Uuid::nil(),
        });

        let got = rx.recv().await.unwrap();
        match got {
            DomainEvent::PledgeCancelled { receipt_id, .. } => {
                assert_eq!(receipt_id, Uuid::nil())
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        bus.emit(DomainEvent::CreditReleased {
            limit_id: Uuid::nil(),
            amount: 1,
            business_ref: "ref".to_string(),
            operator: Uuid::nil(),
            used_after: 0,
        });
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let ev = DomainEvent::CreditReserved {
            limit_id: Uuid::nil(),
            amount: 300_000,
            business_ref: "order-1".to_string(),
            operator: Uuid::nil(),
            used_after: 300_000,
            available_after: 700_000,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "credit_reserved");
        assert_eq!(v["available_after"], 700_000);
    }
}
