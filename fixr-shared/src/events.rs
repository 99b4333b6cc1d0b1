use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who a push event is addressed to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Recipient {
    Customer(Uuid),
    Technician(Uuid),
}

impl Recipient {
    pub fn id(&self) -> Uuid {
        match self {
            Recipient::Customer(id) | Recipient::Technician(id) => *id,
        }
    }
}

/// Real-time booking events pushed to customers and technicians.
///
/// Events are hints: every payload carries the booking id so a client can
/// re-fetch the authoritative record, and receiving the same event twice must
/// leave client state unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum BookingEvent {
    NewBookingRequest {
        booking_id: Uuid,
        sub_category_id: Uuid,
        date: NaiveDate,
        time_slot: String,
        amount: i64,
        coin_cost: i64,
        respond_before: DateTime<Utc>,
    },
    BookingRequestClosed {
        booking_id: Uuid,
        status: String,
    },
    BookingAccepted {
        booking_id: Uuid,
        technician_id: Uuid,
        technician_name: String,
    },
    BookingAutoCancelled {
        booking_id: Uuid,
        refund_id: Uuid,
    },
    BookingCancelled {
        booking_id: Uuid,
        refund_id: Uuid,
    },
    BookingRejected {
        booking_id: Uuid,
        refund_id: Uuid,
    },
    ServiceStarted {
        booking_id: Uuid,
    },
    ServiceCompleted {
        booking_id: Uuid,
        completed_at: DateTime<Utc>,
    },
}

impl BookingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BookingEvent::NewBookingRequest { .. } => "new-booking-request",
            BookingEvent::BookingRequestClosed { .. } => "booking-request-closed",
            BookingEvent::BookingAccepted { .. } => "booking-accepted",
            BookingEvent::BookingAutoCancelled { .. } => "booking-auto-cancelled",
            BookingEvent::BookingCancelled { .. } => "booking-cancelled",
            BookingEvent::BookingRejected { .. } => "booking-rejected",
            BookingEvent::ServiceStarted { .. } => "service-started",
            BookingEvent::ServiceCompleted { .. } => "service-completed",
        }
    }

    pub fn booking_id(&self) -> Uuid {
        match self {
            BookingEvent::NewBookingRequest { booking_id, .. }
            | BookingEvent::BookingRequestClosed { booking_id, .. }
            | BookingEvent::BookingAccepted { booking_id, .. }
            | BookingEvent::BookingAutoCancelled { booking_id, .. }
            | BookingEvent::BookingCancelled { booking_id, .. }
            | BookingEvent::BookingRejected { booking_id, .. }
            | BookingEvent::ServiceStarted { booking_id }
            | BookingEvent::ServiceCompleted { booking_id, .. } => *booking_id,
        }
    }
}

/// An event as delivered on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: Uuid,
    pub recipient: Recipient,
    #[serde(flatten)]
    pub event: BookingEvent,
    pub emitted_at: i64,
}

impl Envelope {
    pub fn new(recipient: Recipient, event: BookingEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient,
            event,
            emitted_at: Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_name_matches_tag() {
        let event = BookingEvent::ServiceStarted { booking_id: Uuid::new_v4() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.name());
    }

    #[test]
    fn test_envelope_flattens_event() {
        let booking_id = Uuid::new_v4();
        let customer = Uuid::new_v4();
        let envelope = Envelope::new(
            Recipient::Customer(customer),
            BookingEvent::BookingAutoCancelled { booking_id, refund_id: Uuid::new_v4() },
        );

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["event"], "booking-auto-cancelled");
        assert_eq!(json["booking_id"], booking_id.to_string());
        assert_eq!(json["recipient"]["kind"], "customer");

        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back.event.booking_id(), booking_id);
    }
}
