use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::geo::GeoPoint;
use crate::time_slot::TimeSlot;

/// Booking status in the lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    AutoCancelled,
    Rejected,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::InProgress => "IN_PROGRESS",
            BookingStatus::Completed => "COMPLETED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::AutoCancelled => "AUTO_CANCELLED",
            BookingStatus::Rejected => "REJECTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Completed
                | BookingStatus::Cancelled
                | BookingStatus::AutoCancelled
                | BookingStatus::Rejected
        )
    }

    /// The transition table. Terminal states accept nothing.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;

        match self {
            Pending => matches!(next, Confirmed | Cancelled | AutoCancelled | Rejected),
            Confirmed => matches!(next, InProgress | Rejected),
            InProgress => matches!(next, Completed),
            Completed | Cancelled | AutoCancelled | Rejected => false,
        }
    }

    pub fn transition(&self, next: BookingStatus) -> EngineResult<BookingStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(EngineError::InvalidTransition { from: *self, to: next })
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(BookingStatus::Pending),
            "CONFIRMED" => Ok(BookingStatus::Confirmed),
            "IN_PROGRESS" => Ok(BookingStatus::InProgress),
            "COMPLETED" => Ok(BookingStatus::Completed),
            "CANCELLED" => Ok(BookingStatus::Cancelled),
            "AUTO_CANCELLED" => Ok(BookingStatus::AutoCancelled),
            "REJECTED" => Ok(BookingStatus::Rejected),
            other => Err(EngineError::Storage(format!("unknown booking status '{}'", other))),
        }
    }
}

/// What the engine needs to know about a bookable sub-category.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceOffering {
    pub id: Uuid,
    pub name: String,
    /// Price charged to the customer, in minor currency units
    pub price: i64,
    /// Coins debited from the technician who accepts
    pub coin_cost: i64,
}

/// Input for creating a booking once payment has been authorized.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub customer_id: Uuid,
    pub sub_category_id: Uuid,
    pub payment_id: Option<Uuid>,
    pub preferred_technician_id: Option<Uuid>,
    pub date: NaiveDate,
    pub time_slot: TimeSlot,
    pub location: Option<GeoPoint>,
    pub amount: i64,
    pub coin_cost: i64,
}

/// One customer's request for one service at one time slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Booking {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub technician_id: Option<Uuid>,
    pub preferred_technician_id: Option<Uuid>,
    pub sub_category_id: Uuid,
    pub payment_id: Option<Uuid>,
    pub date: NaiveDate,
    pub time_slot: TimeSlot,
    pub location: Option<GeoPoint>,
    pub amount: i64,
    pub coin_cost: i64,
    pub status: BookingStatus,
    pub arrival_verified: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn new(req: NewBooking, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_id: req.customer_id,
            technician_id: None,
            preferred_technician_id: req.preferred_technician_id,
            sub_category_id: req.sub_category_id,
            payment_id: req.payment_id,
            date: req.date,
            time_slot: req.time_slot,
            location: req.location,
            amount: req.amount,
            coin_cost: req.coin_cost,
            status: BookingStatus::Pending,
            arrival_verified: false,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_party(&self, user_id: Uuid) -> bool {
        self.customer_id == user_id || self.technician_id == Some(user_id)
    }

    fn move_to(&mut self, next: BookingStatus, now: DateTime<Utc>) -> EngineResult<()> {
        self.status = self.status.transition(next)?;
        self.updated_at = now;
        Ok(())
    }

    /// Transition: Pending → Confirmed, claiming the booking for `technician_id`.
    pub fn confirm(&mut self, technician_id: Uuid, now: DateTime<Utc>) -> EngineResult<()> {
        if self.technician_id.is_some() {
            return Err(EngineError::BookingAlreadyAssigned(self.id));
        }
        if self.status != BookingStatus::Pending {
            return Err(EngineError::BookingNotPending {
                booking_id: self.id,
                status: self.status,
            });
        }

        self.move_to(BookingStatus::Confirmed, now)?;
        self.technician_id = Some(technician_id);
        Ok(())
    }

    /// Transition: Confirmed → InProgress (arrival verified)
    pub fn start_service(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        self.move_to(BookingStatus::InProgress, now)?;
        self.arrival_verified = true;
        Ok(())
    }

    /// Transition: InProgress → Completed (completion verified)
    pub fn complete_service(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        self.move_to(BookingStatus::Completed, now)?;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn cancellation_deadline(&self, window: Duration) -> DateTime<Utc> {
        self.created_at + window
    }

    /// Transition: Pending → Cancelled, only for the owning customer and only
    /// inside the cancellation window.
    pub fn cancel_by_customer(
        &mut self,
        customer_id: Uuid,
        now: DateTime<Utc>,
        window: Duration,
    ) -> EngineResult<()> {
        if self.customer_id != customer_id {
            return Err(EngineError::Forbidden("booking belongs to another customer".into()));
        }

        self.status.transition(BookingStatus::Cancelled)?;

        let deadline = self.cancellation_deadline(window);
        if now > deadline {
            return Err(EngineError::CancellationWindowExpired { deadline });
        }

        self.move_to(BookingStatus::Cancelled, now)
    }

    /// Transition: Pending → AutoCancelled once the window has fully elapsed.
    pub fn auto_cancel(&mut self, now: DateTime<Utc>, window: Duration) -> EngineResult<()> {
        if self.status != BookingStatus::Pending || self.technician_id.is_some() {
            return Err(EngineError::BookingNotPending {
                booking_id: self.id,
                status: self.status,
            });
        }

        let deadline = self.cancellation_deadline(window);
        if now < deadline {
            return Err(EngineError::CancellationWindowNotElapsed {
                remaining_seconds: (deadline - now).num_seconds().max(1),
            });
        }

        self.move_to(BookingStatus::AutoCancelled, now)
    }

    /// Transition: Pending/Confirmed → Rejected. Returns the technician whose
    /// claim is being undone, if any.
    pub fn reject(&mut self, now: DateTime<Utc>) -> EngineResult<Option<Uuid>> {
        let previous = self.status;
        self.move_to(BookingStatus::Rejected, now)?;
        Ok(match previous {
            BookingStatus::Confirmed => self.technician_id,
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(now: DateTime<Utc>) -> Booking {
        Booking::new(
            NewBooking {
                customer_id: Uuid::new_v4(),
                sub_category_id: Uuid::new_v4(),
                payment_id: Some(Uuid::new_v4()),
                preferred_technician_id: None,
                date: NaiveDate::from_ymd_opt(2030, 5, 1).unwrap(),
                time_slot: "10:00-12:00".parse().unwrap(),
                location: None,
                amount: 49_900,
                coin_cost: 20,
            },
            now,
        )
    }

    #[test]
    fn test_booking_lifecycle() {
        let now = Utc::now();
        let mut b = booking(now);
        let tech = Uuid::new_v4();

        // Pending → Confirmed
        b.confirm(tech, now).unwrap();
        assert_eq!(b.status, BookingStatus::Confirmed);
        assert_eq!(b.technician_id, Some(tech));

        // Confirmed → InProgress
        b.start_service(now).unwrap();
        assert!(b.arrival_verified);

        // InProgress → Completed
        b.complete_service(now).unwrap();
        assert_eq!(b.status, BookingStatus::Completed);
        assert_eq!(b.completed_at, Some(now));

        // Terminal
        assert!(b.complete_service(now).is_err());
        assert!(b.reject(now).is_err());
    }

    #[test]
    fn test_transition_table_is_closed() {
        use BookingStatus::*;
        let all = [Pending, Confirmed, InProgress, Completed, Cancelled, AutoCancelled, Rejected];
        let legal = [
            (Pending, Confirmed),
            (Pending, Cancelled),
            (Pending, AutoCancelled),
            (Pending, Rejected),
            (Confirmed, InProgress),
            (Confirmed, Rejected),
            (InProgress, Completed),
        ];

        for from in all {
            for to in all {
                assert_eq!(from.can_transition_to(to), legal.contains(&(from, to)), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_invalid_transition_names_both_states() {
        let now = Utc::now();
        let mut b = booking(now);
        match b.complete_service(now) {
            Err(EngineError::InvalidTransition { from, to }) => {
                assert_eq!(from, BookingStatus::Pending);
                assert_eq!(to, BookingStatus::Completed);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_second_confirm_is_already_assigned() {
        let now = Utc::now();
        let mut b = booking(now);
        b.confirm(Uuid::new_v4(), now).unwrap();
        assert!(matches!(
            b.confirm(Uuid::new_v4(), now),
            Err(EngineError::BookingAlreadyAssigned(_))
        ));
    }

    #[test]
    fn test_customer_cancellation_window() {
        let now = Utc::now();
        let window = Duration::minutes(10);

        let mut inside = booking(now);
        let customer = inside.customer_id;
        inside.cancel_by_customer(customer, now + Duration::minutes(10), window).unwrap();
        assert_eq!(inside.status, BookingStatus::Cancelled);

        let mut outside = booking(now);
        let customer = outside.customer_id;
        assert!(matches!(
            outside.cancel_by_customer(customer, now + Duration::seconds(601), window),
            Err(EngineError::CancellationWindowExpired { .. })
        ));
        assert_eq!(outside.status, BookingStatus::Pending);
    }

    #[test]
    fn test_cancel_after_confirm_is_invalid_transition() {
        let now = Utc::now();
        let mut b = booking(now);
        let customer = b.customer_id;
        b.confirm(Uuid::new_v4(), now).unwrap();
        assert!(matches!(
            b.cancel_by_customer(customer, now, Duration::minutes(10)),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_auto_cancel_waits_for_window() {
        let now = Utc::now();
        let window = Duration::minutes(10);
        let mut b = booking(now);

        assert!(matches!(
            b.auto_cancel(now + Duration::seconds(599), window),
            Err(EngineError::CancellationWindowNotElapsed { .. })
        ));

        b.auto_cancel(now + Duration::seconds(601), window).unwrap();
        assert_eq!(b.status, BookingStatus::AutoCancelled);

        assert!(matches!(
            b.auto_cancel(now + Duration::seconds(700), window),
            Err(EngineError::BookingNotPending { .. })
        ));
    }

    #[test]
    fn test_reject_confirmed_returns_technician() {
        let now = Utc::now();
        let mut b = booking(now);
        let tech = Uuid::new_v4();
        b.confirm(tech, now).unwrap();
        assert_eq!(b.reject(now).unwrap(), Some(tech));

        let mut pending = booking(now);
        assert_eq!(pending.reject(now).unwrap(), None);
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [BookingStatus::InProgress, BookingStatus::AutoCancelled] {
            assert_eq!(status.as_str().parse::<BookingStatus>().unwrap(), status);
        }
    }
}
