use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::booking::{Booking, ServiceOffering};
use crate::geo::GeoPoint;
use crate::time_slot::TimeSlot;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Created,
    Authorized,
    Failed,
    Refunded,
}

/// A customer's payment, created before any booking exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub sub_category_id: Uuid,
    pub date: NaiveDate,
    pub time_slot: TimeSlot,
    /// Where the service is wanted. Carried so a retried booking keeps it
    pub location: Option<GeoPoint>,
    pub preferred_technician_id: Option<Uuid>,
    pub amount: i64,
    pub currency: String,
    pub gateway_order_id: Option<String>,
    pub gateway_payment_id: Option<String>,
    pub status: PaymentStatus,
    /// Set once, when the booking paid for by this payment is created
    pub booking_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn new(
        customer_id: Uuid,
        offering: &ServiceOffering,
        date: NaiveDate,
        time_slot: TimeSlot,
        currency: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_id,
            sub_category_id: offering.id,
            date,
            time_slot,
            location: None,
            preferred_technician_id: None,
            amount: offering.price,
            currency: currency.to_string(),
            gateway_order_id: None,
            gateway_payment_id: None,
            status: PaymentStatus::Created,
            booking_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundReason {
    CustomerCancelled,
    AutoCancelled,
    Rejected,
    BookingFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Refund {
    pub id: Uuid,
    pub booking_id: Option<Uuid>,
    pub customer_id: Uuid,
    pub payment_id: Option<Uuid>,
    pub amount: i64,
    pub reason: RefundReason,
    pub status: RefundStatus,
    pub created_at: DateTime<Utc>,
}

impl Refund {
    pub fn for_booking(booking: &Booking, reason: RefundReason, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id: Some(booking.id),
            customer_id: booking.customer_id,
            payment_id: booking.payment_id,
            amount: booking.amount,
            reason,
            status: RefundStatus::Pending,
            created_at: now,
        }
    }

    /// Refund for money taken when no booking could be created for it.
    pub fn for_payment(payment: &Payment, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id: None,
            customer_id: payment.customer_id,
            payment_id: Some(payment.id),
            amount: payment.amount,
            reason: RefundReason::BookingFailed,
            status: RefundStatus::Pending,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminPayout {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub technician_id: Uuid,
    pub amount: i64,
    pub status: PayoutStatus,
    pub created_at: DateTime<Utc>,
}

impl AdminPayout {
    pub fn for_completed(booking: &Booking, technician_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id: booking.id,
            technician_id,
            amount: booking.amount,
            status: PayoutStatus::Pending,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailedStep {
    BookingCreation,
    Dispatch,
    Notification,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailedOperationStatus {
    Pending,
    Retrying,
    Success,
    Failed,
}

/// A verified payment whose downstream step failed. Kept so the money is
/// never silently lost.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedPaymentOperation {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub booking_id: Option<Uuid>,
    pub failed_step: FailedStep,
    pub error: String,
    pub retry_count: i32,
    pub status: FailedOperationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FailedPaymentOperation {
    pub fn new(
        payment_id: Uuid,
        booking_id: Option<Uuid>,
        failed_step: FailedStep,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_id,
            booking_id,
            failed_step,
            error: error.into(),
            retry_count: 0,
            status: FailedOperationStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_success(&mut self, now: DateTime<Utc>) {
        self.status = FailedOperationStatus::Success;
        self.updated_at = now;
    }

    /// Record another failed attempt. Returns true once retries are exhausted.
    pub fn record_failure(&mut self, error: impl Into<String>, max_retries: i32, now: DateTime<Utc>) -> bool {
        self.retry_count += 1;
        self.error = error.into();
        self.updated_at = now;
        self.status = if self.retry_count >= max_retries {
            FailedOperationStatus::Failed
        } else {
            FailedOperationStatus::Pending
        };
        self.status == FailedOperationStatus::Failed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub order_id: String,
    pub amount: i64,
    pub currency: String,
}

/// Fields the gateway hands back to the client after checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAuthorization {
    pub gateway_order_id: String,
    pub gateway_payment_id: String,
    pub signature: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create an order with the provider for the given amount
    async fn create_order(
        &self,
        payment_id: Uuid,
        amount: i64,
        currency: &str,
    ) -> Result<GatewayOrder, Box<dyn std::error::Error + Send + Sync>>;

    /// Check the signature the provider attached to a completed checkout
    fn verify_signature(&self, authorization: &PaymentAuthorization) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_operation_exhausts_retries() {
        let now = Utc::now();
        let mut op = FailedPaymentOperation::new(Uuid::new_v4(), None, FailedStep::BookingCreation, "db down", now);

        assert!(!op.record_failure("still down", 3, now));
        assert_eq!(op.status, FailedOperationStatus::Pending);
        assert!(!op.record_failure("still down", 3, now));
        assert!(op.record_failure("still down", 3, now));
        assert_eq!(op.status, FailedOperationStatus::Failed);
        assert_eq!(op.retry_count, 3);
    }
}
