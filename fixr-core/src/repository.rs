use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::booking::{Booking, ServiceOffering};
use crate::error::{EngineError, EngineResult};
use crate::ledger::{Acceptance, CoinUsage, Technician};
use crate::otp::{OtpPurpose, OtpRecord};
use crate::payment::{AdminPayout, FailedPaymentOperation, Payment, Refund, RefundReason};

/// How a pending booking is being cancelled.
#[derive(Debug, Clone, Copy)]
pub enum Cancellation {
    ByCustomer { customer_id: Uuid, window: Duration },
    Auto { window: Duration },
}

impl Cancellation {
    /// Apply the transition and build the refund that must be stored with it.
    pub fn apply(&self, booking: &mut Booking, now: DateTime<Utc>) -> EngineResult<Refund> {
        let reason = match *self {
            Cancellation::ByCustomer { customer_id, window } => {
                booking.cancel_by_customer(customer_id, now, window)?;
                RefundReason::CustomerCancelled
            }
            Cancellation::Auto { window } => {
                booking.auto_cancel(now, window)?;
                RefundReason::AutoCancelled
            }
        };
        Ok(Refund::for_booking(booking, reason, now))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectedBy {
    Technician(Uuid),
    Admin,
}

impl RejectedBy {
    /// Apply the rejection. Returns the refund and the technician whose
    /// acceptance debit must be reversed, if any.
    pub fn apply(&self, booking: &mut Booking, now: DateTime<Utc>) -> EngineResult<(Refund, Option<Uuid>)> {
        if let RejectedBy::Technician(id) = *self {
            if booking.technician_id != Some(id) {
                return Err(EngineError::Forbidden("booking is not assigned to this technician".into()));
            }
        }
        let reversed = booking.reject(now)?;
        Ok((Refund::for_booking(booking, RefundReason::Rejected, now), reversed))
    }
}

#[derive(Debug, Clone)]
pub struct Rejection {
    pub booking: Booking,
    pub refund: Refund,
    pub reversal: Option<CoinUsage>,
}

/// Booking state. Every mutating method is one atomic conditional unit of
/// work: it re-reads the row, checks its precondition and commits all of its
/// writes together, or commits nothing.
#[async_trait]
pub trait BookingRepository: Send + Sync {
    async fn get_booking(&self, id: Uuid) -> EngineResult<Option<Booking>>;

    /// Pending bookings created at or before `created_before`, oldest first.
    async fn list_stale_pending(&self, created_before: DateTime<Utc>, limit: i64) -> EngineResult<Vec<Booking>>;

    async fn record_candidates(&self, booking_id: Uuid, technician_ids: &[Uuid]) -> EngineResult<()>;

    async fn candidates(&self, booking_id: Uuid) -> EngineResult<Vec<Uuid>>;

    /// Pending → Confirmed plus the technician's coin debit and its audit row.
    async fn accept_booking(&self, booking_id: Uuid, technician_id: Uuid, now: DateTime<Utc>) -> EngineResult<Acceptance>;

    /// Cancelled/AutoCancelled transition plus its refund.
    async fn cancel_booking(
        &self,
        booking_id: Uuid,
        cancellation: Cancellation,
        now: DateTime<Utc>,
    ) -> EngineResult<(Booking, Refund)>;

    /// Rejected transition plus refund and, for confirmed bookings, the coin reversal.
    async fn reject_booking(&self, booking_id: Uuid, by: RejectedBy, now: DateTime<Utc>) -> EngineResult<Rejection>;
}

#[async_trait]
pub trait OtpRepository: Send + Sync {
    /// Store a new code, marking every earlier unused code for the same
    /// booking and purpose as used.
    async fn issue_otp(&self, record: &OtpRecord) -> EngineResult<()>;

    /// Check the code against the newest unused record, consume it and apply
    /// the booking transition it gates. Completion writes the technician's
    /// payout in the same unit. A wrong code is still persisted as a miss.
    async fn verify_otp(
        &self,
        booking_id: Uuid,
        purpose: OtpPurpose,
        code: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Booking>;
}

#[async_trait]
pub trait TechnicianRepository: Send + Sync {
    /// Create or update a technician's profile. The coin balance of an
    /// existing technician is left alone; only ledger operations move it.
    async fn upsert_technician(&self, technician: &Technician) -> EngineResult<()>;

    async fn get_technician(&self, id: Uuid) -> EngineResult<Option<Technician>>;

    /// Active, approved technicians serving the sub-category.
    async fn technicians_for(&self, sub_category_id: Uuid) -> EngineResult<Vec<Technician>>;

    async fn top_up_coins(&self, technician_id: Uuid, amount: i64, now: DateTime<Utc>) -> EngineResult<(i64, CoinUsage)>;

    async fn coin_usages(&self, technician_id: Uuid) -> EngineResult<Vec<CoinUsage>>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn insert_payment(&self, payment: &Payment) -> EngineResult<()>;

    async fn get_payment(&self, id: Uuid) -> EngineResult<Option<Payment>>;

    /// Created → Authorized, taking the gateway payment id, location and
    /// preferred technician from `payment`. An already authorized payment is
    /// returned as stored. Never touches the booking binding.
    async fn authorize_payment(&self, payment: &Payment) -> EngineResult<Payment>;

    /// Created → Failed. A payment that has moved on is left alone.
    async fn fail_payment(&self, payment_id: Uuid, now: DateTime<Utc>) -> EngineResult<()>;

    /// Authorized and unbound → Refunded, together with its refund. Returns
    /// `None` when the payment is bound, refunded or was never authorized.
    async fn refund_unbound_payment(&self, payment_id: Uuid, now: DateTime<Utc>) -> EngineResult<Option<Refund>>;

    /// Insert the booking and bind it to its authorized, still unbound payment.
    async fn create_booking_for_payment(&self, booking: &Booking) -> EngineResult<()>;

    async fn refunds_for_booking(&self, booking_id: Uuid) -> EngineResult<Vec<Refund>>;

    async fn payouts_for_booking(&self, booking_id: Uuid) -> EngineResult<Vec<AdminPayout>>;

    async fn insert_failed_operation(&self, op: &FailedPaymentOperation) -> EngineResult<()>;

    /// Move up to `limit` pending operations to Retrying and return them.
    async fn claim_failed_operations(&self, limit: i64, now: DateTime<Utc>) -> EngineResult<Vec<FailedPaymentOperation>>;

    async fn update_failed_operation(&self, op: &FailedPaymentOperation) -> EngineResult<()>;

    async fn failed_operations_for_payment(&self, payment_id: Uuid) -> EngineResult<Vec<FailedPaymentOperation>>;
}

#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn upsert_offering(&self, offering: &ServiceOffering) -> EngineResult<()>;

    async fn get_offering(&self, id: Uuid) -> EngineResult<Option<ServiceOffering>>;
}

/// Everything the engine persists.
pub trait Store:
    BookingRepository + OtpRepository + TechnicianRepository + PaymentRepository + CatalogRepository
{
}

impl<T> Store for T where
    T: BookingRepository + OtpRepository + TechnicianRepository + PaymentRepository + CatalogRepository
{
}
