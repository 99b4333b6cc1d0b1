use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use fixr_core::booking::{Booking, BookingStatus, ServiceOffering};
use fixr_core::ledger::{Acceptance, CoinUsage, Technician};
use fixr_core::otp::{self, OtpPurpose, OtpRecord};
use fixr_core::payment::{
    AdminPayout, FailedOperationStatus, FailedPaymentOperation, Payment, PaymentStatus, Refund,
};
use fixr_core::repository::{
    BookingRepository, CatalogRepository, Cancellation, OtpRepository, PaymentRepository,
    RejectedBy, Rejection, TechnicianRepository,
};
use fixr_core::{EngineError, EngineResult};

#[derive(Default)]
struct Tables {
    bookings: HashMap<Uuid, Booking>,
    candidates: HashMap<Uuid, Vec<Uuid>>,
    technicians: HashMap<Uuid, Technician>,
    coin_usages: Vec<CoinUsage>,
    otps: Vec<OtpRecord>,
    payments: HashMap<Uuid, Payment>,
    refunds: Vec<Refund>,
    payouts: Vec<AdminPayout>,
    failed_ops: Vec<FailedPaymentOperation>,
    offerings: HashMap<Uuid, ServiceOffering>,
}

/// A thread-safe in-memory store.
///
/// Every table sits behind one `tokio::sync::Mutex`, so each repository call
/// is a single atomic unit of work. Mutations are staged on clones and only
/// written back once every precondition has passed.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a booking directly, bypassing payment binding. Used to seed
    /// fixtures.
    pub async fn insert_booking(&self, booking: &Booking) {
        let mut tables = self.tables.lock().await;
        tables.bookings.insert(booking.id, booking.clone());
    }
}

#[async_trait]
impl BookingRepository for InMemoryStore {
    async fn get_booking(&self, id: Uuid) -> EngineResult<Option<Booking>> {
        let tables = self.tables.lock().await;
        Ok(tables.bookings.get(&id).cloned())
    }

    async fn list_stale_pending(&self, created_before: DateTime<Utc>, limit: i64) -> EngineResult<Vec<Booking>> {
        let tables = self.tables.lock().await;
        let mut stale: Vec<Booking> = tables
            .bookings
            .values()
            .filter(|b| b.status == BookingStatus::Pending && b.created_at <= created_before)
            .cloned()
            .collect();
        stale.sort_by_key(|b| b.created_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn record_candidates(&self, booking_id: Uuid, technician_ids: &[Uuid]) -> EngineResult<()> {
        let mut tables = self.tables.lock().await;
        let entry = tables.candidates.entry(booking_id).or_default();
        for id in technician_ids {
            if !entry.contains(id) {
                entry.push(*id);
            }
        }
        Ok(())
    }

    async fn candidates(&self, booking_id: Uuid) -> EngineResult<Vec<Uuid>> {
        let tables = self.tables.lock().await;
        Ok(tables.candidates.get(&booking_id).cloned().unwrap_or_default())
    }

    async fn accept_booking(&self, booking_id: Uuid, technician_id: Uuid, now: DateTime<Utc>) -> EngineResult<Acceptance> {
        let mut tables = self.tables.lock().await;
        let Tables { bookings, technicians, coin_usages, .. } = &mut *tables;

        let mut booking = bookings
            .get(&booking_id)
            .cloned()
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let mut technician = technicians
            .get(&technician_id)
            .cloned()
            .ok_or(EngineError::TechnicianNotFound(technician_id))?;

        booking.confirm(technician_id, now)?;
        let balance = technician.debit(booking.coin_cost)?;
        let usage = CoinUsage::acceptance(&booking, technician_id, now);

        bookings.insert(booking.id, booking.clone());
        let technician_name = technician.name.clone();
        technicians.insert(technician.id, technician);
        coin_usages.push(usage.clone());

        Ok(Acceptance { booking, balance, usage, technician_name })
    }

    async fn cancel_booking(
        &self,
        booking_id: Uuid,
        cancellation: Cancellation,
        now: DateTime<Utc>,
    ) -> EngineResult<(Booking, Refund)> {
        let mut tables = self.tables.lock().await;
        let Tables { bookings, refunds, .. } = &mut *tables;

        let mut booking = bookings
            .get(&booking_id)
            .cloned()
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let refund = cancellation.apply(&mut booking, now)?;

        bookings.insert(booking.id, booking.clone());
        refunds.push(refund.clone());
        Ok((booking, refund))
    }

    async fn reject_booking(&self, booking_id: Uuid, by: RejectedBy, now: DateTime<Utc>) -> EngineResult<Rejection> {
        let mut tables = self.tables.lock().await;
        let Tables { bookings, technicians, coin_usages, refunds, .. } = &mut *tables;

        let mut booking = bookings
            .get(&booking_id)
            .cloned()
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let (refund, reversed) = by.apply(&mut booking, now)?;

        let reversal = match reversed {
            Some(technician_id) if booking.coin_cost > 0 => {
                let mut technician = technicians
                    .get(&technician_id)
                    .cloned()
                    .ok_or(EngineError::TechnicianNotFound(technician_id))?;
                let usage = CoinUsage::reversal(&booking, technician_id, now);
                technician.credit(usage.amount)?;
                technicians.insert(technician.id, technician);
                Some(usage)
            }
            _ => None,
        };

        bookings.insert(booking.id, booking.clone());
        refunds.push(refund.clone());
        if let Some(usage) = &reversal {
            coin_usages.push(usage.clone());
        }
        Ok(Rejection { booking, refund, reversal })
    }
}

#[async_trait]
impl OtpRepository for InMemoryStore {
    async fn issue_otp(&self, record: &OtpRecord) -> EngineResult<()> {
        let mut tables = self.tables.lock().await;
        for existing in tables
            .otps
            .iter_mut()
            .filter(|r| r.booking_id == record.booking_id && r.purpose == record.purpose && !r.is_used)
        {
            existing.consume();
        }
        tables.otps.push(record.clone());
        Ok(())
    }

    async fn verify_otp(
        &self,
        booking_id: Uuid,
        purpose: OtpPurpose,
        code: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Booking> {
        let mut tables = self.tables.lock().await;
        let Tables { bookings, otps, payouts, .. } = &mut *tables;

        let mut booking = bookings
            .get(&booking_id)
            .cloned()
            .ok_or(EngineError::BookingNotFound(booking_id))?;

        let latest = otps
            .iter()
            .enumerate()
            .filter(|(_, r)| r.booking_id == booking_id && r.purpose == purpose && !r.is_used)
            .max_by_key(|(_, r)| r.created_at)
            .map(|(i, _)| i);
        let mut record = latest.map(|i| otps[i].clone());

        let outcome = otp::verify_and_apply(record.as_mut(), &mut booking, code, now);

        // Misses are kept even when the check fails
        if let (Some(i), Some(record)) = (latest, record) {
            otps[i] = record;
        }
        let payout = outcome?;

        bookings.insert(booking.id, booking.clone());
        if let Some(payout) = payout {
            payouts.push(payout);
        }
        Ok(booking)
    }
}

#[async_trait]
impl TechnicianRepository for InMemoryStore {
    async fn upsert_technician(&self, technician: &Technician) -> EngineResult<()> {
        let mut tables = self.tables.lock().await;
        let mut technician = technician.clone();
        if let Some(existing) = tables.technicians.get(&technician.id) {
            technician.coins = existing.coins;
            technician.created_at = existing.created_at;
        }
        tables.technicians.insert(technician.id, technician);
        Ok(())
    }

    async fn get_technician(&self, id: Uuid) -> EngineResult<Option<Technician>> {
        let tables = self.tables.lock().await;
        Ok(tables.technicians.get(&id).cloned())
    }

    async fn technicians_for(&self, sub_category_id: Uuid) -> EngineResult<Vec<Technician>> {
        let tables = self.tables.lock().await;
        let mut found: Vec<Technician> = tables
            .technicians
            .values()
            .filter(|t| t.serves(sub_category_id))
            .cloned()
            .collect();
        found.sort_by_key(|t| t.created_at);
        Ok(found)
    }

    async fn top_up_coins(&self, technician_id: Uuid, amount: i64, now: DateTime<Utc>) -> EngineResult<(i64, CoinUsage)> {
        let mut tables = self.tables.lock().await;
        let Tables { technicians, coin_usages, .. } = &mut *tables;

        let mut technician = technicians
            .get(&technician_id)
            .cloned()
            .ok_or(EngineError::TechnicianNotFound(technician_id))?;
        let balance = technician.credit(amount)?;
        let usage = CoinUsage::top_up(technician_id, amount, now);

        technicians.insert(technician.id, technician);
        coin_usages.push(usage.clone());
        Ok((balance, usage))
    }

    async fn coin_usages(&self, technician_id: Uuid) -> EngineResult<Vec<CoinUsage>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .coin_usages
            .iter()
            .filter(|u| u.technician_id == technician_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PaymentRepository for InMemoryStore {
    async fn insert_payment(&self, payment: &Payment) -> EngineResult<()> {
        let mut tables = self.tables.lock().await;
        tables.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn get_payment(&self, id: Uuid) -> EngineResult<Option<Payment>> {
        let tables = self.tables.lock().await;
        Ok(tables.payments.get(&id).cloned())
    }

    async fn authorize_payment(&self, payment: &Payment) -> EngineResult<Payment> {
        let mut tables = self.tables.lock().await;
        let stored = tables
            .payments
            .get_mut(&payment.id)
            .ok_or(EngineError::PaymentNotFound(payment.id))?;

        match stored.status {
            PaymentStatus::Created => {
                stored.status = PaymentStatus::Authorized;
                stored.gateway_payment_id = payment.gateway_payment_id.clone();
                stored.location = payment.location;
                stored.preferred_technician_id = payment.preferred_technician_id;
                stored.updated_at = payment.updated_at;
            }
            PaymentStatus::Authorized => {}
            other => {
                return Err(EngineError::ValidationError(format!("payment is {:?}", other)));
            }
        }
        Ok(stored.clone())
    }

    async fn fail_payment(&self, payment_id: Uuid, now: DateTime<Utc>) -> EngineResult<()> {
        let mut tables = self.tables.lock().await;
        let stored = tables
            .payments
            .get_mut(&payment_id)
            .ok_or(EngineError::PaymentNotFound(payment_id))?;
        if stored.status == PaymentStatus::Created {
            stored.status = PaymentStatus::Failed;
            stored.updated_at = now;
        }
        Ok(())
    }

    async fn refund_unbound_payment(&self, payment_id: Uuid, now: DateTime<Utc>) -> EngineResult<Option<Refund>> {
        let mut tables = self.tables.lock().await;
        let Tables { payments, refunds, .. } = &mut *tables;

        let payment = payments
            .get_mut(&payment_id)
            .ok_or(EngineError::PaymentNotFound(payment_id))?;
        if payment.status != PaymentStatus::Authorized || payment.booking_id.is_some() {
            return Ok(None);
        }

        let refund = Refund::for_payment(payment, now);
        payment.status = PaymentStatus::Refunded;
        payment.updated_at = now;
        refunds.push(refund.clone());
        Ok(Some(refund))
    }

    async fn create_booking_for_payment(&self, booking: &Booking) -> EngineResult<()> {
        let payment_id = booking
            .payment_id
            .ok_or_else(|| EngineError::ValidationError("booking has no payment".into()))?;

        let mut tables = self.tables.lock().await;
        let Tables { bookings, payments, .. } = &mut *tables;

        let payment = payments
            .get_mut(&payment_id)
            .ok_or(EngineError::PaymentNotFound(payment_id))?;
        if payment.status != PaymentStatus::Authorized {
            return Err(EngineError::ValidationError("payment is not authorized".into()));
        }
        if let Some(existing) = payment.booking_id {
            return Err(EngineError::ValidationError(format!(
                "payment already used for booking {}",
                existing
            )));
        }

        payment.booking_id = Some(booking.id);
        payment.updated_at = booking.created_at;
        bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn refunds_for_booking(&self, booking_id: Uuid) -> EngineResult<Vec<Refund>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .refunds
            .iter()
            .filter(|r| r.booking_id == Some(booking_id))
            .cloned()
            .collect())
    }

    async fn payouts_for_booking(&self, booking_id: Uuid) -> EngineResult<Vec<AdminPayout>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .payouts
            .iter()
            .filter(|p| p.booking_id == booking_id)
            .cloned()
            .collect())
    }

    async fn insert_failed_operation(&self, op: &FailedPaymentOperation) -> EngineResult<()> {
        let mut tables = self.tables.lock().await;
        tables.failed_ops.push(op.clone());
        Ok(())
    }

    async fn claim_failed_operations(&self, limit: i64, now: DateTime<Utc>) -> EngineResult<Vec<FailedPaymentOperation>> {
        let mut tables = self.tables.lock().await;
        let mut pending: Vec<&mut FailedPaymentOperation> = tables
            .failed_ops
            .iter_mut()
            .filter(|op| op.status == FailedOperationStatus::Pending)
            .collect();
        pending.sort_by_key(|op| op.created_at);

        Ok(pending
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|op| {
                op.status = FailedOperationStatus::Retrying;
                op.updated_at = now;
                op.clone()
            })
            .collect())
    }

    async fn update_failed_operation(&self, op: &FailedPaymentOperation) -> EngineResult<()> {
        let mut tables = self.tables.lock().await;
        match tables.failed_ops.iter_mut().find(|existing| existing.id == op.id) {
            Some(existing) => {
                *existing = op.clone();
                Ok(())
            }
            None => Err(EngineError::Storage(format!("failed operation {} not found", op.id))),
        }
    }

    async fn failed_operations_for_payment(&self, payment_id: Uuid) -> EngineResult<Vec<FailedPaymentOperation>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .failed_ops
            .iter()
            .filter(|op| op.payment_id == payment_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CatalogRepository for InMemoryStore {
    async fn upsert_offering(&self, offering: &ServiceOffering) -> EngineResult<()> {
        let mut tables = self.tables.lock().await;
        tables.offerings.insert(offering.id, offering.clone());
        Ok(())
    }

    async fn get_offering(&self, id: Uuid) -> EngineResult<Option<ServiceOffering>> {
        let tables = self.tables.lock().await;
        Ok(tables.offerings.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use fixr_core::booking::NewBooking;
    use fixr_core::payment::RefundReason;

    fn pending_booking(coin_cost: i64, now: DateTime<Utc>) -> Booking {
        Booking::new(
            NewBooking {
                customer_id: Uuid::new_v4(),
                sub_category_id: Uuid::new_v4(),
                payment_id: Some(Uuid::new_v4()),
                preferred_technician_id: None,
                date: NaiveDate::from_ymd_opt(2030, 3, 14).unwrap(),
                time_slot: "12:00-14:00".parse().unwrap(),
                location: None,
                amount: 59_900,
                coin_cost,
            },
            now,
        )
    }

    #[tokio::test]
    async fn test_concurrent_accepts_have_one_winner() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let booking = pending_booking(10, now);
        store.insert_booking(&booking).await;

        let mut technicians = Vec::new();
        for i in 0..16 {
            let tech = Technician::new(format!("tech-{}", i), vec![booking.sub_category_id], 50);
            store.upsert_technician(&tech).await.unwrap();
            technicians.push(tech.id);
        }

        let handles: Vec<_> = technicians
            .iter()
            .map(|tech_id| {
                let store = store.clone();
                let (booking_id, tech_id) = (booking.id, *tech_id);
                tokio::spawn(async move { store.accept_booking(booking_id, tech_id, now).await })
            })
            .collect();

        let mut winners = Vec::new();
        let mut already_assigned = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(acceptance) => winners.push(acceptance),
                Err(EngineError::BookingAlreadyAssigned(_)) => already_assigned += 1,
                Err(other) => panic!("unexpected {:?}", other),
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(already_assigned, 15);
        assert_eq!(winners[0].balance, 40);

        let winner = winners[0].booking.technician_id.unwrap();
        let usages = store.coin_usages(winner).await.unwrap();
        assert_eq!(usages.len(), 1);
        assert_eq!(usages[0].amount, -10);
    }

    #[tokio::test]
    async fn test_insufficient_coins_leaves_booking_pending() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let booking = pending_booking(30, now);
        store.insert_booking(&booking).await;

        let poor = Technician::new("poor", vec![booking.sub_category_id], 10);
        let rich = Technician::new("rich", vec![booking.sub_category_id], 100);
        store.upsert_technician(&poor).await.unwrap();
        store.upsert_technician(&rich).await.unwrap();

        assert!(matches!(
            store.accept_booking(booking.id, poor.id, now).await,
            Err(EngineError::InsufficientCoins { required: 30, available: 10, .. })
        ));
        let still = store.get_booking(booking.id).await.unwrap().unwrap();
        assert_eq!(still.status, BookingStatus::Pending);
        assert!(still.technician_id.is_none());
        assert!(store.coin_usages(poor.id).await.unwrap().is_empty());

        let acceptance = store.accept_booking(booking.id, rich.id, now).await.unwrap();
        assert_eq!(acceptance.balance, 70);
        assert_eq!(store.get_technician(poor.id).await.unwrap().unwrap().coins, 10);
    }

    #[tokio::test]
    async fn test_auto_cancel_races_accept() {
        let store = InMemoryStore::new();
        let created = Utc::now();
        let booking = pending_booking(5, created);
        store.insert_booking(&booking).await;
        let tech = Technician::new("late", vec![booking.sub_category_id], 5);
        store.upsert_technician(&tech).await.unwrap();

        let later = created + Duration::seconds(601);
        let window = Duration::minutes(10);

        let cancel = {
            let store = store.clone();
            let id = booking.id;
            tokio::spawn(async move { store.cancel_booking(id, Cancellation::Auto { window }, later).await })
        };
        let accept = {
            let store = store.clone();
            let (id, tech_id) = (booking.id, tech.id);
            tokio::spawn(async move { store.accept_booking(id, tech_id, later).await })
        };

        let cancelled = cancel.await.unwrap();
        let accepted = accept.await.unwrap();
        assert!(cancelled.is_ok() ^ accepted.is_ok());

        let refunds = store.refunds_for_booking(booking.id).await.unwrap();
        let final_status = store.get_booking(booking.id).await.unwrap().unwrap().status;
        match final_status {
            BookingStatus::AutoCancelled => {
                assert_eq!(refunds.len(), 1);
                assert_eq!(refunds[0].reason, RefundReason::AutoCancelled);
            }
            BookingStatus::Confirmed => assert!(refunds.is_empty()),
            other => panic!("unexpected status {}", other),
        }
    }

    #[tokio::test]
    async fn test_new_otp_supersedes_previous() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut booking = pending_booking(0, now);
        booking.confirm(Uuid::new_v4(), now).unwrap();
        store.insert_booking(&booking).await;

        let ttl = Duration::minutes(2);
        let first = OtpRecord::issue(&booking, OtpPurpose::Arrival, "111111".into(), now, ttl).unwrap();
        store.issue_otp(&first).await.unwrap();
        let second = OtpRecord::issue(&booking, OtpPurpose::Arrival, "222222".into(), now, ttl).unwrap();
        store.issue_otp(&second).await.unwrap();

        assert!(matches!(
            store.verify_otp(booking.id, OtpPurpose::Arrival, "111111", now).await,
            Err(EngineError::OtpInvalid)
        ));
        let updated = store.verify_otp(booking.id, OtpPurpose::Arrival, "222222", now).await.unwrap();
        assert_eq!(updated.status, BookingStatus::InProgress);
    }

    #[tokio::test]
    async fn test_payment_binds_to_one_booking() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let offering = ServiceOffering { id: Uuid::new_v4(), name: "AC service".into(), price: 49_900, coin_cost: 10 };
        let mut payment = Payment::new(
            Uuid::new_v4(),
            &offering,
            NaiveDate::from_ymd_opt(2030, 3, 14).unwrap(),
            "12:00-14:00".parse().unwrap(),
            "INR",
            now,
        );
        store.insert_payment(&payment).await.unwrap();

        let mut booking = pending_booking(10, now);
        booking.payment_id = Some(payment.id);
        assert!(matches!(
            store.create_booking_for_payment(&booking).await,
            Err(EngineError::ValidationError(_))
        ));

        payment.status = PaymentStatus::Authorized;
        payment.gateway_payment_id = Some("pay_1".into());
        let authorized = store.authorize_payment(&payment).await.unwrap();
        assert_eq!(authorized.status, PaymentStatus::Authorized);
        store.create_booking_for_payment(&booking).await.unwrap();

        // A late duplicate authorization keeps the binding
        let again = store.authorize_payment(&payment).await.unwrap();
        assert_eq!(again.booking_id, Some(booking.id));

        let mut second = pending_booking(10, now);
        second.payment_id = Some(payment.id);
        assert!(store.create_booking_for_payment(&second).await.is_err());
        assert!(store.get_booking(second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_failed_operations_once() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let op = FailedPaymentOperation::new(
            Uuid::new_v4(),
            None,
            fixr_core::payment::FailedStep::BookingCreation,
            "boom",
            now,
        );
        store.insert_failed_operation(&op).await.unwrap();

        let claimed = store.claim_failed_operations(10, now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, FailedOperationStatus::Retrying);
        assert!(store.claim_failed_operations(10, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_profile_sync_keeps_coin_balance() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let booking = pending_booking(10, now);
        store.insert_booking(&booking).await;

        let tech = Technician::new("sync", vec![booking.sub_category_id], 50);
        store.upsert_technician(&tech).await.unwrap();
        let stale = store.get_technician(tech.id).await.unwrap().unwrap();

        store.accept_booking(booking.id, tech.id, now).await.unwrap();

        let mut renamed = stale.clone();
        renamed.name = "renamed".into();
        store.upsert_technician(&renamed).await.unwrap();

        let stored = store.get_technician(tech.id).await.unwrap().unwrap();
        let ledger: i64 = store.coin_usages(tech.id).await.unwrap().iter().map(|u| u.amount).sum();
        assert_eq!(stored.name, "renamed");
        assert_eq!(stored.coins, 40);
        assert_eq!(stored.coins, 50 + ledger);
    }

    #[tokio::test]
    async fn test_wrong_codes_burn_otp() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut booking = pending_booking(0, now);
        booking.confirm(Uuid::new_v4(), now).unwrap();
        store.insert_booking(&booking).await;

        let record = OtpRecord::issue(&booking, OtpPurpose::Arrival, "424242".into(), now, Duration::minutes(2)).unwrap();
        store.issue_otp(&record).await.unwrap();

        for _ in 0..otp::MAX_OTP_ATTEMPTS {
            assert!(matches!(
                store.verify_otp(booking.id, OtpPurpose::Arrival, "000000", now).await,
                Err(EngineError::OtpInvalid)
            ));
        }
        assert!(matches!(
            store.verify_otp(booking.id, OtpPurpose::Arrival, "424242", now).await,
            Err(EngineError::OtpInvalid)
        ));
        assert_eq!(store.get_booking(booking.id).await.unwrap().unwrap().status, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_completion_writes_payout_with_transition() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut booking = pending_booking(0, now);
        booking.confirm(Uuid::new_v4(), now).unwrap();
        booking.start_service(now).unwrap();
        store.insert_booking(&booking).await;

        let record = OtpRecord::issue(&booking, OtpPurpose::Completion, "123123".into(), now, Duration::minutes(2)).unwrap();
        store.issue_otp(&record).await.unwrap();

        assert!(store.verify_otp(booking.id, OtpPurpose::Completion, "999999", now).await.is_err());
        assert!(store.payouts_for_booking(booking.id).await.unwrap().is_empty());

        let done = store.verify_otp(booking.id, OtpPurpose::Completion, "123123", now).await.unwrap();
        assert_eq!(done.status, BookingStatus::Completed);
        let payouts = store.payouts_for_booking(booking.id).await.unwrap();
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].amount, booking.amount);
    }

    #[tokio::test]
    async fn test_refund_unbound_payment_only_once_and_only_authorized() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let offering = ServiceOffering { id: Uuid::new_v4(), name: "Painting".into(), price: 80_000, coin_cost: 10 };
        let mut payment = Payment::new(
            Uuid::new_v4(),
            &offering,
            NaiveDate::from_ymd_opt(2030, 3, 14).unwrap(),
            "12:00-14:00".parse().unwrap(),
            "INR",
            now,
        );
        store.insert_payment(&payment).await.unwrap();

        // Never authorized, nothing to give back
        assert!(store.refund_unbound_payment(payment.id, now).await.unwrap().is_none());
        assert_eq!(store.get_payment(payment.id).await.unwrap().unwrap().status, PaymentStatus::Created);

        payment.gateway_payment_id = Some("pay_2".into());
        store.authorize_payment(&payment).await.unwrap();

        let refund = store.refund_unbound_payment(payment.id, now).await.unwrap().unwrap();
        assert_eq!(refund.amount, 80_000);
        assert_eq!(refund.reason, RefundReason::BookingFailed);
        assert!(store.refund_unbound_payment(payment.id, now).await.unwrap().is_none());

        // A refunded payment can no longer be booked
        let mut booking = pending_booking(10, now);
        booking.payment_id = Some(payment.id);
        assert!(store.create_booking_for_payment(&booking).await.is_err());
    }

    #[tokio::test]
    async fn test_bound_payment_is_not_refunded() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let offering = ServiceOffering { id: Uuid::new_v4(), name: "Plumbing".into(), price: 30_000, coin_cost: 5 };
        let mut payment = Payment::new(
            Uuid::new_v4(),
            &offering,
            NaiveDate::from_ymd_opt(2030, 3, 14).unwrap(),
            "12:00-14:00".parse().unwrap(),
            "INR",
            now,
        );
        store.insert_payment(&payment).await.unwrap();
        payment.gateway_payment_id = Some("pay_3".into());
        store.authorize_payment(&payment).await.unwrap();

        let mut booking = pending_booking(5, now);
        booking.payment_id = Some(payment.id);
        store.create_booking_for_payment(&booking).await.unwrap();

        assert!(store.refund_unbound_payment(payment.id, now).await.unwrap().is_none());
        assert_eq!(store.get_payment(payment.id).await.unwrap().unwrap().status, PaymentStatus::Authorized);
    }
}
