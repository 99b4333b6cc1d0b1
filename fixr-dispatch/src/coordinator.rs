use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use fixr_core::ledger::CoinUsage;
use fixr_core::repository::{
    BookingRepository, CatalogRepository, Cancellation, PaymentRepository, RejectedBy, Rejection,
    TechnicianRepository,
};
use fixr_core::{
    Booking, EngineError, EngineResult, FailedPaymentOperation, FailedStep, GatewayOrder, GeoPoint,
    NewBooking, Payment, PaymentAuthorization, PaymentStatus, Refund, TimeSlot,
};
use fixr_shared::{BookingEvent, Recipient};

use crate::dispatch::validate_location;
use crate::engine::BookingEngine;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrder {
    pub sub_category_id: Uuid,
    pub date: NaiveDate,
    pub time_slot: TimeSlot,
    pub location: Option<GeoPoint>,
    pub preferred_technician_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentOrder {
    pub payment_id: Uuid,
    pub gateway_order_id: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyPayment {
    pub payment_id: Uuid,
    #[serde(flatten)]
    pub authorization: PaymentAuthorization,
    pub location: Option<GeoPoint>,
    pub preferred_technician_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBooking {
    pub payment_id: Uuid,
    pub location: Option<GeoPoint>,
    pub preferred_technician_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub succeeded: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
}

impl BookingEngine {
    /// Step one of checkout: price the service and open a gateway order.
    /// No booking exists yet.
    pub async fn create_payment_order(&self, customer_id: Uuid, req: CreateOrder) -> EngineResult<PaymentOrder> {
        let offering = self
            .store
            .get_offering(req.sub_category_id)
            .await?
            .ok_or(EngineError::OfferingNotFound(req.sub_category_id))?;

        self.precheck(req.sub_category_id, req.date, req.time_slot, req.location).await?;

        let mut payment =
            Payment::new(customer_id, &offering, req.date, req.time_slot, &self.rules.currency, self.now());
        payment.location = req.location;
        payment.preferred_technician_id = req.preferred_technician_id;
        let order: GatewayOrder = self
            .gateway
            .create_order(payment.id, payment.amount, &payment.currency)
            .await
            .map_err(|e| {
                error!("Gateway order creation failed for payment {}: {}", payment.id, e);
                EngineError::OrderCreationFailed(e.to_string())
            })?;

        payment.gateway_order_id = Some(order.order_id.clone());
        self.store.insert_payment(&payment).await?;

        info!("Payment {} opened as gateway order {}", payment.id, order.order_id);
        Ok(PaymentOrder {
            payment_id: payment.id,
            gateway_order_id: order.order_id,
            amount: payment.amount,
            currency: payment.currency,
        })
    }

    /// Verify the checkout signature, then create and dispatch the booking.
    /// Anything that fails after the money is authorized is recorded for the
    /// retry sweep.
    pub async fn verify_payment(&self, customer_id: Uuid, req: VerifyPayment) -> EngineResult<Booking> {
        let payment = self.load_payment(req.payment_id, customer_id).await?;

        // Replayed verification of an already booked payment
        if let Some(booking_id) = payment.booking_id {
            return self.load_booking(booking_id).await;
        }
        validate_location(req.location)?;

        if payment.gateway_order_id.as_deref() != Some(req.authorization.gateway_order_id.as_str())
            || !self.gateway.verify_signature(&req.authorization)
        {
            warn!("Signature check failed for payment {}", payment.id);
            if payment.status == PaymentStatus::Created {
                self.store.fail_payment(payment.id, self.now()).await?;
            }
            return Err(EngineError::SignatureInvalid);
        }

        let mut authorized = payment.clone();
        authorized.gateway_payment_id = Some(req.authorization.gateway_payment_id.clone());
        authorized.location = req.location.or(payment.location);
        authorized.preferred_technician_id = req.preferred_technician_id.or(payment.preferred_technician_id);
        authorized.updated_at = self.now();
        let payment = self.store.authorize_payment(&authorized).await?;
        info!("Payment {} authorized", payment.id);

        if let Some(booking_id) = payment.booking_id {
            return self.load_booking(booking_id).await;
        }

        let location = req.location.or(payment.location);
        let preferred = req.preferred_technician_id.or(payment.preferred_technician_id);
        self.book_authorized(&payment, location, preferred).await
    }

    /// Create the booking for an authorized payment that has none yet.
    pub async fn create_booking(&self, customer_id: Uuid, req: CreateBooking) -> EngineResult<Booking> {
        let payment = self.load_payment(req.payment_id, customer_id).await?;
        if payment.status != PaymentStatus::Authorized {
            return Err(EngineError::ValidationError("payment is not authorized".into()));
        }
        if let Some(booking_id) = payment.booking_id {
            return Err(EngineError::ValidationError(format!(
                "payment already used for booking {}",
                booking_id
            )));
        }

        let location = req.location.or(payment.location);
        let preferred = req.preferred_technician_id.or(payment.preferred_technician_id);
        self.book_authorized(&payment, location, preferred).await
    }

    async fn load_payment(&self, payment_id: Uuid, customer_id: Uuid) -> EngineResult<Payment> {
        let payment = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or(EngineError::PaymentNotFound(payment_id))?;
        if payment.customer_id != customer_id {
            return Err(EngineError::Forbidden("payment belongs to another customer".into()));
        }
        Ok(payment)
    }

    async fn book_authorized(
        &self,
        payment: &Payment,
        location: Option<GeoPoint>,
        preferred_technician_id: Option<Uuid>,
    ) -> EngineResult<Booking> {
        validate_location(location)?;

        let booking = match self.insert_booking_for(payment, location, preferred_technician_id).await {
            Ok(booking) => booking,
            Err(e) => {
                // A concurrent verification may have bound the payment first
                if let Ok(Some(current)) = self.store.get_payment(payment.id).await {
                    if let Some(booking_id) = current.booking_id {
                        return self.load_booking(booking_id).await;
                    }
                }
                self.record_failure(payment.id, None, FailedStep::BookingCreation, &e).await;
                return Err(e);
            }
        };

        if let Err(e) = self.broadcast(booking.id).await {
            self.record_failure(payment.id, Some(booking.id), FailedStep::Dispatch, &e).await;
        }
        Ok(booking)
    }

    async fn insert_booking_for(
        &self,
        payment: &Payment,
        location: Option<GeoPoint>,
        preferred_technician_id: Option<Uuid>,
    ) -> EngineResult<Booking> {
        let offering = self
            .store
            .get_offering(payment.sub_category_id)
            .await?
            .ok_or(EngineError::OfferingNotFound(payment.sub_category_id))?;

        let booking = Booking::new(
            NewBooking {
                customer_id: payment.customer_id,
                sub_category_id: payment.sub_category_id,
                payment_id: Some(payment.id),
                preferred_technician_id,
                date: payment.date,
                time_slot: payment.time_slot,
                location,
                amount: payment.amount,
                coin_cost: offering.coin_cost,
            },
            self.now(),
        );
        self.store.create_booking_for_payment(&booking).await?;

        info!("Booking {} created for payment {}", booking.id, payment.id);
        Ok(booking)
    }

    async fn record_failure(&self, payment_id: Uuid, booking_id: Option<Uuid>, step: FailedStep, cause: &EngineError) {
        warn!("Post-payment step {:?} failed for payment {}: {}", step, payment_id, cause);
        let op = FailedPaymentOperation::new(payment_id, booking_id, step, cause.to_string(), self.now());
        if let Err(e) = self.store.insert_failed_operation(&op).await {
            error!("Could not record failed operation for payment {}: {}", payment_id, e);
        }
    }

    /// Customer cancellation, allowed while pending and inside the window.
    pub async fn cancel_booking(&self, booking_id: Uuid, customer_id: Uuid) -> EngineResult<Refund> {
        let cancellation = Cancellation::ByCustomer {
            customer_id,
            window: self.rules.cancellation_window,
        };
        let (booking, refund) = self.store.cancel_booking(booking_id, cancellation, self.now()).await?;

        info!("Booking {} cancelled by customer, refund {}", booking_id, refund.id);
        self.notifier.publish(
            Recipient::Customer(booking.customer_id),
            BookingEvent::BookingCancelled { booking_id, refund_id: refund.id },
        );
        self.close_broadcast(&booking, None).await;
        Ok(refund)
    }

    pub async fn reject_booking(&self, booking_id: Uuid, by: RejectedBy) -> EngineResult<Rejection> {
        let rejection = self.store.reject_booking(booking_id, by, self.now()).await?;
        let event = BookingEvent::BookingRejected {
            booking_id,
            refund_id: rejection.refund.id,
        };

        info!("Booking {} rejected by {:?}", booking_id, by);
        self.notifier.publish(Recipient::Customer(rejection.booking.customer_id), event.clone());
        match rejection.booking.technician_id {
            Some(technician_id) => self.notifier.publish(Recipient::Technician(technician_id), event),
            None => self.close_broadcast(&rejection.booking, None).await,
        }
        Ok(rejection)
    }

    pub async fn top_up(&self, technician_id: Uuid, amount: i64) -> EngineResult<(i64, CoinUsage)> {
        if amount <= 0 {
            return Err(EngineError::ValidationError("top-up amount must be positive".into()));
        }
        let (balance, usage) = self.store.top_up_coins(technician_id, amount, self.now()).await?;
        info!("Technician {} topped up {} coins (balance {})", technician_id, amount, balance);
        Ok((balance, usage))
    }

    /// Re-run post-payment steps that failed earlier.
    pub async fn retry_failed_operations(&self, limit: i64) -> EngineResult<RetryReport> {
        let claimed = self.store.claim_failed_operations(limit, self.now()).await?;
        let mut report = RetryReport::default();

        for mut op in claimed {
            match self.retry_step(&mut op).await {
                Ok(()) => {
                    op.mark_success(self.now());
                    report.succeeded += 1;
                }
                Err(e) => {
                    let exhausted =
                        op.record_failure(e.to_string(), self.rules.failed_operation_max_retries, self.now());
                    if exhausted {
                        report.exhausted += 1;
                        self.give_up(&op).await;
                    } else {
                        report.rescheduled += 1;
                    }
                }
            }
            self.store.update_failed_operation(&op).await?;
        }

        if report != RetryReport::default() {
            info!(
                "Retry sweep: {} succeeded, {} rescheduled, {} exhausted",
                report.succeeded, report.rescheduled, report.exhausted
            );
        }
        Ok(report)
    }

    async fn retry_step(&self, op: &mut FailedPaymentOperation) -> EngineResult<()> {
        match op.failed_step {
            FailedStep::BookingCreation => {
                let payment = self
                    .store
                    .get_payment(op.payment_id)
                    .await?
                    .ok_or(EngineError::PaymentNotFound(op.payment_id))?;

                let booking_id = match payment.booking_id {
                    Some(id) => id,
                    None => {
                        self.insert_booking_for(&payment, payment.location, payment.preferred_technician_id)
                            .await?
                            .id
                    }
                };
                op.booking_id = Some(booking_id);

                if let Err(e) = self.broadcast(booking_id).await {
                    // The booking now exists; further dispatch failures are the watchdog's concern
                    warn!("Dispatch after recovered booking {} failed: {}", booking_id, e);
                }
                Ok(())
            }
            FailedStep::Dispatch | FailedStep::Notification => {
                let booking_id = op
                    .booking_id
                    .ok_or_else(|| EngineError::ValidationError("failed dispatch has no booking".into()))?;
                match self.broadcast(booking_id).await {
                    Ok(_) => Ok(()),
                    // Nothing left to dispatch
                    Err(EngineError::BookingNotPending { .. }) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Out of retries. A payment that never got a booking is refunded here;
    /// a booking that was created but never dispatched is left to the
    /// watchdog, whose auto-cancel carries its own refund.
    async fn give_up(&self, op: &FailedPaymentOperation) {
        error!("Giving up on {:?} for payment {} after {} attempts", op.failed_step, op.payment_id, op.retry_count);
        if op.failed_step != FailedStep::BookingCreation || op.booking_id.is_some() {
            return;
        }

        match self.store.refund_unbound_payment(op.payment_id, self.now()).await {
            Ok(Some(refund)) => info!(
                "Payment {} refunded ({}) after booking creation failed",
                op.payment_id, refund.id
            ),
            Ok(None) => info!("Payment {} is bound or settled, no refund issued", op.payment_id),
            Err(e) => error!("Refund for payment {} not written: {}", op.payment_id, e),
        }
    }
}
