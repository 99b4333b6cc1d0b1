use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use fixr_core::repository::BookingRepository;
use fixr_core::{Booking, Clock, EngineError, EngineResult, Notifier, OtpDelivery, PaymentGateway, Store};

use crate::actor::Actor;
use crate::rules::EngineRules;

/// Entry point for every booking lifecycle operation. Cheap to clone; all
/// collaborators are shared.
#[derive(Clone)]
pub struct BookingEngine {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) gateway: Arc<dyn PaymentGateway>,
    pub(crate) otp_delivery: Arc<dyn OtpDelivery>,
    pub(crate) rules: EngineRules,
}

impl BookingEngine {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn PaymentGateway>,
        otp_delivery: Arc<dyn OtpDelivery>,
        rules: EngineRules,
    ) -> Self {
        Self { store, notifier, clock, gateway, otp_delivery, rules }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn rules(&self) -> &EngineRules {
        &self.rules
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) async fn load_booking(&self, booking_id: Uuid) -> EngineResult<Booking> {
        self.store
            .get_booking(booking_id)
            .await?
            .ok_or(EngineError::BookingNotFound(booking_id))
    }

    /// Read a booking on behalf of one of its parties.
    pub async fn get_booking(&self, booking_id: Uuid, actor: Actor) -> EngineResult<Booking> {
        let booking = self.load_booking(booking_id).await?;
        if actor.is_admin() || booking.is_party(actor.id()) {
            return Ok(booking);
        }
        // Offered technicians may look at the request they were sent
        if let Actor::Technician(id) = actor {
            if self.store.candidates(booking_id).await?.contains(&id) {
                return Ok(booking);
            }
        }
        Err(EngineError::Forbidden("not a party to this booking".into()))
    }
}
