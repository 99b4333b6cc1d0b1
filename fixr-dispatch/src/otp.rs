use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fixr_core::repository::OtpRepository;
use fixr_core::otp;
use fixr_core::{Booking, EngineError, EngineResult, OtpDelivery, OtpPurpose, OtpRecord};
use fixr_shared::{BookingEvent, Recipient};

use crate::actor::Actor;
use crate::engine::BookingEngine;

/// Delivery used when no SMS/email provider is configured. Writes the code to
/// the log at debug level.
pub struct LoggingOtpDelivery;

#[async_trait]
impl OtpDelivery for LoggingOtpDelivery {
    async fn deliver(&self, record: &OtpRecord) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(
            "Delivering {} OTP for booking {} to customer {}",
            record.purpose, record.booking_id, record.customer_id
        );
        debug!("OTP code {} expires at {}", record.code, record.expires_at);
        Ok(())
    }
}

impl BookingEngine {
    /// Issue a fresh code for the booking's assigned technician. Any earlier
    /// unused code for the same purpose stops working.
    pub async fn generate_otp(
        &self,
        booking_id: Uuid,
        purpose: OtpPurpose,
        technician_id: Uuid,
    ) -> EngineResult<DateTime<Utc>> {
        let booking = self.load_booking(booking_id).await?;
        if booking.technician_id != Some(technician_id) {
            return Err(EngineError::Forbidden("booking is not assigned to this technician".into()));
        }

        let code = otp::generate_code(&mut rand::thread_rng());
        let record = OtpRecord::issue(&booking, purpose, code, self.now(), self.rules.otp_ttl)?;
        self.store.issue_otp(&record).await?;

        // A failed hand-off is recoverable by resending
        if let Err(e) = self.otp_delivery.deliver(&record).await {
            error!("OTP delivery failed for booking {}: {}", booking_id, e);
        }

        info!("Issued {} OTP for booking {}", purpose, booking_id);
        Ok(record.expires_at)
    }

    /// Check a submitted code and apply the transition it gates. Only the
    /// booking's customer can confirm; the technician holds no code. A
    /// completion also records the technician's payout.
    pub async fn verify_otp(
        &self,
        booking_id: Uuid,
        purpose: OtpPurpose,
        code: &str,
        actor: Actor,
    ) -> EngineResult<Booking> {
        let booking = self.load_booking(booking_id).await?;
        match actor {
            Actor::Customer(id) if id == booking.customer_id => {}
            _ => return Err(EngineError::Forbidden("only the customer confirms a code".into())),
        }

        let booking = match self.store.verify_otp(booking_id, purpose, code, self.now()).await {
            Ok(booking) => booking,
            Err(e) => {
                warn!("{} OTP rejected for booking {}: {}", purpose, booking_id, e);
                return Err(e);
            }
        };

        let technician_id = booking.technician_id.ok_or_else(|| {
            EngineError::Storage(format!("booking {} verified without a technician", booking_id))
        })?;

        let event = match purpose {
            OtpPurpose::Arrival => BookingEvent::ServiceStarted { booking_id },
            OtpPurpose::Completion => BookingEvent::ServiceCompleted {
                booking_id,
                completed_at: booking.completed_at.unwrap_or(booking.updated_at),
            },
        };
        self.notifier.publish(Recipient::Customer(booking.customer_id), event.clone());
        self.notifier.publish(Recipient::Technician(technician_id), event);

        info!("Booking {} is now {}", booking_id, booking.status);
        Ok(booking)
    }
}
