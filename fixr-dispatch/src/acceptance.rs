use tracing::{info, warn};
use uuid::Uuid;

use fixr_core::repository::{BookingRepository, TechnicianRepository};
use fixr_core::{Acceptance, EngineError, EngineResult};
use fixr_shared::{BookingEvent, Recipient};

use crate::engine::BookingEngine;

impl BookingEngine {
    /// Try to claim a pending booking for `technician_id`.
    ///
    /// The claim and the coin debit commit together in the store, so among
    /// any number of concurrent callers exactly one wins. Losers get an error
    /// and no events.
    pub async fn accept(&self, booking_id: Uuid, technician_id: Uuid) -> EngineResult<Acceptance> {
        let booking = self.load_booking(booking_id).await?;
        let technician = self
            .store
            .get_technician(technician_id)
            .await?
            .ok_or(EngineError::TechnicianNotFound(technician_id))?;

        if !technician.serves(booking.sub_category_id) {
            return Err(EngineError::Forbidden(
                "technician does not serve this sub-category".into(),
            ));
        }
        if !self.store.candidates(booking_id).await?.contains(&technician_id) {
            return Err(EngineError::Forbidden("booking was not offered to this technician".into()));
        }

        let acceptance = match self.store.accept_booking(booking_id, technician_id, self.now()).await {
            Ok(acceptance) => acceptance,
            Err(e) => {
                match &e {
                    EngineError::InsufficientCoins { required, available, .. } => info!(
                        "Technician {} cannot accept booking {}: {} coins required, {} available",
                        technician_id, booking_id, required, available
                    ),
                    e if e.is_precondition_race() => {
                        info!("Technician {} lost booking {}: {}", technician_id, booking_id, e)
                    }
                    e => warn!("Accept failed for booking {}: {}", booking_id, e),
                }
                return Err(e);
            }
        };

        info!(
            "Booking {} accepted by technician {} (balance {})",
            booking_id, technician_id, acceptance.balance
        );

        self.notifier.publish(
            Recipient::Customer(acceptance.booking.customer_id),
            BookingEvent::BookingAccepted {
                booking_id,
                technician_id,
                technician_name: acceptance.technician_name.clone(),
            },
        );
        self.close_broadcast(&acceptance.booking, Some(technician_id)).await;

        Ok(acceptance)
    }
}
