use tracing::{debug, info, warn};
use uuid::Uuid;

use fixr_core::repository::{BookingRepository, Cancellation};
use fixr_core::{Booking, EngineError, EngineResult, Refund};
use fixr_shared::{BookingEvent, Recipient};

use crate::engine::BookingEngine;

impl BookingEngine {
    /// Cancel a booking nobody accepted in time. Safe to call any number of
    /// times; only the first successful call writes a refund.
    pub async fn auto_cancel(&self, booking_id: Uuid) -> EngineResult<(Booking, Refund)> {
        let cancellation = Cancellation::Auto { window: self.rules.auto_cancel_window };
        let (booking, refund) = self.store.cancel_booking(booking_id, cancellation, self.now()).await?;

        info!("Booking {} auto-cancelled, refund {}", booking_id, refund.id);
        self.notifier.publish(
            Recipient::Customer(booking.customer_id),
            BookingEvent::BookingAutoCancelled { booking_id, refund_id: refund.id },
        );
        self.close_broadcast(&booking, None).await;

        Ok((booking, refund))
    }

    /// Auto-cancel every booking whose window has elapsed. Returns how many
    /// were cancelled by this pass.
    pub async fn sweep_expired(&self, limit: i64) -> EngineResult<usize> {
        let cutoff = self.now() - self.rules.auto_cancel_window;
        let stale = self.store.list_stale_pending(cutoff, limit).await?;

        let mut cancelled = 0;
        for booking in stale {
            match self.auto_cancel(booking.id).await {
                Ok(_) => cancelled += 1,
                // Accepted or cancelled since the listing
                Err(e) if e.is_precondition_race() => debug!("Skipping booking {}: {}", booking.id, e),
                Err(EngineError::CancellationWindowNotElapsed { .. }) => {}
                Err(e) => warn!("Auto-cancel failed for booking {}: {}", booking.id, e),
            }
        }

        if cancelled > 0 {
            info!("Watchdog auto-cancelled {} bookings", cancelled);
        }
        Ok(cancelled)
    }
}
