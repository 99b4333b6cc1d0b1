use chrono::{NaiveDate, TimeZone, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use fixr_core::repository::{BookingRepository, TechnicianRepository};
use fixr_core::{Booking, BookingStatus, EngineError, EngineResult, GeoPoint, Technician, TimeSlot};
use fixr_shared::{BookingEvent, Recipient};

use crate::engine::BookingEngine;

impl BookingEngine {
    /// Technicians who could take a job in `sub_category_id` at `location`.
    ///
    /// Radius is only enforced when both sides carry a location.
    pub async fn eligible_technicians(
        &self,
        sub_category_id: Uuid,
        location: Option<GeoPoint>,
    ) -> EngineResult<Vec<Technician>> {
        let radius = self.rules.service_radius_km;
        let technicians = self.store.technicians_for(sub_category_id).await?;

        Ok(technicians
            .into_iter()
            .filter(|t| t.serves(sub_category_id))
            .filter(|t| match (location, t.location) {
                (Some(job), Some(base)) => job.distance_km(&base) <= radius,
                _ => true,
            })
            .collect())
    }

    /// Run before payment so a customer is never charged for a service nobody
    /// can perform, or for a slot that has already begun.
    pub async fn precheck(
        &self,
        sub_category_id: Uuid,
        date: NaiveDate,
        time_slot: TimeSlot,
        location: Option<GeoPoint>,
    ) -> EngineResult<usize> {
        validate_location(location)?;

        let starts_at = Utc.from_utc_datetime(&time_slot.starts_on(date));
        if starts_at <= self.now() {
            return Err(EngineError::ValidationError("time slot has already started".into()));
        }

        let candidates = self.eligible_technicians(sub_category_id, location).await?;
        if candidates.is_empty() {
            info!("Precheck found no technicians for sub-category {}", sub_category_id);
            return Err(EngineError::NoTechniciansAvailable);
        }
        Ok(candidates.len())
    }

    /// Offer a pending booking to every eligible technician.
    pub async fn broadcast(&self, booking_id: Uuid) -> EngineResult<usize> {
        let booking = self.load_booking(booking_id).await?;
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::BookingNotPending {
                booking_id,
                status: booking.status,
            });
        }

        let candidates = self.eligible_technicians(booking.sub_category_id, booking.location).await?;
        if candidates.is_empty() {
            warn!("No technicians available for booking {}", booking_id);
            return Err(EngineError::NoTechniciansAvailable);
        }

        let ids: Vec<Uuid> = candidates.iter().map(|t| t.id).collect();
        self.store.record_candidates(booking_id, &ids).await?;

        let respond_before = booking.cancellation_deadline(self.rules.auto_cancel_window);
        for technician_id in &ids {
            self.notifier.publish(
                Recipient::Technician(*technician_id),
                BookingEvent::NewBookingRequest {
                    booking_id,
                    sub_category_id: booking.sub_category_id,
                    date: booking.date,
                    time_slot: booking.time_slot.to_string(),
                    amount: booking.amount,
                    coin_cost: booking.coin_cost,
                    respond_before,
                },
            );
        }

        info!("Broadcast booking {} to {} technicians", booking_id, ids.len());
        Ok(ids.len())
    }

    /// Tell every offered technician except `winner` that the request is gone.
    /// Best effort.
    pub(crate) async fn close_broadcast(&self, booking: &Booking, winner: Option<Uuid>) {
        let candidates = match self.store.candidates(booking.id).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Could not load candidates for booking {}: {}", booking.id, e);
                return;
            }
        };

        let mut closed = 0;
        for technician_id in candidates.into_iter().filter(|id| Some(*id) != winner) {
            self.notifier.publish(
                Recipient::Technician(technician_id),
                BookingEvent::BookingRequestClosed {
                    booking_id: booking.id,
                    status: booking.status.to_string(),
                },
            );
            closed += 1;
        }
        debug!("Closed booking {} for {} technicians", booking.id, closed);
    }
}

pub(crate) fn validate_location(location: Option<GeoPoint>) -> EngineResult<()> {
    match location {
        Some(point) if !point.is_valid() => Err(EngineError::ValidationError("location out of range".into())),
        _ => Ok(()),
    }
}
