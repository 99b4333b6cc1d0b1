use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::booking::{Booking, BookingStatus};
use crate::error::{EngineError, EngineResult};
use crate::payment::AdminPayout;

pub const OTP_DIGITS: usize = 6;

/// Wrong submissions a single code tolerates before it is burnt.
pub const MAX_OTP_ATTEMPTS: i32 = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OtpPurpose {
    Arrival,
    Completion,
}

impl OtpPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            OtpPurpose::Arrival => "arrival",
            OtpPurpose::Completion => "completion",
        }
    }

    /// The status a booking must be in for a code of this purpose to be
    /// issued or consumed.
    pub fn required_status(&self) -> BookingStatus {
        match self {
            OtpPurpose::Arrival => BookingStatus::Confirmed,
            OtpPurpose::Completion => BookingStatus::InProgress,
        }
    }
}

impl fmt::Display for OtpPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OtpPurpose {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "arrival" => Ok(OtpPurpose::Arrival),
            "completion" => Ok(OtpPurpose::Completion),
            other => Err(EngineError::ValidationError(format!("unknown OTP purpose '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OtpRecord {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub technician_id: Uuid,
    pub customer_id: Uuid,
    pub code: String,
    pub purpose: OtpPurpose,
    pub expires_at: DateTime<Utc>,
    pub is_used: bool,
    pub failed_attempts: i32,
    pub created_at: DateTime<Utc>,
}

impl OtpRecord {
    /// Issue a fresh code for `booking`. The booking must be assigned and in
    /// the status the purpose gates.
    pub fn issue(
        booking: &Booking,
        purpose: OtpPurpose,
        code: String,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> EngineResult<Self> {
        let expected = purpose.required_status();
        let technician_id = match booking.technician_id {
            Some(id) if booking.status == expected => id,
            _ => {
                return Err(EngineError::BookingWrongState {
                    status: booking.status,
                    expected,
                })
            }
        };

        Ok(Self {
            id: Uuid::new_v4(),
            booking_id: booking.id,
            technician_id,
            customer_id: booking.customer_id,
            code,
            purpose,
            expires_at: now + ttl,
            is_used: false,
            failed_attempts: 0,
            created_at: now,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Expiry is checked before the code, so a late submission is reported as
    /// expired even when the digits are right.
    pub fn check(&self, submitted: &str, now: DateTime<Utc>) -> EngineResult<()> {
        if self.is_used {
            return Err(EngineError::OtpInvalid);
        }
        if self.is_expired(now) {
            return Err(EngineError::OtpExpired);
        }

        let matches: bool = self.code.as_bytes().ct_eq(submitted.trim().as_bytes()).into();
        if !matches {
            return Err(EngineError::OtpInvalid);
        }
        Ok(())
    }

    pub fn consume(&mut self) {
        self.is_used = true;
    }

    /// Count a wrong submission. Returns true once the code has been burnt.
    pub fn record_miss(&mut self) -> bool {
        self.failed_attempts += 1;
        if self.failed_attempts >= MAX_OTP_ATTEMPTS {
            self.consume();
        }
        self.is_used
    }
}

pub fn generate_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!("{:0width$}", rng.gen_range(0..1_000_000u32), width = OTP_DIGITS)
}

/// Check `code` against the newest live record for a booking and purpose and
/// apply the gated transition. Completion also yields the technician's payout.
///
/// Stores call this inside the unit of work that persists the record, the
/// booking and the payout. The record must be written back even when this
/// fails, since a wrong code counts against its attempts.
pub fn verify_and_apply(
    latest: Option<&mut OtpRecord>,
    booking: &mut Booking,
    code: &str,
    now: DateTime<Utc>,
) -> EngineResult<Option<AdminPayout>> {
    let record = latest.ok_or(EngineError::OtpInvalid)?;
    if let Err(e) = record.check(code, now) {
        if matches!(e, EngineError::OtpInvalid) && !record.is_used {
            record.record_miss();
        }
        return Err(e);
    }

    let payout = match record.purpose {
        OtpPurpose::Arrival => {
            booking.start_service(now)?;
            None
        }
        OtpPurpose::Completion => {
            booking.complete_service(now)?;
            Some(AdminPayout::for_completed(booking, record.technician_id, now))
        }
    };
    record.consume();
    Ok(payout)
}
