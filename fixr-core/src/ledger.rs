use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::booking::Booking;
use crate::error::{EngineError, EngineResult};
use crate::geo::GeoPoint;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Technician {
    pub id: Uuid,
    pub name: String,
    pub sub_category_ids: Vec<Uuid>,
    pub active: bool,
    pub approved: bool,
    pub location: Option<GeoPoint>,
    /// Spendable coin balance, never negative
    pub coins: i64,
    pub created_at: DateTime<Utc>,
}

impl Technician {
    pub fn new(name: impl Into<String>, sub_category_ids: Vec<Uuid>, coins: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            sub_category_ids,
            active: true,
            approved: true,
            location: None,
            coins,
            created_at: Utc::now(),
        }
    }

    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }

    /// Active, approved and serving the sub-category. Distance is checked by
    /// the dispatcher.
    pub fn serves(&self, sub_category_id: Uuid) -> bool {
        self.active && self.approved && self.sub_category_ids.contains(&sub_category_id)
    }

    pub fn debit(&mut self, amount: i64) -> EngineResult<i64> {
        if amount < 0 {
            return Err(EngineError::ValidationError("debit amount must not be negative".into()));
        }
        if self.coins < amount {
            return Err(EngineError::InsufficientCoins {
                technician_id: self.id,
                required: amount,
                available: self.coins,
            });
        }
        self.coins -= amount;
        Ok(self.coins)
    }

    pub fn credit(&mut self, amount: i64) -> EngineResult<i64> {
        if amount <= 0 {
            return Err(EngineError::ValidationError("credit amount must be positive".into()));
        }
        self.coins = self
            .coins
            .checked_add(amount)
            .ok_or_else(|| EngineError::ValidationError("coin balance overflow".into()))?;
        Ok(self.coins)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoinReason {
    Acceptance,
    Reversal,
    TopUp,
}

impl CoinReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoinReason::Acceptance => "ACCEPTANCE",
            CoinReason::Reversal => "REVERSAL",
            CoinReason::TopUp => "TOP_UP",
        }
    }
}

impl fmt::Display for CoinReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoinReason {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACCEPTANCE" => Ok(CoinReason::Acceptance),
            "REVERSAL" => Ok(CoinReason::Reversal),
            "TOP_UP" => Ok(CoinReason::TopUp),
            other => Err(EngineError::Storage(format!("unknown coin reason '{}'", other))),
        }
    }
}

/// Append-only audit row for every balance change. Debits are negative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoinUsage {
    pub id: Uuid,
    pub booking_id: Option<Uuid>,
    pub technician_id: Uuid,
    pub amount: i64,
    pub reason: CoinReason,
    pub created_at: DateTime<Utc>,
}

impl CoinUsage {
    pub fn acceptance(booking: &Booking, technician_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id: Some(booking.id),
            technician_id,
            amount: -booking.coin_cost,
            reason: CoinReason::Acceptance,
            created_at: now,
        }
    }

    pub fn reversal(booking: &Booking, technician_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id: Some(booking.id),
            technician_id,
            amount: booking.coin_cost,
            reason: CoinReason::Reversal,
            created_at: now,
        }
    }

    pub fn top_up(technician_id: Uuid, amount: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id: None,
            technician_id,
            amount,
            reason: CoinReason::TopUp,
            created_at: now,
        }
    }
}

/// Result of winning the acceptance race.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acceptance {
    pub booking: Booking,
    pub balance: i64,
    pub usage: CoinUsage,
    pub technician_name: String,
}
