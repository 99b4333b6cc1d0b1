use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use fixr_core::booking::{Booking, BookingStatus, ServiceOffering};
use fixr_core::geo::GeoPoint;
use fixr_core::ledger::{Acceptance, CoinUsage, Technician};
use fixr_core::otp::{self, OtpPurpose, OtpRecord};
use fixr_core::payment::{AdminPayout, FailedPaymentOperation, Payment, PaymentStatus, Refund};
use fixr_core::repository::{
    BookingRepository, CatalogRepository, Cancellation, OtpRepository, PaymentRepository,
    RejectedBy, Rejection, TechnicianRepository,
};
use fixr_core::{EngineError, EngineResult};

/// Postgres-backed store. Each unit of work is a transaction that locks the
/// booking row with `FOR UPDATE` and guards every write with the status it
/// expects, so a stale precondition fails instead of overwriting.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db(err: sqlx::Error) -> EngineError {
    EngineError::Storage(err.to_string())
}

/// Enum columns are stored as their serde string form.
fn to_db<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_default()
}

fn from_db<T: DeserializeOwned>(value: String) -> EngineResult<T> {
    serde_json::from_value(serde_json::Value::String(value)).map_err(EngineError::storage)
}

fn point(latitude: Option<f64>, longitude: Option<f64>) -> Option<GeoPoint> {
    match (latitude, longitude) {
        (Some(lat), Some(lng)) => Some(GeoPoint::new(lat, lng)),
        _ => None,
    }
}

// Internal structs for type-safe querying

const BOOKING_COLUMNS: &str = "id, customer_id, technician_id, preferred_technician_id, sub_category_id, \
     payment_id, service_date, time_slot, latitude, longitude, amount, coin_cost, status, \
     arrival_verified, completed_at, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: Uuid,
    customer_id: Uuid,
    technician_id: Option<Uuid>,
    preferred_technician_id: Option<Uuid>,
    sub_category_id: Uuid,
    payment_id: Option<Uuid>,
    service_date: NaiveDate,
    time_slot: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    amount: i64,
    coin_cost: i64,
    status: String,
    arrival_verified: bool,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = EngineError;

    fn try_from(row: BookingRow) -> EngineResult<Self> {
        Ok(Booking {
            id: row.id,
            customer_id: row.customer_id,
            technician_id: row.technician_id,
            preferred_technician_id: row.preferred_technician_id,
            sub_category_id: row.sub_category_id,
            payment_id: row.payment_id,
            date: row.service_date,
            time_slot: row.time_slot.parse().map_err(EngineError::Storage)?,
            location: point(row.latitude, row.longitude),
            amount: row.amount,
            coin_cost: row.coin_cost,
            status: row.status.parse()?,
            arrival_verified: row.arrival_verified,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const TECHNICIAN_COLUMNS: &str =
    "id, name, sub_category_ids, active, approved, latitude, longitude, coins, created_at";

#[derive(sqlx::FromRow)]
struct TechnicianRow {
    id: Uuid,
    name: String,
    sub_category_ids: Vec<Uuid>,
    active: bool,
    approved: bool,
    latitude: Option<f64>,
    longitude: Option<f64>,
    coins: i64,
    created_at: DateTime<Utc>,
}

impl From<TechnicianRow> for Technician {
    fn from(row: TechnicianRow) -> Self {
        Technician {
            id: row.id,
            name: row.name,
            sub_category_ids: row.sub_category_ids,
            active: row.active,
            approved: row.approved,
            location: point(row.latitude, row.longitude),
            coins: row.coins,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CoinUsageRow {
    id: Uuid,
    booking_id: Option<Uuid>,
    technician_id: Uuid,
    amount: i64,
    reason: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<CoinUsageRow> for CoinUsage {
    type Error = EngineError;

    fn try_from(row: CoinUsageRow) -> EngineResult<Self> {
        Ok(CoinUsage {
            id: row.id,
            booking_id: row.booking_id,
            technician_id: row.technician_id,
            amount: row.amount,
            reason: row.reason.parse()?,
            created_at: row.created_at,
        })
    }
}

const OTP_COLUMNS: &str =
    "id, booking_id, technician_id, customer_id, code, purpose, expires_at, is_used, failed_attempts, created_at";

#[derive(sqlx::FromRow)]
struct OtpRow {
    id: Uuid,
    booking_id: Uuid,
    technician_id: Uuid,
    customer_id: Uuid,
    code: String,
    purpose: String,
    expires_at: DateTime<Utc>,
    is_used: bool,
    failed_attempts: i32,
    created_at: DateTime<Utc>,
}

impl TryFrom<OtpRow> for OtpRecord {
    type Error = EngineError;

    fn try_from(row: OtpRow) -> EngineResult<Self> {
        Ok(OtpRecord {
            id: row.id,
            booking_id: row.booking_id,
            technician_id: row.technician_id,
            customer_id: row.customer_id,
            code: row.code,
            purpose: row.purpose.parse()?,
            expires_at: row.expires_at,
            is_used: row.is_used,
            failed_attempts: row.failed_attempts,
            created_at: row.created_at,
        })
    }
}

const PAYMENT_COLUMNS: &str = "id, customer_id, sub_category_id, service_date, time_slot, amount, currency, \
     latitude, longitude, preferred_technician_id, gateway_order_id, gateway_payment_id, status, booking_id, \
     created_at, updated_at";

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    customer_id: Uuid,
    sub_category_id: Uuid,
    service_date: NaiveDate,
    time_slot: String,
    amount: i64,
    currency: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    preferred_technician_id: Option<Uuid>,
    gateway_order_id: Option<String>,
    gateway_payment_id: Option<String>,
    status: String,
    booking_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = EngineError;

    fn try_from(row: PaymentRow) -> EngineResult<Self> {
        Ok(Payment {
            id: row.id,
            customer_id: row.customer_id,
            sub_category_id: row.sub_category_id,
            date: row.service_date,
            time_slot: row.time_slot.parse().map_err(EngineError::Storage)?,
            amount: row.amount,
            currency: row.currency,
            location: point(row.latitude, row.longitude),
            preferred_technician_id: row.preferred_technician_id,
            gateway_order_id: row.gateway_order_id,
            gateway_payment_id: row.gateway_payment_id,
            status: from_db(row.status)?,
            booking_id: row.booking_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RefundRow {
    id: Uuid,
    booking_id: Option<Uuid>,
    customer_id: Uuid,
    payment_id: Option<Uuid>,
    amount: i64,
    reason: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<RefundRow> for Refund {
    type Error = EngineError;

    fn try_from(row: RefundRow) -> EngineResult<Self> {
        Ok(Refund {
            id: row.id,
            booking_id: row.booking_id,
            customer_id: row.customer_id,
            payment_id: row.payment_id,
            amount: row.amount,
            reason: from_db(row.reason)?,
            status: from_db(row.status)?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PayoutRow {
    id: Uuid,
    booking_id: Uuid,
    technician_id: Uuid,
    amount: i64,
    status: String,
    created_at: DateTime<Utc>,
}

const FAILED_OP_COLUMNS: &str =
    "id, payment_id, booking_id, failed_step, error, retry_count, status, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct FailedOpRow {
    id: Uuid,
    payment_id: Uuid,
    booking_id: Option<Uuid>,
    failed_step: String,
    error: String,
    retry_count: i32,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<FailedOpRow> for FailedPaymentOperation {
    type Error = EngineError;

    fn try_from(row: FailedOpRow) -> EngineResult<Self> {
        Ok(FailedPaymentOperation {
            id: row.id,
            payment_id: row.payment_id,
            booking_id: row.booking_id,
            failed_step: from_db(row.failed_step)?,
            error: row.error,
            retry_count: row.retry_count,
            status: from_db(row.status)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

async fn insert_refund_tx(conn: &mut sqlx::PgConnection, refund: &Refund) -> EngineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO refunds (id, booking_id, customer_id, payment_id, amount, reason, status, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(refund.id)
    .bind(refund.booking_id)
    .bind(refund.customer_id)
    .bind(refund.payment_id)
    .bind(refund.amount)
    .bind(to_db(&refund.reason))
    .bind(to_db(&refund.status))
    .bind(refund.created_at)
    .execute(conn)
    .await
    .map_err(db)?;
    Ok(())
}

async fn insert_payout_tx(conn: &mut sqlx::PgConnection, payout: &AdminPayout) -> EngineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO admin_payouts (id, booking_id, technician_id, amount, status, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(payout.id)
    .bind(payout.booking_id)
    .bind(payout.technician_id)
    .bind(payout.amount)
    .bind(to_db(&payout.status))
    .bind(payout.created_at)
    .execute(conn)
    .await
    .map_err(db)?;
    Ok(())
}

async fn insert_coin_usage_tx(conn: &mut sqlx::PgConnection, usage: &CoinUsage) -> EngineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO coin_usages (id, booking_id, technician_id, amount, reason, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(usage.id)
    .bind(usage.booking_id)
    .bind(usage.technician_id)
    .bind(usage.amount)
    .bind(usage.reason.as_str())
    .bind(usage.created_at)
    .execute(conn)
    .await
    .map_err(db)?;
    Ok(())
}

async fn lock_booking(conn: &mut sqlx::PgConnection, booking_id: Uuid) -> EngineResult<Booking> {
    let row: Option<BookingRow> =
        sqlx::query_as(&format!("SELECT {} FROM bookings WHERE id = $1 FOR UPDATE", BOOKING_COLUMNS))
            .bind(booking_id)
            .fetch_optional(conn)
            .await
            .map_err(db)?;
    row.ok_or(EngineError::BookingNotFound(booking_id))?.try_into()
}

/// Persist the mutable booking columns, but only if the row is still in
/// `expected` status.
async fn write_booking_guarded(
    conn: &mut sqlx::PgConnection,
    booking: &Booking,
    expected: BookingStatus,
) -> EngineResult<()> {
    let updated = sqlx::query(
        r#"
        UPDATE bookings
        SET status = $1, technician_id = $2, arrival_verified = $3, completed_at = $4, updated_at = $5
        WHERE id = $6 AND status = $7
        "#,
    )
    .bind(booking.status.as_str())
    .bind(booking.technician_id)
    .bind(booking.arrival_verified)
    .bind(booking.completed_at)
    .bind(booking.updated_at)
    .bind(booking.id)
    .bind(expected.as_str())
    .execute(conn)
    .await
    .map_err(db)?
    .rows_affected();

    if updated == 0 {
        return Err(EngineError::BookingNotPending {
            booking_id: booking.id,
            status: booking.status,
        });
    }
    Ok(())
}

#[async_trait]
impl BookingRepository for PgStore {
    async fn get_booking(&self, id: Uuid) -> EngineResult<Option<Booking>> {
        let row: Option<BookingRow> =
            sqlx::query_as(&format!("SELECT {} FROM bookings WHERE id = $1", BOOKING_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db)?;
        row.map(Booking::try_from).transpose()
    }

    async fn list_stale_pending(&self, created_before: DateTime<Utc>, limit: i64) -> EngineResult<Vec<Booking>> {
        let rows: Vec<BookingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM bookings WHERE status = 'PENDING' AND created_at <= $1 ORDER BY created_at LIMIT $2",
            BOOKING_COLUMNS
        ))
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.into_iter().map(Booking::try_from).collect()
    }

    async fn record_candidates(&self, booking_id: Uuid, technician_ids: &[Uuid]) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO booking_candidates (booking_id, technician_id)
            SELECT $1, UNNEST($2::uuid[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(booking_id)
        .bind(technician_ids)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn candidates(&self, booking_id: Uuid) -> EngineResult<Vec<Uuid>> {
        sqlx::query_scalar("SELECT technician_id FROM booking_candidates WHERE booking_id = $1")
            .bind(booking_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db)
    }

    async fn accept_booking(&self, booking_id: Uuid, technician_id: Uuid, now: DateTime<Utc>) -> EngineResult<Acceptance> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let mut booking = lock_booking(&mut tx, booking_id).await?;
        booking.confirm(technician_id, now)?;

        let claimed = sqlx::query(
            r#"
            UPDATE bookings SET status = $1, technician_id = $2, updated_at = $3
            WHERE id = $4 AND status = 'PENDING' AND technician_id IS NULL
            "#,
        )
        .bind(booking.status.as_str())
        .bind(technician_id)
        .bind(now)
        .bind(booking_id)
        .execute(&mut *tx)
        .await
        .map_err(db)?
        .rows_affected();

        if claimed == 0 {
            return Err(EngineError::BookingAlreadyAssigned(booking_id));
        }

        // Conditional debit; a failed debit rolls the claim back with the transaction
        let debited: Option<(i64, String)> = sqlx::query_as(
            "UPDATE technicians SET coins = coins - $1 WHERE id = $2 AND coins >= $1 RETURNING coins, name",
        )
        .bind(booking.coin_cost)
        .bind(technician_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?;

        let (balance, technician_name) = match debited {
            Some(found) => found,
            None => {
                let available: Option<i64> = sqlx::query_scalar("SELECT coins FROM technicians WHERE id = $1")
                    .bind(technician_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db)?;
                return Err(match available {
                    Some(available) => EngineError::InsufficientCoins {
                        technician_id,
                        required: booking.coin_cost,
                        available,
                    },
                    None => EngineError::TechnicianNotFound(technician_id),
                });
            }
        };

        let usage = CoinUsage::acceptance(&booking, technician_id, now);
        insert_coin_usage_tx(&mut tx, &usage).await?;

        tx.commit().await.map_err(db)?;

        Ok(Acceptance { booking, balance, usage, technician_name })
    }

    async fn cancel_booking(
        &self,
        booking_id: Uuid,
        cancellation: Cancellation,
        now: DateTime<Utc>,
    ) -> EngineResult<(Booking, Refund)> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let mut booking = lock_booking(&mut tx, booking_id).await?;
        let refund = cancellation.apply(&mut booking, now)?;
        write_booking_guarded(&mut tx, &booking, BookingStatus::Pending).await?;
        insert_refund_tx(&mut tx, &refund).await?;

        tx.commit().await.map_err(db)?;
        Ok((booking, refund))
    }

    async fn reject_booking(&self, booking_id: Uuid, by: RejectedBy, now: DateTime<Utc>) -> EngineResult<Rejection> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let mut booking = lock_booking(&mut tx, booking_id).await?;
        let previous = booking.status;
        let (refund, reversed) = by.apply(&mut booking, now)?;
        write_booking_guarded(&mut tx, &booking, previous).await?;

        let reversal = match reversed {
            Some(technician_id) if booking.coin_cost > 0 => {
                let usage = CoinUsage::reversal(&booking, technician_id, now);
                sqlx::query("UPDATE technicians SET coins = coins + $1 WHERE id = $2")
                    .bind(usage.amount)
                    .bind(technician_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db)?;
                insert_coin_usage_tx(&mut tx, &usage).await?;
                Some(usage)
            }
            _ => None,
        };
        insert_refund_tx(&mut tx, &refund).await?;

        tx.commit().await.map_err(db)?;
        Ok(Rejection { booking, refund, reversal })
    }
}

#[async_trait]
impl OtpRepository for PgStore {
    async fn issue_otp(&self, record: &OtpRecord) -> EngineResult<()> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        // Serialises concurrent issues for the same booking
        lock_booking(&mut tx, record.booking_id).await?;

        sqlx::query("UPDATE otps SET is_used = TRUE WHERE booking_id = $1 AND purpose = $2 AND NOT is_used")
            .bind(record.booking_id)
            .bind(record.purpose.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db)?;

        sqlx::query(
            r#"
            INSERT INTO otps (id, booking_id, technician_id, customer_id, code, purpose, expires_at, is_used, failed_attempts, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(record.booking_id)
        .bind(record.technician_id)
        .bind(record.customer_id)
        .bind(&record.code)
        .bind(record.purpose.as_str())
        .bind(record.expires_at)
        .bind(record.is_used)
        .bind(record.failed_attempts)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        tx.commit().await.map_err(db)?;
        Ok(())
    }

    async fn verify_otp(
        &self,
        booking_id: Uuid,
        purpose: OtpPurpose,
        code: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Booking> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let mut booking = lock_booking(&mut tx, booking_id).await?;
        let previous = booking.status;

        let row: Option<OtpRow> = sqlx::query_as(&format!(
            "SELECT {} FROM otps WHERE booking_id = $1 AND purpose = $2 AND NOT is_used \
             ORDER BY created_at DESC LIMIT 1 FOR UPDATE",
            OTP_COLUMNS
        ))
        .bind(booking_id)
        .bind(purpose.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?;
        let mut record = row.map(OtpRecord::try_from).transpose()?;

        let outcome = otp::verify_and_apply(record.as_mut(), &mut booking, code, now);

        if let Some(record) = &record {
            sqlx::query("UPDATE otps SET is_used = $1, failed_attempts = $2 WHERE id = $3")
                .bind(record.is_used)
                .bind(record.failed_attempts)
                .bind(record.id)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
        }

        let payout = match outcome {
            Ok(payout) => payout,
            Err(e) => {
                // Keep the miss count, nothing else changed
                tx.commit().await.map_err(db)?;
                return Err(e);
            }
        };

        write_booking_guarded(&mut tx, &booking, previous).await?;
        if let Some(payout) = &payout {
            insert_payout_tx(&mut tx, payout).await?;
        }

        tx.commit().await.map_err(db)?;
        Ok(booking)
    }
}

#[async_trait]
impl TechnicianRepository for PgStore {
    async fn upsert_technician(&self, technician: &Technician) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO technicians (id, name, sub_category_ids, active, approved, latitude, longitude, coins, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                sub_category_ids = EXCLUDED.sub_category_ids,
                active = EXCLUDED.active,
                approved = EXCLUDED.approved,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude
            "#,
        )
        .bind(technician.id)
        .bind(&technician.name)
        .bind(&technician.sub_category_ids)
        .bind(technician.active)
        .bind(technician.approved)
        .bind(technician.location.map(|p| p.latitude))
        .bind(technician.location.map(|p| p.longitude))
        .bind(technician.coins)
        .bind(technician.created_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn get_technician(&self, id: Uuid) -> EngineResult<Option<Technician>> {
        let row: Option<TechnicianRow> =
            sqlx::query_as(&format!("SELECT {} FROM technicians WHERE id = $1", TECHNICIAN_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db)?;
        Ok(row.map(Technician::from))
    }

    async fn technicians_for(&self, sub_category_id: Uuid) -> EngineResult<Vec<Technician>> {
        let rows: Vec<TechnicianRow> = sqlx::query_as(&format!(
            "SELECT {} FROM technicians WHERE $1 = ANY(sub_category_ids) AND active AND approved ORDER BY created_at",
            TECHNICIAN_COLUMNS
        ))
        .bind(sub_category_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(rows.into_iter().map(Technician::from).collect())
    }

    async fn top_up_coins(&self, technician_id: Uuid, amount: i64, now: DateTime<Utc>) -> EngineResult<(i64, CoinUsage)> {
        if amount <= 0 {
            return Err(EngineError::ValidationError("credit amount must be positive".into()));
        }

        let mut tx = self.pool.begin().await.map_err(db)?;

        let balance: Option<i64> =
            sqlx::query_scalar("UPDATE technicians SET coins = coins + $1 WHERE id = $2 RETURNING coins")
                .bind(amount)
                .bind(technician_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db)?;
        let balance = balance.ok_or(EngineError::TechnicianNotFound(technician_id))?;

        let usage = CoinUsage::top_up(technician_id, amount, now);
        insert_coin_usage_tx(&mut tx, &usage).await?;

        tx.commit().await.map_err(db)?;
        Ok((balance, usage))
    }

    async fn coin_usages(&self, technician_id: Uuid) -> EngineResult<Vec<CoinUsage>> {
        let rows: Vec<CoinUsageRow> = sqlx::query_as(
            "SELECT id, booking_id, technician_id, amount, reason, created_at FROM coin_usages \
             WHERE technician_id = $1 ORDER BY created_at",
        )
        .bind(technician_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.into_iter().map(CoinUsage::try_from).collect()
    }
}

#[async_trait]
impl PaymentRepository for PgStore {
    async fn insert_payment(&self, payment: &Payment) -> EngineResult<()> {
        sqlx::query(&format!(
            "INSERT INTO payments ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
            PAYMENT_COLUMNS
        ))
        .bind(payment.id)
        .bind(payment.customer_id)
        .bind(payment.sub_category_id)
        .bind(payment.date)
        .bind(payment.time_slot.to_string())
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.location.map(|p| p.latitude))
        .bind(payment.location.map(|p| p.longitude))
        .bind(payment.preferred_technician_id)
        .bind(&payment.gateway_order_id)
        .bind(&payment.gateway_payment_id)
        .bind(to_db(&payment.status))
        .bind(payment.booking_id)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn get_payment(&self, id: Uuid) -> EngineResult<Option<Payment>> {
        let row: Option<PaymentRow> =
            sqlx::query_as(&format!("SELECT {} FROM payments WHERE id = $1", PAYMENT_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db)?;
        row.map(Payment::try_from).transpose()
    }

    async fn authorize_payment(&self, payment: &Payment) -> EngineResult<Payment> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            r#"
            UPDATE payments
            SET status = $1, gateway_payment_id = $2, latitude = $3, longitude = $4,
                preferred_technician_id = $5, updated_at = $6
            WHERE id = $7 AND status = $8
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(to_db(&PaymentStatus::Authorized))
        .bind(&payment.gateway_payment_id)
        .bind(payment.location.map(|p| p.latitude))
        .bind(payment.location.map(|p| p.longitude))
        .bind(payment.preferred_technician_id)
        .bind(payment.updated_at)
        .bind(payment.id)
        .bind(to_db(&PaymentStatus::Created))
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        if let Some(row) = row {
            return row.try_into();
        }

        // Lost the race or already settled
        let stored = self
            .get_payment(payment.id)
            .await?
            .ok_or(EngineError::PaymentNotFound(payment.id))?;
        match stored.status {
            PaymentStatus::Authorized => Ok(stored),
            other => Err(EngineError::ValidationError(format!("payment is {:?}", other))),
        }
    }

    async fn fail_payment(&self, payment_id: Uuid, now: DateTime<Utc>) -> EngineResult<()> {
        sqlx::query("UPDATE payments SET status = $1, updated_at = $2 WHERE id = $3 AND status = $4")
            .bind(to_db(&PaymentStatus::Failed))
            .bind(now)
            .bind(payment_id)
            .bind(to_db(&PaymentStatus::Created))
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn refund_unbound_payment(&self, payment_id: Uuid, now: DateTime<Utc>) -> EngineResult<Option<Refund>> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            r#"
            UPDATE payments SET status = $1, updated_at = $2
            WHERE id = $3 AND status = $4 AND booking_id IS NULL
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(to_db(&PaymentStatus::Refunded))
        .bind(now)
        .bind(payment_id)
        .bind(to_db(&PaymentStatus::Authorized))
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let payment = Payment::try_from(row)?;

        let refund = Refund::for_payment(&payment, now);
        insert_refund_tx(&mut tx, &refund).await?;

        tx.commit().await.map_err(db)?;
        Ok(Some(refund))
    }

    async fn create_booking_for_payment(&self, booking: &Booking) -> EngineResult<()> {
        let payment_id = booking
            .payment_id
            .ok_or_else(|| EngineError::ValidationError("booking has no payment".into()))?;

        let mut tx = self.pool.begin().await.map_err(db)?;

        let bound = sqlx::query(
            r#"
            UPDATE payments SET booking_id = $1, updated_at = $2
            WHERE id = $3 AND status = $4 AND booking_id IS NULL
            "#,
        )
        .bind(booking.id)
        .bind(booking.created_at)
        .bind(payment_id)
        .bind(to_db(&PaymentStatus::Authorized))
        .execute(&mut *tx)
        .await
        .map_err(db)?
        .rows_affected();

        if bound == 0 {
            let existing: Option<(String, Option<Uuid>)> =
                sqlx::query_as("SELECT status, booking_id FROM payments WHERE id = $1")
                    .bind(payment_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db)?;
            return Err(match existing {
                None => EngineError::PaymentNotFound(payment_id),
                Some((_, Some(existing))) => {
                    EngineError::ValidationError(format!("payment already used for booking {}", existing))
                }
                Some(_) => EngineError::ValidationError("payment is not authorized".into()),
            });
        }

        sqlx::query(&format!(
            "INSERT INTO bookings ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
            BOOKING_COLUMNS
        ))
        .bind(booking.id)
        .bind(booking.customer_id)
        .bind(booking.technician_id)
        .bind(booking.preferred_technician_id)
        .bind(booking.sub_category_id)
        .bind(booking.payment_id)
        .bind(booking.date)
        .bind(booking.time_slot.to_string())
        .bind(booking.location.map(|p| p.latitude))
        .bind(booking.location.map(|p| p.longitude))
        .bind(booking.amount)
        .bind(booking.coin_cost)
        .bind(booking.status.as_str())
        .bind(booking.arrival_verified)
        .bind(booking.completed_at)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        tx.commit().await.map_err(db)?;
        Ok(())
    }

    async fn refunds_for_booking(&self, booking_id: Uuid) -> EngineResult<Vec<Refund>> {
        let rows: Vec<RefundRow> = sqlx::query_as(
            "SELECT id, booking_id, customer_id, payment_id, amount, reason, status, created_at \
             FROM refunds WHERE booking_id = $1 ORDER BY created_at",
        )
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.into_iter().map(Refund::try_from).collect()
    }

    async fn payouts_for_booking(&self, booking_id: Uuid) -> EngineResult<Vec<AdminPayout>> {
        let rows: Vec<PayoutRow> = sqlx::query_as(
            "SELECT id, booking_id, technician_id, amount, status, created_at \
             FROM admin_payouts WHERE booking_id = $1 ORDER BY created_at",
        )
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        rows.into_iter()
            .map(|row| {
                Ok(AdminPayout {
                    id: row.id,
                    booking_id: row.booking_id,
                    technician_id: row.technician_id,
                    amount: row.amount,
                    status: from_db(row.status)?,
                    created_at: row.created_at,
                })
            })
            .collect()
    }

    async fn insert_failed_operation(&self, op: &FailedPaymentOperation) -> EngineResult<()> {
        sqlx::query(&format!(
            "INSERT INTO failed_payment_operations ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            FAILED_OP_COLUMNS
        ))
        .bind(op.id)
        .bind(op.payment_id)
        .bind(op.booking_id)
        .bind(to_db(&op.failed_step))
        .bind(&op.error)
        .bind(op.retry_count)
        .bind(to_db(&op.status))
        .bind(op.created_at)
        .bind(op.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn claim_failed_operations(&self, limit: i64, now: DateTime<Utc>) -> EngineResult<Vec<FailedPaymentOperation>> {
        let rows: Vec<FailedOpRow> = sqlx::query_as(&format!(
            r#"
            UPDATE failed_payment_operations SET status = 'RETRYING', updated_at = $1
            WHERE id IN (
                SELECT id FROM failed_payment_operations
                WHERE status = 'PENDING'
                ORDER BY created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            FAILED_OP_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.into_iter().map(FailedPaymentOperation::try_from).collect()
    }

    async fn update_failed_operation(&self, op: &FailedPaymentOperation) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE failed_payment_operations
            SET booking_id = $1, error = $2, retry_count = $3, status = $4, updated_at = $5
            WHERE id = $6
            "#,
        )
        .bind(op.booking_id)
        .bind(&op.error)
        .bind(op.retry_count)
        .bind(to_db(&op.status))
        .bind(op.updated_at)
        .bind(op.id)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn failed_operations_for_payment(&self, payment_id: Uuid) -> EngineResult<Vec<FailedPaymentOperation>> {
        let rows: Vec<FailedOpRow> = sqlx::query_as(&format!(
            "SELECT {} FROM failed_payment_operations WHERE payment_id = $1 ORDER BY created_at",
            FAILED_OP_COLUMNS
        ))
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.into_iter().map(FailedPaymentOperation::try_from).collect()
    }
}

#[async_trait]
impl CatalogRepository for PgStore {
    async fn upsert_offering(&self, offering: &ServiceOffering) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO service_offerings (id, name, price, coin_cost) VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, price = EXCLUDED.price, coin_cost = EXCLUDED.coin_cost
            "#,
        )
        .bind(offering.id)
        .bind(&offering.name)
        .bind(offering.price)
        .bind(offering.coin_cost)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn get_offering(&self, id: Uuid) -> EngineResult<Option<ServiceOffering>> {
        let row: Option<(Uuid, String, i64, i64)> =
            sqlx::query_as("SELECT id, name, price, coin_cost FROM service_offerings WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db)?;
        Ok(row.map(|(id, name, price, coin_cost)| ServiceOffering { id, name, price, coin_cost }))
    }
}
