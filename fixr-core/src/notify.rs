use async_trait::async_trait;
use fixr_shared::{BookingEvent, Recipient};

use crate::otp::OtpRecord;

/// Fire-and-forget push of booking events. Implementations must not block
/// and must not fail the caller; delivery is best-effort.
pub trait Notifier: Send + Sync {
    fn publish(&self, recipient: Recipient, event: BookingEvent);
}

/// Hands a freshly issued code to whatever channel reaches the customer.
#[async_trait]
pub trait OtpDelivery: Send + Sync {
    async fn deliver(&self, record: &OtpRecord) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}
