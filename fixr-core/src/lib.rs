pub mod booking;
pub mod clock;
pub mod error;
pub mod geo;
pub mod ledger;
pub mod notify;
pub mod otp;
pub mod payment;
pub mod repository;
pub mod time_slot;

pub use booking::{Booking, BookingStatus, NewBooking, ServiceOffering};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{EngineError, EngineResult};
pub use geo::GeoPoint;
pub use ledger::{Acceptance, CoinReason, CoinUsage, Technician};
pub use notify::{Notifier, OtpDelivery};
pub use otp::{OtpPurpose, OtpRecord};
pub use payment::{
    AdminPayout, FailedOperationStatus, FailedPaymentOperation, FailedStep, GatewayOrder,
    Payment, PaymentAuthorization, PaymentGateway, PaymentStatus, PayoutStatus, Refund,
    RefundReason, RefundStatus,
};
pub use repository::Store;
pub use time_slot::TimeSlot;
