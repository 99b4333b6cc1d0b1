pub mod acceptance;
pub mod actor;
pub mod coordinator;
pub mod dispatch;
pub mod engine;
pub mod gateway;
pub mod otp;
pub mod rules;
pub mod watchdog;

pub use actor::Actor;
pub use coordinator::{CreateBooking, CreateOrder, PaymentOrder, RetryReport, VerifyPayment};
pub use engine::BookingEngine;
pub use gateway::SandboxGateway;
pub use otp::LoggingOtpDelivery;
pub use rules::EngineRules;
