pub mod events;

pub use events::{BookingEvent, Envelope, Recipient};
