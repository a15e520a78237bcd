//! Mailflow Core - protocol front-end and delivery
//!
//! The SMTP listener accepts messages over the wire and submits them to
//! the processing pipeline; the delivery mailets take messages back out of
//! the pipeline into local storage.

pub mod delivery;
pub mod smtp;

pub use delivery::{LocalDelivery, ToRepository};
pub use smtp::{SmtpHandler, SmtpServer};
