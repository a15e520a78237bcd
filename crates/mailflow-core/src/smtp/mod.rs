//! SMTP front-end
//!
//! A minimal line-based SMTP receiver: it accepts messages over the wire
//! and hands them to the processing pipeline at the root stage. Protocol
//! extras (TLS, AUTH, extensions beyond the basics) are intentionally not
//! part of this front-end.

pub mod handler;
pub mod server;

pub use handler::SmtpHandler;
pub use server::SmtpServer;
