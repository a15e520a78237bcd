//! Mailflow Storage - file storage for delivered mail
//!
//! Local delivery and archival mailets write raw messages through the
//! [`file::FileStorage`] abstraction; the rest of the system never touches
//! the filesystem directly.

pub mod file;

pub use file::{FileStorage, LocalStorage, MessageStore};
