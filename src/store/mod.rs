//! Message Store
//!
//! Read-only access to the external message database plus the decoder for
//! its binary body blobs and fixed-epoch timestamps.

pub mod db;
pub mod decode;

pub use db::{Message, MessageStore};
