//! Core types shared by the QueueStack crates
//!
//! Error codes and their wire renderings, plus account/region scoping.

pub mod account;
pub mod error;

pub use account::{AccountRegionKey, Arn};
pub use error::{AwsError, ErrorCode};
