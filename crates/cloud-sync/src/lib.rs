//! Gateway to the identity server that hosts the synchronized account list.

pub mod client;
pub mod error;

pub use client::{CloudSyncClient, UserInfo};
pub use error::{CloudSyncError, Result};
