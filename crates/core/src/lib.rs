//! authkeeper-core — domain model and business logic for the authkeeper
//! two-factor account manager.
//!
//! This crate contains the account model, TOTP derivation, the cloud
//! reconciliation (merge) engine and the sync orchestrator. Storage and
//! network gateways live in sibling crates and plug in through the traits
//! defined here.

pub mod accounts;
pub mod errors;
pub mod sync;
pub mod totp;

pub use errors::{Error, Result};
