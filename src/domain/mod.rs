//! Domain module
//!
//! Core domain types: money, events, commands and business-rule errors.

pub mod commands;
pub mod error;
pub mod events;
pub mod money;

pub use commands::AccountCommand;
pub use error::DomainError;
pub use events::{AccountEvent, AccountType, EventEnvelope, now_millis, ACCOUNT_AGGREGATE};
pub use money::{Amount, AmountError, Balance};
