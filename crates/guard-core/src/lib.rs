//! Core of the group guard bot.
//!
//! This crate is framework-agnostic. Telegram, URL unshortening and OS-process workers
//! live behind ports (traits) implemented in adapter crates.

pub mod config;
pub mod db_hook;
pub mod domain;
pub mod errors;
pub mod event;
pub mod logging;
pub mod messaging;
pub mod moderation;
pub mod ratelimit;
pub mod report;
pub mod saver;
pub mod security;
pub mod supervisor;
pub mod worker;

#[cfg(test)]
mod testing;

pub use errors::{Error, Result};
