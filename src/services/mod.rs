//! # Services Module
//!
//! External collaborators of the booster core: ledger client, Jupiter swap
//! engine, Jito bundle submitter, tip-floor daemon, SOL price feed and the
//! owner notification outbox.

pub mod bundler;
pub mod ledger;
pub mod notifier;
pub mod price_feed;
pub mod swap_engine;
pub mod tip_feed;
