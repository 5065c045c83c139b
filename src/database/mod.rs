//! # Database Module
//!
//! PostgreSQL persistence through tokio-postgres and deadpool: connection
//! management, row models, refinery migrations and the `BoosterStore` impl.

pub mod connection;
pub mod migrations;
pub mod models;
pub mod store;

pub use connection::{DatabaseConfig, DatabaseConnection};
