// # Routes Module
//
// HTTP route handlers for the booster server, grouped by API domain.
// Each module exposes `create_routes()`, merged in `server.rs`.

/// Liveness and readiness endpoints
pub mod health;

/// Start, inspect and stop boosters
pub mod boosters;

/// Owner wallets, settings and notifications
pub mod owners;

pub mod error;
