//! # Booster Module
//!
//! Campaign ("booster") and worker ("puppet") lifecycles, the registries that
//! track what is live, and the salvage sweep that reconciles what is not.

pub mod behavior;
pub mod campaign;
pub mod holders;
pub mod policy;
pub mod puppet;
pub mod registry;
pub mod runtime;
pub mod salvage;
pub mod store;
pub mod types;

pub use campaign::{Booster, BoosterView};
pub use runtime::{BoosterRuntime, RuntimeParams};
pub use types::{BoosterKind, Settings, StartRejection, WithdrawRejection};
