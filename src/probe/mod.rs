//! Periodic provider probing.
//!
//! Two independent loops: the health prober (opt-in) actively tests route
//! reachability and flips enable/disable status; the balance prober (always
//! on) refreshes each route's remaining credit. Both write through the
//! route store; neither blocks the other.

pub mod balance;
pub mod health;

pub use self::balance::BalanceProber;
pub use self::health::HealthProber;
