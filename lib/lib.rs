//! Settlement engine for fair-launch token sales.
//!
//! Derives the clearing median from the bid histogram, draws the lottery
//! into the persisted winner bitmap, and cranks every ticket to a terminal
//! state.

pub mod config;
pub mod fetch;
pub mod ledger;
pub mod math;
pub mod settlement;
pub mod types;
pub mod util;

pub use config::SettlementConfig;
pub use settlement::{Error, Settler};
