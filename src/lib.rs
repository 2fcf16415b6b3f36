pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod planner;
pub mod providers;
pub mod registry;
pub mod reputation;
pub mod resilience;
pub mod routing;
pub mod storage;
pub mod types;

pub use config::Config;
pub use types::*;
