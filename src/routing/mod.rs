pub mod index;
pub mod price;
pub mod ranker;

pub use index::CapabilityIndex;
pub use price::{calculate_price_efficiency, MarketData, PriceRouter};
pub use ranker::CapabilityRanker;
