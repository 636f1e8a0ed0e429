pub mod fills;
pub mod portfolio;

pub use portfolio::{PortfolioTracker, Position, SlTpTrigger, TradeResult};
