pub mod engine;

pub use engine::{Backtester, BacktestResult, CandleData};
