// IO contract between the shell and strategy/analysis modules
pub mod contract;

// Domain-specific error types
pub mod errors;

// Market data primitives (candles, timeframes)
pub mod market;

// Port interfaces
pub mod ports;

// Timestamp conventions
pub mod time;
