pub mod builtin;
pub mod loader;
pub mod sandbox;
pub mod worker;

pub use loader::StrategyLoader;
pub use sandbox::{validate_strategy, validate_strategy_static, SandboxResult};
pub use worker::WorkerStrategy;
