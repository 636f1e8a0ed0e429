pub mod core;
pub mod exchange;
pub mod notification;
pub mod observability;
pub mod persistence;
