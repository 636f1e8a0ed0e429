pub mod telegram;

pub use telegram::Notifier;
