pub mod readonly;
pub mod rows;
pub mod schema;
pub mod store;

pub use readonly::ReadOnlyStore;
pub use rows::{JsonRow, RowExt};
pub use store::Store;
