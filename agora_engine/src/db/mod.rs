mod errors;
mod public_data;
pub mod sqlite;

pub use errors::StoreError;
pub use public_data::PublicData;
pub use sqlite::{Savepoint, SqliteDatabase, StoreTx};
