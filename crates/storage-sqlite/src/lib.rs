//! SQLite persistence for account records: schema, migrations, the
//! single-writer actor and the account repository.

pub mod accounts;
pub mod db;
pub mod errors;
pub mod schema;

pub use accounts::AccountRepository;
pub use db::{create_pool, get_connection, init, run_migrations, DbPool, WriteHandle};
pub use errors::StorageError;
