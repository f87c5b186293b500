pub mod database;
pub mod error;
pub mod schema;
pub mod session_store;

pub use database::Database;
pub use error::StoreError;
pub use session_store::{SavedSession, SessionStore};
