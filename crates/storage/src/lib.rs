pub mod error;
pub mod writer;

pub use error::StorageError;
pub use writer::PgWriter;
