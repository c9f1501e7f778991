//! Database schema, initialization and schema-driven record writing

pub mod column_map;
pub mod init;
pub mod records;
pub mod schema_sync;

pub use column_map::*;
pub use init::*;
pub use records::*;
pub use schema_sync::*;
