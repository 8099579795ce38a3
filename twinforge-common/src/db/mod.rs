//! Database schema, initialization and reference data

pub mod init;
pub mod seed;

pub use init::*;
pub use seed::*;
