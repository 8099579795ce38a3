//! Database access for the scan service
//!
//! Schema and reference seeding live in `twinforge_common::db`; this module
//! holds the queries the scan endpoints run.

pub mod archetypes;
pub mod profiles;
pub mod scans;
pub mod settings;

pub use archetypes::ArchetypeRepository;
