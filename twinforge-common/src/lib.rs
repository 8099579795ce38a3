//! # TwinForge Common Library
//!
//! Shared code for the TwinForge scan services including:
//! - Database initialization, schema and reference seed data
//! - Morph vocabulary and core data model (vectors, bounds, envelopes)
//! - Configuration loading
//! - Common error type

pub mod config;
pub mod db;
pub mod error;
pub mod morph;

pub use error::{Error, Result};
pub use morph::{BoundsRange, Gender, LimbMassVector, MorphVector};
