// src/config/mod.rs

//! Configuration loading and validation for cmddispatch.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate basic invariants like attempt counts and progress patterns
//!   (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{
    CommandConfig, ConfigFile, DispatcherSection, PolicyOverride, PolicySection,
    PolicySettings, RawConfigFile,
};
