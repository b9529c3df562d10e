//! Utility functions and helpers.
//!
//! Environment variable handling shared by the config and proxy modules.

pub mod env;

pub use env::{get_env_list, get_env_with_prefix};
