//! # Shell Module
//!
//! Entry point and CLI logic for the `xcbridge` diagnostic binary.

pub mod cli;

pub use cli::{Cli, Command, run};
