//! Glint CLI - Command-line interface for the glint migration engine.
//!
//! This crate provides the `glint` binary: migrating MongoDB collections into
//! PostgreSQL, backing up, rolling back and recovering failed migrations.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod output;
