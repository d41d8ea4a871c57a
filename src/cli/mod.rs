//! CLI module for scryer - command-line interface and subcommands.

pub mod commands;

pub use commands::Cli;
