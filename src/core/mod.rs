//! Core modules shared by the delegation engine: errors, configuration,
//! SQLite access (pool + broker), schema and time helpers.

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod pool;
pub mod schemas;
pub mod store;
pub mod time;
