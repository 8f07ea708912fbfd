// Library root: domain model, result rules, configuration and the shared
// push connection. Re-exports modules for the api/app crates and tests.

pub mod bracket;
pub mod config;
pub mod connection;
pub mod edit;
pub mod model;
pub mod push;
pub mod score;
