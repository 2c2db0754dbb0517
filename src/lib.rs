pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod credentials;
pub mod format;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod tools;
