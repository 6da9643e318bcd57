pub mod auth;
pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod telemetry;
pub mod tokenizer;
pub mod tools;
pub mod upstream;
