pub mod cli;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod json;
pub mod kv;
pub mod models;
pub mod openapi;
pub mod remote;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;
pub mod vault;

#[cfg(test)]
pub mod test_support;
