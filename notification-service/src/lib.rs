pub mod api;
pub mod clients;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod models;
pub mod policy;
pub mod tracker;
pub mod utils;
pub mod worker;
