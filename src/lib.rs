pub mod api;
pub mod cache;
pub mod clients;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod egress;
pub mod error;
pub mod metrics;
pub mod models;
pub mod signing;
pub mod store;
pub mod utils;
