pub mod adapter;
pub mod circuit_breaker;
pub mod console;
pub mod database;
pub mod health;
pub mod memory;
pub mod provider;
pub mod redis;
pub mod webhook;
