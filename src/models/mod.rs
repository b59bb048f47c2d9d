pub mod circuit_breaker;
pub mod event;
pub mod health;
pub mod retry;
pub mod rule;
pub mod status;
