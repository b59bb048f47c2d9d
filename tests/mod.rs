mod common;

mod config_tests;
mod e2e_tests;
mod retry_tests;
