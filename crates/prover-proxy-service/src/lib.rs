#[macro_use]
pub mod metrics;

pub mod backend;
pub mod caching;
pub mod config;
pub mod instance;
pub mod logging;
pub mod services;
pub mod types;
pub mod utils;
