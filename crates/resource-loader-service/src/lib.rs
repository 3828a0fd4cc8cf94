#[macro_use]
pub mod metrics;

pub mod auth;
pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod experiment;
pub mod fetch;
pub mod loader;
pub mod logging;
pub mod memory;
pub mod network;
pub mod priority;
pub mod retry;
pub mod storage;
pub mod strategy;
pub mod telemetry;
pub mod types;
pub mod utils;
