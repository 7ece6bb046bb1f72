pub mod adapters;
pub mod config;
pub mod http;
pub mod metrics;
pub mod models;
pub mod params;
pub mod rate_limit;
pub mod registry;
