pub mod cache;
pub mod config;
pub mod cron_jobs;
pub mod cron_registry;
pub mod database;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod models;
pub mod module;
pub mod pipeline;
pub mod routes;
pub mod scheduler;
pub mod ssh;
pub mod store;
