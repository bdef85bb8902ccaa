pub mod api;
pub mod backtester;
pub mod capabilities;
pub mod config;
pub mod context;
pub mod database;
pub mod errors;
pub mod filters;
pub mod job_status;
pub mod ledger;
pub mod models;
pub mod repository;
mod retry;
pub mod sandbox;
pub mod scheduler;
pub mod store;
