pub mod aggregator;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod history;
pub mod hot;
pub mod hub;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod registry;
pub mod rest;
pub mod router;
pub mod validate;
pub mod ws;
