pub mod aggregator;
pub mod blob;
pub mod bus;
pub mod config;
pub mod crawler;
pub mod health;
pub mod index;
pub mod indexer;
pub mod master;
pub mod models;
