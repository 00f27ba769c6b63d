pub mod api;
pub mod client;
pub mod cluster;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod network;
pub mod noise;
pub mod operations;
pub mod protocols;
pub mod provider;
pub mod service;
pub mod session;
pub mod state;
pub mod validation;
pub mod verification;
