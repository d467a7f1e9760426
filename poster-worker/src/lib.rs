pub mod api;
pub mod cache;
pub mod config;
pub mod decoder;
pub mod delivery;
pub mod error;
pub mod handler;
pub mod router;
pub mod schema;
pub mod token;
