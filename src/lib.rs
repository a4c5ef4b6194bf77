pub mod api;
pub mod bridge;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod mqtt;
pub mod registry;
pub mod relay;
pub mod store;
pub mod thermowatt;
