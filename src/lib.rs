pub mod ancillary;
pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod kv;
pub mod migrations;
pub mod normalize;
pub mod outbound;
pub mod row_ops;
pub mod schema_registry;
pub mod service;
pub mod stats;

