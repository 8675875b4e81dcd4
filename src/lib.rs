pub mod attachment;
pub mod bus;
pub mod chat;
pub mod client;
pub mod config;
pub mod entity;
pub mod error;
pub mod http;
pub mod registry;
pub mod store;
