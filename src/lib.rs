pub mod bus;
pub mod chat;
pub mod client;
pub mod config;
pub mod entity;
pub mod http;
pub mod interface;
pub mod relay;
pub mod session;
pub mod store;
pub mod webhook;
