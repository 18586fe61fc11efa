//! Database queries

pub mod connection;
pub mod ticket;
