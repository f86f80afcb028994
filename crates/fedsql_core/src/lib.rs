//! Request execution engine for federated queries.
//!
//! Requests are planned against a virtual database, executed as work items
//! that pull rows from connectors, and buffered for clients to page through.

pub mod arrays;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod dqp;
pub mod engine;
pub mod metadata;
pub mod processor;
pub mod request;
pub mod runtime;
pub mod transaction;

#[cfg(test)]
mod testutil;
