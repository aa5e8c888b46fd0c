//! Concurrent proxy tester. Each candidate config gets its own xray
//! child process on a leased loopback port; a canonical HTTP request
//! through that inbound classifies the node.

pub mod admission;
pub mod batch;
pub mod config;
pub mod links;
pub mod metrics;
pub mod ports;
pub mod probe;
pub mod proxy;
pub mod shutdown;
pub mod tester;
pub mod worker;
pub mod xray;
