//! Library crate for port-audit-rs: concurrent TCP port probing and classification.
pub mod banner;
pub mod config;
pub mod firewall;
pub mod ports;
pub mod scanner;
pub mod server;
pub mod types;

#[cfg(test)]
mod testutil;
