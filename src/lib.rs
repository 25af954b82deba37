//! Hostgate - a local multi-tenant front door
//!
//! This library provides a domain-routed reverse proxy that:
//! - Routes HTTP and WebSocket traffic based on the Host header
//! - Spawns one backend process per configured domain and supervises it
//! - Restarts crashed backends after a fixed delay, indefinitely
//! - Reconciles its routing table against a line-oriented map file on change
//! - Exposes a loopback control endpoint for same-port backend reloads

pub mod config;
pub mod control;
pub mod error;
pub mod pool;
pub mod ports;
pub mod proxy;
pub mod registry;
pub mod service;
