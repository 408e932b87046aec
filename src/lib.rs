//! Tunnelgate - An edge agent that forwards public traffic to registered tunnels
//!
//! This library provides:
//! - A routing table mapping hostnames and ports to tunnel targets
//! - An HTTP reverse proxy that routes by Host header
//! - A raw TCP forwarder that routes by listening port
//! - A tunnel registry with capacity limits and activity tracking
//! - WireGuard peer key and address provisioning for encrypted tunnels
//! - A JSON management API for creating and removing tunnels

pub mod api;
pub mod config;
pub mod error;
pub mod peer;
pub mod proxy;
pub mod registry;
pub mod routes;
pub mod service;
pub mod tcp;
pub mod tls;
