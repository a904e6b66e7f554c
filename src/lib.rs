//! Podgate - a ticket-gated autoscaling reverse proxy for Kubernetes
//!
//! This library gates access to pools of stateful single-user web backends:
//! - Clients acquire a ticket (a slot reservation on one backend) over a
//!   control WebSocket before any HTTP request is let through
//! - Tickets are leases, kept alive by client traffic and expired on idle
//! - Backends are discovered from pod events; draining backends serve their
//!   existing tickets but take no new ones
//! - The replica pool is scaled up when free tickets run short and idle
//!   autoscaled pods are reaped after a cooldown
//! - Per-deployment configuration is reconciled from annotations without
//!   dropping live sessions where avoidable
//! - Prometheus metrics are exported per application

pub mod application;
pub mod autoscale;
pub mod backend;
pub mod config;
pub mod error;
pub mod handshake;
pub mod metrics;
pub mod podwatch;
pub mod proxy;
pub mod reconciler;
pub mod serverlist;
pub mod ticket;
