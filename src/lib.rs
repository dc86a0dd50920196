//! hostgate - a host-routed HTTPS reverse proxy with certificate
//! lifecycle and child process supervision
//!
//! This library provides a gateway that:
//! - Terminates TLS with per-hostname certificate selection (SNI)
//! - Issues ACME HTTP-01 certificates for public hosts, with a
//!   self-signed fallback when the CA is unreachable
//! - Serves local-like hosts from one combined self-signed certificate
//!   whose SAN set unions every configured local hostname
//! - Routes HTTP/1.1 and WebSocket traffic by Host header
//! - Rewrites Location and Set-Cookie headers so browsers only see the
//!   public host, including callback-URL port injection
//! - Serves static directories with an SPA index.html fallback
//! - Supervises the child processes backing apps, with backoff
//!   restarts, log ring buffers and health probing
//! - Exposes a typed event bus and mutation API for the admin surface

pub mod acme;
pub mod cert_store;
pub mod certs;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod health;
pub mod http_server;
pub mod proxy;
pub mod router;
pub mod selfsigned;
pub mod supervisor;
