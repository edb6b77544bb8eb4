//! # Taproot
//!
//! Recursive, DNSSEC-validating DNS resolver with an aggressive
//! in-memory cache. This library crate exposes the request coordinator;
//! the binary wires it to the UDP/TCP server front end.

pub mod coordinator;

pub use coordinator::Coordinator;
