//! cloudlink: joins a station network, waits for an IP address, then keeps a
//! cloud messaging session alive and dispatches the messages it receives.
//!
//! ## Modules
//!
//! * `config`: TOML configuration (logger, network link, cloud session),
//!   validated with `validator`.
//! * `core`: the connectivity signal, the link event handler, the message
//!   dispatcher and the session worker.
//! * `logger`: `tracing` subscriber setup for console and journald output.

pub mod config;
pub mod core;
pub mod logger;
