//! A sidecar that keeps a live, expiring registry of scrape targets announced
//! on the bus and renders it into the agent's input config, reloading the
//! agent whenever the rendered config changes.

pub mod bus;
pub mod config;
pub mod materialize;
pub mod process;
pub mod registry;
pub mod scheduler;
pub mod signal;
pub mod trace;

#[macro_use]
extern crate tracing;

