//! Stream projection engine: drains the event topics into the read cache
//! and pushes realtime events to locally connected sessions.

pub mod app;
pub mod config;
pub mod metrics;
