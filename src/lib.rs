//! Crawl orchestration engine.
//!
//! Keeps a pool of browser-minted session cookies healthy, pairs each leased
//! cookie with a proxy, and drives search jobs through a durable at-least-once
//! queue into a deduplicated result log. The intake server (`main.rs`) accepts
//! work; `bin/worker.rs` runs the cookie and search roles against the same
//! backing store.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
pub mod workers;
