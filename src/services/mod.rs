pub mod browser;
pub mod clock;
pub mod cookie_pool;
pub mod dedup;
pub mod fetcher;
pub mod intake;
pub mod proxy_registry;
pub mod queue;
pub mod store;
