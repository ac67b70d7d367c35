pub mod cache;
pub mod cluster;
pub mod config;
pub mod connect;
pub mod fingerprint;
pub mod interceptor;
pub mod keymutex;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod rule;
pub mod server;
pub mod token;
pub mod upstream;
