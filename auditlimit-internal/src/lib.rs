pub mod admission; // admission decisions and their metrics
pub mod config; // TOML config file and environment overrides
pub mod device; // per-credential device cap
pub mod endpoints; // API endpoints
pub mod error; // error handling
pub mod gateway_util; // utilities for gateway
pub mod local_limiter; // per-instance token buckets
pub mod moderation; // forbidden words and the moderation API
pub mod observability; // log setup
pub mod store; // shared key-value store backends
pub mod usage; // sliding-window usage accounting
