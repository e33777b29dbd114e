pub mod schema;

pub use schema::{
    BackoffConfig, Config, GatewayConfig, SessionConfig, TransportConfig, DEFAULT_API_KEY,
};
