//! `ditto-relay`: an OpenAI-compatible reverse proxy that rotates a pool of upstream API keys
//! and models, with write-back usage telemetry and an admin API.

pub mod gateway;

#[doc(hidden)]
pub mod utils;

pub use gateway::{GatewayError, RelayConfig, RelayState};
