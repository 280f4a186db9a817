//! Proxy Verifier - protocol, anonymity and tunnel checks for proxies
//!
//! Verifies which protocols a proxy speaks, how much it reveals about the
//! client, and whether it can open CONNECT tunnels.

pub mod error;
pub mod proxy;

pub use error::{Result, VerifyError};
pub use proxy::*;
