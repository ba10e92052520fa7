//! # Utility Modules
//!
//! Supporting utilities for integrity protection, tokens, logging, and timing.
//!
//! ## Components
//! - **Crypto**: HMAC-SHA256 packet signing with per-connection keys
//! - **Token**: 32-character bearer tokens with constant-time comparison
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Timing constants and async timeout wrappers
//! - **Metrics**: Thread-safe observability counters
//!
//! ## Security
//! - Cryptographically secure RNG (getrandom)
//! - Memory zeroing for keys and tokens (zeroize crate)

pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod timeout;
pub mod token;

pub use crypto::HmacKey;
pub use token::AuthToken;
