//! Cached bearer tokens with proactive background renewal
//!
//! Clients of the Twisp ledger authenticate each request with a short-lived
//! bearer token obtained by exchanging a proof of the caller's cloud identity
//! with a regional issuer. This crate keeps such a token on hand so that
//! request paths rarely have to wait on the issuer.
//!
//! The pieces are:
//!
//! * A [`TokenGenerator`][generators::TokenGenerator] produces a brand new token
//!   along with its issuer-stated expiry. The
//!   [`ExchangeTokenGenerator`][generators::ExchangeTokenGenerator] performs the
//!   identity exchange; the
//!   [`StaticTokenGenerator`][generators::StaticTokenGenerator] hands out a fixed
//!   token.
//! * A [`TokenRefresher`] hands out tokens. The [`TtlRefresher`] caches a token
//!   until shortly before it expires and renews it in the background ahead of
//!   time. Concurrent callers that find the token stale share a single call to
//!   the generator. The [`UncachedRefresher`] calls the generator every time.
//!
//! Two safety margins govern the cache. A token is no longer handed out once it
//! is within `max_token_age` of its expiry, and a background renewal is
//! attempted once it is within `max_refresh_age` of its expiry. If a background
//! renewal fails, the existing token keeps being served until it goes stale.
//!
//! ```
//! use twisp_tokens::{generators::StaticTokenGenerator, RefresherConfig, TokenRefresher, TtlRefresher};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let refresher = TtlRefresher::spawn(
//!     StaticTokenGenerator::new("my-token"),
//!     RefresherConfig::default(),
//! );
//!
//! let token = refresher.token().await?;
//! assert_eq!(token.access_token().as_str(), "my-token");
//! assert!(token.was_refreshed());
//!
//! let token = refresher.token().await?;
//! assert!(!token.was_refreshed());
//!
//! refresher.stop();
//! # Ok(())
//! # }
//! ```
//!
//! Exchanging a cloud identity for a ledger token:
//!
//! ```no_run
//! use std::time::Duration;
//! use twisp_clock::DurationSecs;
//! use twisp_tokens::{
//!     backoff::ErrorBackoffConfig,
//!     generators::{exchange::EnvironmentIdentity, ExchangeTokenGenerator},
//!     Environment, Region, RefresherConfig, TokenRefresher, TtlRefresher,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let generator = ExchangeTokenGenerator::new(
//!     reqwest::Client::new(),
//!     &Environment::from_static("cloud"),
//!     Region::from_static("us-west-2"),
//!     EnvironmentIdentity::default(),
//! )?;
//!
//! let config = RefresherConfig::new(DurationSecs(30), DurationSecs(300))
//!     .with_generate_timeout(Duration::from_secs(10))
//!     .with_error_backoff(ErrorBackoffConfig::default())
//!     .with_prefetch(true);
//!
//! let refresher = TtlRefresher::spawn(generator, config);
//!
//! let token = refresher.token().await?;
//! tracing::info!(expiry = token.expiry().0, "obtained ledger token");
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! * `exchange` (default): Provides the identity exchange generator, which
//!   requires an HTTP client.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod backoff;
mod braids;
pub mod generators;
pub mod jwt;
mod refresher;
mod tokens;

pub use braids::*;
pub use refresher::{
    IssuedToken, RefreshError, RefresherConfig, TokenRefresher, TtlRefresher, UncachedRefresher,
    DEFAULT_GENERATE_TIMEOUT,
};
pub use tokens::{CachedToken, GeneratedToken, TokenStatus};
