//! Token generators
//!
//! A generator produces a brand new token along with the absolute time at which
//! its issuer says it expires. Generators do no caching of their own; wrap one
//! in a [`TokenRefresher`][crate::TokenRefresher] to reuse tokens.

use crate::GeneratedToken;
use async_trait::async_trait;
use std::error;

#[cfg(feature = "exchange")]
pub mod exchange;
mod static_token;

#[cfg(feature = "exchange")]
pub use exchange::ExchangeTokenGenerator;
pub use static_token::StaticTokenGenerator;

/// An asynchronous source of new tokens
///
/// Callers bound every invocation with a timeout and drop the future when it
/// elapses, so implementations must not block the executor.
#[async_trait]
pub trait TokenGenerator: Send + Sync {
    /// The error type returned in the event that generating a token fails
    type Error: error::Error + Send + Sync + 'static;

    /// Generates a new token
    async fn generate(&mut self) -> Result<GeneratedToken, Self::Error>;
}

#[async_trait]
impl<G: TokenGenerator + ?Sized> TokenGenerator for Box<G> {
    type Error = G::Error;

    async fn generate(&mut self) -> Result<GeneratedToken, Self::Error> {
        (**self).generate().await
    }
}
