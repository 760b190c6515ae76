//! A generator handing out a fixed token

use std::convert::Infallible;

use async_trait::async_trait;
use twisp_clock::UnixTime;

use super::TokenGenerator;
use crate::{AccessToken, GeneratedToken};

/// A generator that always returns the same token, which never expires
///
/// Useful for tests and for identities whose credential never rotates.
#[derive(Debug, Clone)]
pub struct StaticTokenGenerator {
    access_token: AccessToken,
}

impl StaticTokenGenerator {
    /// Constructs a generator that always returns `access_token`
    pub fn new(access_token: impl Into<AccessToken>) -> Self {
        Self {
            access_token: access_token.into(),
        }
    }
}

#[async_trait]
impl TokenGenerator for StaticTokenGenerator {
    type Error = Infallible;

    async fn generate(&mut self) -> Result<GeneratedToken, Self::Error> {
        Ok(GeneratedToken::new(self.access_token.clone(), UnixTime::MAX))
    }
}
