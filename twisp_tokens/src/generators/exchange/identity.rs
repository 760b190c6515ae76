//! Sources of the identity proof presented to the issuer

use async_trait::async_trait;
use serde::Serialize;
use std::{convert::Infallible, env, error};
use thiserror::Error;

use crate::{IdentityToken, RegionRef, RoleArnRef};

/// What the issuer needs to know in order to accept an identity proof
#[derive(Debug, Clone, Copy)]
pub struct IdentityParameters<'a> {
    /// The issuer's base URL, which the proof must be scoped to
    pub cluster_id: &'a str,
    /// The region the issuer lives in
    pub region: &'a RegionRef,
    /// A role to assume before proving identity, if any
    pub assume_role_arn: Option<&'a RoleArnRef>,
}

/// A signed statement of the caller's cloud identity, sent as the exchange body
#[derive(Debug, Clone, Serialize)]
pub struct IdentityProof {
    /// The signed proof
    pub token: IdentityToken,
    /// The role assumed while producing the proof
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assume_role_arn: Option<String>,
}

/// Produces identity proofs from ambient credentials
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// The error type returned in the event that no proof can be produced
    type Error: error::Error + Send + Sync + 'static;

    /// Produces a proof suitable for the given issuer
    async fn identity_proof(
        &self,
        params: IdentityParameters<'_>,
    ) -> Result<IdentityProof, Self::Error>;
}

/// An identity source holding a proof obtained out of band
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    token: IdentityToken,
}

impl StaticIdentity {
    /// Constructs a source that always presents `token`
    pub fn new(token: impl Into<IdentityToken>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl IdentitySource for StaticIdentity {
    type Error = Infallible;

    async fn identity_proof(
        &self,
        params: IdentityParameters<'_>,
    ) -> Result<IdentityProof, Self::Error> {
        Ok(IdentityProof {
            token: self.token.clone(),
            assume_role_arn: params.assume_role_arn.map(|r| r.as_str().to_owned()),
        })
    }
}

/// An identity source reading a proof from an environment variable on every exchange
///
/// Sidecars and platform agents commonly rotate a proof into the process
/// environment or a mounted secret; re-reading picks up the latest one.
#[derive(Debug, Clone)]
pub struct EnvironmentIdentity {
    var: String,
}

impl EnvironmentIdentity {
    /// The variable read by [`EnvironmentIdentity::default()`]
    pub const DEFAULT_VAR: &'static str = "TWISP_IDENTITY_TOKEN";

    /// Constructs a source reading from the variable `var`
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvironmentIdentity {
    fn default() -> Self {
        Self::new(Self::DEFAULT_VAR)
    }
}

/// The identity proof variable was missing or unusable
#[derive(Debug, Error)]
#[error("no identity proof available in `{var}`")]
pub struct MissingIdentity {
    var: String,
    #[source]
    source: env::VarError,
}

#[async_trait]
impl IdentitySource for EnvironmentIdentity {
    type Error = MissingIdentity;

    async fn identity_proof(
        &self,
        params: IdentityParameters<'_>,
    ) -> Result<IdentityProof, Self::Error> {
        let token = env::var(&self.var).map_err(|source| MissingIdentity {
            var: self.var.clone(),
            source,
        })?;

        tracing::trace!(var = %self.var, "read identity proof from environment");

        Ok(IdentityProof {
            token: IdentityToken::new(token),
            assume_role_arn: params.assume_role_arn.map(|r| r.as_str().to_owned()),
        })
    }
}
