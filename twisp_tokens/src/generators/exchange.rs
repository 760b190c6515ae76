//! A generator that exchanges an ambient identity proof for a signed token
//!
//! The issuer for a given environment and region lives at
//! `https://auth.{region}.{environment}.twisp.com/`. The identity proof is
//! posted as JSON to its `token/iam` endpoint, and the response body is the
//! signed token itself.

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use thiserror::Error;

use super::TokenGenerator;
use crate::{
    jwt::{self, MalformedToken},
    AccessToken, Environment, GeneratedToken, Region, RoleArn,
};

pub mod identity;

pub use identity::{
    EnvironmentIdentity, IdentityParameters, IdentityProof, IdentitySource, StaticIdentity,
};

/// The environment used when none is specified
pub const DEFAULT_ENVIRONMENT: &str = "cloud";

/// A generator performing an identity exchange against the issuer
#[derive(Debug)]
pub struct ExchangeTokenGenerator<I> {
    client: reqwest::Client,
    issuer_url: reqwest::Url,
    token_url: reqwest::Url,
    region: Region,
    assume_role_arn: Option<RoleArn>,
    identity: I,
}

impl<I> ExchangeTokenGenerator<I> {
    /// Constructs a generator for the issuer of `environment` in `region`
    ///
    /// # Errors
    ///
    /// Returns an error if `environment` or `region` cannot form a valid host name.
    pub fn new(
        client: reqwest::Client,
        environment: &Environment,
        region: Region,
        identity: I,
    ) -> Result<Self, url::ParseError> {
        let issuer_url = reqwest::Url::parse(&format!(
            "https://auth.{}.{}.twisp.com/",
            region, environment
        ))?;
        Self::with_issuer_url(client, issuer_url, region, identity)
    }

    /// Constructs a generator for the issuer of the [`DEFAULT_ENVIRONMENT`] in `region`
    ///
    /// # Errors
    ///
    /// Returns an error if `region` cannot form a valid host name.
    pub fn in_default_environment(
        client: reqwest::Client,
        region: Region,
        identity: I,
    ) -> Result<Self, url::ParseError> {
        Self::new(
            client,
            &Environment::from_static(DEFAULT_ENVIRONMENT),
            region,
            identity,
        )
    }

    /// Constructs a generator against an explicit issuer base URL
    ///
    /// # Errors
    ///
    /// Returns an error if the token endpoint cannot be derived from `issuer_url`.
    pub fn with_issuer_url(
        client: reqwest::Client,
        issuer_url: reqwest::Url,
        region: Region,
        identity: I,
    ) -> Result<Self, url::ParseError> {
        let token_url = issuer_url.join("token/iam")?;
        Ok(Self {
            client,
            issuer_url,
            token_url,
            region,
            assume_role_arn: None,
            identity,
        })
    }

    /// Requests that the identity proof be produced under an assumed role
    pub fn with_assume_role(mut self, role: RoleArn) -> Self {
        self.assume_role_arn = Some(role);
        self
    }

    /// The endpoint tokens are requested from
    pub fn token_url(&self) -> &reqwest::Url {
        &self.token_url
    }
}

/// An error while attempting to exchange an identity proof for a token
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// No identity proof could be produced
    #[error("unable to produce an identity proof")]
    Identity(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    /// Unable to send the exchange request to the issuer
    #[error("error sending request to issuer")]
    RequestSend(#[source] reqwest::Error),
    /// Unable to read the issuer's response
    #[error("error reading response body")]
    BodyRead(#[source] reqwest::Error),
    /// The issuer rejected the exchange
    #[error("identity exchange rejected with status {status}: {body}")]
    Rejected {
        /// The status returned by the issuer
        status: StatusCode,
        /// The body returned by the issuer
        body: String,
    },
    /// The issuer responded with something that is not a usable token
    #[error("issuer returned a malformed token")]
    Malformed(#[from] MalformedToken),
}

impl ExchangeError {
    /// Whether the issuer explicitly refused the exchange
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// Whether the issuer's response could not be understood as a token
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

#[async_trait]
impl<I: IdentitySource> TokenGenerator for ExchangeTokenGenerator<I> {
    type Error = ExchangeError;

    async fn generate(&mut self) -> Result<GeneratedToken, Self::Error> {
        let proof = self
            .identity
            .identity_proof(IdentityParameters {
                cluster_id: self.issuer_url.as_str(),
                region: &self.region,
                assume_role_arn: self.assume_role_arn.as_deref(),
            })
            .await
            .map_err(|e| ExchangeError::Identity(e.into()))?;

        request_token(&self.client, self.token_url.clone(), &proof).await
    }
}

#[tracing::instrument(
    err,
    skip(client, token_url, proof),
    fields(
        token_url = %token_url,
        assume_role_arn = proof.assume_role_arn.as_deref(),
    ),
)]
async fn request_token(
    client: &reqwest::Client,
    token_url: reqwest::Url,
    proof: &IdentityProof,
) -> Result<GeneratedToken, ExchangeError> {
    tracing::trace!("requesting token from issuer");

    let resp = client
        .post(token_url)
        .header(header::ACCEPT, "application/json")
        .json(proof)
        .send()
        .await
        .map_err(ExchangeError::RequestSend)?;

    let status = resp.status();
    tracing::debug!(
        response.status = status.as_u16(),
        "received token response from issuer"
    );

    let body = resp.text().await.map_err(ExchangeError::BodyRead)?;

    if !status.is_success() {
        return Err(ExchangeError::Rejected { status, body });
    }

    let body = body.trim();
    let expiry = jwt::unverified_expiry(body)?;

    tracing::info!(expiry = expiry.0, "received new token");

    Ok(GeneratedToken::new(AccessToken::new(body.to_owned()), expiry))
}
