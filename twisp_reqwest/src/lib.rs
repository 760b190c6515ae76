//! Middleware to automatically attach ledger credentials to outgoing requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AccessTokenMiddleware`] in the middleware stack to attach
//! the access token provided by a [`TokenRefresher`] to each outbound
//! request, along with the account the request acts on behalf of.
//!
//! The middleware never reasons about token freshness itself. It asks the
//! refresher for a token on every request; if none can be obtained, the
//! request fails without being sent.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place, allowing overrides to be specified as required.
//!
//! ```
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//! use twisp_reqwest::AccessTokenMiddleware;
//! use twisp_tokens::{generators::StaticTokenGenerator, AccountId, RefresherConfig, TtlRefresher};
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let refresher = TtlRefresher::spawn(StaticTokenGenerator::new("token"), RefresherConfig::default());
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(AccessTokenMiddleware::new(refresher, AccountId::from_static("my-account")).unwrap())
//!     .build();
//!
//! let req = client
//!     .get("https://example.com");
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! # }
//! ```
//!
//! The middleware can also be configured to add credentials only
//! conditionally. This can be useful in the event that you want to
//! use a single common middleware stack with multiple potential backends
//! and want to ensure that ledger credentials only go to the ledger.
//!
//! These predicates can be composed together to evaluate more complex
//! requirements prior to attaching a token to a request.
//!
//! ```
//! use predicates::prelude::PredicateBooleanExt;
//! use twisp_reqwest::{AccessTokenMiddleware, ExactHostMatch, HttpsOnly};
//! # use twisp_tokens::{generators::StaticTokenGenerator, AccountId, RefresherConfig, TtlRefresher};
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! # let refresher = TtlRefresher::spawn(StaticTokenGenerator::new("token"), RefresherConfig::default());
//!
//! AccessTokenMiddleware::new(refresher, AccountId::from_static("my-account"))
//!     .unwrap()
//!     .with_predicate(HttpsOnly.and(ExactHostMatch::new("api.us-west-2.cloud.twisp.com")));
//! # }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::fmt;

use bytes::{BufMut, BytesMut};
use predicates::{prelude::*, reflection};
use reqwest::{
    header::{self, HeaderName, HeaderValue, InvalidHeaderValue},
    Request, Response,
};
use reqwest_middleware::{Middleware, Next, Result};
use twisp_clock::Clock;
use twisp_tokens::{AccountId, IssuedToken, TokenRefresher};

/// The header carrying the account a request acts on behalf of
pub const ACCOUNT_ID_HEADER: HeaderName = HeaderName::from_static("x-twisp-account-id");

/// A middleware that injects an access token into outgoing requests
#[derive(Clone, Debug)]
pub struct AccessTokenMiddleware<R, P = HttpsOnly> {
    refresher: R,
    account_id: HeaderValue,
    predicate: P,
}

impl<R> AccessTokenMiddleware<R, HttpsOnly>
where
    R: TokenRefresher,
{
    /// Construct a new middleware from a token refresher and the account to act as
    ///
    /// By default, this middleware will only send its credentials if the request
    /// is being sent via HTTPS. To change this behavior, provide a
    /// custom predicate with [`with_predicate()`][Self::with_predicate()].
    ///
    /// # Errors
    ///
    /// Returns an error if `account_id` cannot be sent as a header value.
    pub fn new(
        refresher: R,
        account_id: AccountId,
    ) -> std::result::Result<Self, InvalidHeaderValue> {
        Ok(Self {
            refresher,
            account_id: HeaderValue::from_str(account_id.as_str())?,
            predicate: HttpsOnly,
        })
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> AccessTokenMiddleware<R, P> {
        AccessTokenMiddleware {
            refresher: self.refresher,
            account_id: self.account_id,
            predicate,
        }
    }
}

impl<R, P> AccessTokenMiddleware<R, P> {
    /// Gets the refresher backing this middleware
    pub fn refresher(&self) -> &R {
        &self.refresher
    }
}

#[cfg(feature = "exchange")]
mod exchange {
    use thiserror::Error;
    use twisp_tokens::{
        generators::{
            exchange::{IdentitySource, DEFAULT_ENVIRONMENT},
            ExchangeTokenGenerator,
        },
        AccountId, Environment, Region, RefresherConfig, TtlRefresher,
    };

    use super::{AccessTokenMiddleware, HttpsOnly};

    /// A middleware backed by an identity exchange against the regional issuer
    pub type ExchangeMiddleware<I> =
        AccessTokenMiddleware<TtlRefresher<ExchangeTokenGenerator<I>>, HttpsOnly>;

    /// An error while setting up an [`ExchangeMiddleware`]
    #[derive(Debug, Error)]
    pub enum SetupError {
        /// The environment and region do not form a valid issuer URL
        #[error("unable to derive issuer URL")]
        IssuerUrl(#[from] url::ParseError),
        /// The account cannot be sent as a header value
        #[error("account id is not a valid header value")]
        AccountId(#[from] reqwest::header::InvalidHeaderValue),
    }

    impl<I> ExchangeMiddleware<I>
    where
        I: IdentitySource + 'static,
    {
        /// Construct a middleware that exchanges `identity` for ledger tokens
        ///
        /// The refresher is spawned onto the current tokio runtime.
        ///
        /// # Errors
        ///
        /// Returns an error if no issuer URL can be derived from `environment`
        /// and `region`, or if `account_id` cannot be sent as a header value.
        ///
        /// # Panics
        ///
        /// Panics if called outside of a tokio runtime.
        pub fn exchange(
            client: reqwest::Client,
            account_id: AccountId,
            environment: &Environment,
            region: Region,
            identity: I,
            config: RefresherConfig,
        ) -> Result<Self, SetupError> {
            let generator = ExchangeTokenGenerator::new(client, environment, region, identity)?;
            let refresher = TtlRefresher::spawn(generator, config);
            Ok(AccessTokenMiddleware::new(refresher, account_id)?)
        }

        /// Construct a middleware against the issuer of the default environment
        ///
        /// Equivalent to [`exchange()`][Self::exchange()] with
        /// [`DEFAULT_ENVIRONMENT`].
        ///
        /// # Errors
        ///
        /// Returns an error if no issuer URL can be derived from `region`, or if
        /// `account_id` cannot be sent as a header value.
        ///
        /// # Panics
        ///
        /// Panics if called outside of a tokio runtime.
        pub fn exchange_default(
            client: reqwest::Client,
            account_id: AccountId,
            region: Region,
            identity: I,
            config: RefresherConfig,
        ) -> Result<Self, SetupError> {
            Self::exchange(
                client,
                account_id,
                &Environment::from_static(DEFAULT_ENVIRONMENT),
                region,
                identity,
                config,
            )
        }
    }

}

#[cfg(feature = "exchange")]
pub use exchange::{ExchangeMiddleware, SetupError};

fn bearer_header(token: &IssuedToken) -> std::result::Result<HeaderValue, InvalidHeaderValue> {
    if tracing::enabled!(tracing::Level::TRACE) {
        let now = twisp_clock::System.now();

        tracing::trace!(
            token.status = ?token.token_status_at(now),
            token.generation = token.generation(),
            token.refreshed = token.was_refreshed(),
            token.expiry = token.expiry().0,
            token.until_invalid = token.until_invalid_at(now).0,
            token.until_refresh = token.until_refresh_at(now).0,
            "obtained access token"
        );
    }

    let access_token = token.access_token().as_str();
    let mut header_value = BytesMut::with_capacity(access_token.len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(access_token.as_bytes());
    let mut value = HeaderValue::from_maybe_shared(header_value.freeze())?;
    value.set_sensitive(true);
    Ok(value)
}

#[async_trait::async_trait]
impl<R, P> Middleware for AccessTokenMiddleware<R, P>
where
    R: TokenRefresher + 'static,
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if self.predicate.eval(&req) {
            if !req.headers().contains_key(header::AUTHORIZATION) {
                let token = self.refresher.token().await.map_err(|error| {
                    tracing::warn!(
                        error = %error,
                        url = %req.url(),
                        "unable to obtain access token, request not sent"
                    );
                    reqwest_middleware::Error::middleware(error)
                })?;

                let value = bearer_header(&token).map_err(reqwest_middleware::Error::middleware)?;
                req.headers_mut().insert(header::AUTHORIZATION, value);
            }

            req.headers_mut()
                .insert(ACCOUNT_ID_HEADER, self.account_id.clone());
        }

        next.run(req, extensions).await
    }
}

/// Only attach credentials if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "scheme",
                    req.url().scheme().to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only attach credentials if the request is being sent to the exact host specified
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Construct a new predicate from a host string
    pub fn new<S>(host: S) -> Self
    where
        S: ToString,
    {
        Self {
            host: host.to_string(),
        }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(&self.host)
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "host",
                    req.url().host_str().unwrap_or("<no host>").to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host == ")?;
        f.write_str(&self.host)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    };

    use async_trait::async_trait;
    use reqwest::Client;
    use reqwest_middleware::ClientBuilder;
    use twisp_tokens::{
        generators::StaticTokenGenerator, RefreshError, RefresherConfig, TtlRefresher,
    };

    use super::*;

    const TEST_TOKEN: &str = "this-is-a-test-token";
    const BEARER_TEST_TOKEN: &str = "Bearer this-is-a-test-token";
    const TEST_ACCOUNT: &str = "acct-1234";

    struct AuthChecker {
        expected_authorization: String,
        checked: AtomicBool,
    }

    impl AuthChecker {
        pub fn new(expected: impl Into<String>) -> Self {
            Self {
                expected_authorization: expected.into(),
                checked: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Middleware for AuthChecker {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            let authorization_header = req
                .headers()
                .get(header::AUTHORIZATION)
                .expect("no authorization header");

            assert!(authorization_header.is_sensitive());
            assert_eq!(
                authorization_header
                    .to_str()
                    .expect("authorization header was not valid UTF-8"),
                self.expected_authorization
            );
            assert_eq!(
                req.headers()
                    .get(ACCOUNT_ID_HEADER)
                    .expect("no account header"),
                TEST_ACCOUNT
            );
            self.checked.store(true, Ordering::Release);

            Ok(http::Response::<&[u8]>::default().into())
        }
    }

    #[derive(Default)]
    struct NoAuthChecker {
        checked: AtomicBool,
    }

    #[async_trait]
    impl Middleware for NoAuthChecker {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            assert_eq!(req.headers().get(header::AUTHORIZATION), None);
            assert_eq!(req.headers().get(ACCOUNT_ID_HEADER), None);
            self.checked.store(true, Ordering::Release);

            Ok(http::Response::<&[u8]>::default().into())
        }
    }

    #[derive(Debug)]
    struct IssuerDown;

    impl fmt::Display for IssuerDown {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("issuer is down")
        }
    }

    impl std::error::Error for IssuerDown {}

    #[derive(Debug, Default)]
    struct FailingRefresher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenRefresher for FailingRefresher {
        type Error = RefreshError<IssuerDown>;

        async fn token(&self) -> std::result::Result<IssuedToken, Self::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RefreshError::Generate(IssuerDown))
        }

        fn stop(&self) {}
    }

    fn prepare_middleware() -> AccessTokenMiddleware<TtlRefresher<StaticTokenGenerator>> {
        let refresher = TtlRefresher::spawn(
            StaticTokenGenerator::new(TEST_TOKEN),
            RefresherConfig::default(),
        );

        AccessTokenMiddleware::new(refresher, AccountId::from_static(TEST_ACCOUNT)).unwrap()
    }

    mod when_request_does_not_have_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn middleware_with_defaults_attaches_token_on_https_request() {
            let middleware = prepare_middleware();
            let auth_checker = Arc::new(AuthChecker::new(BEARER_TEST_TOKEN));

            let client = ClientBuilder::new(Client::default())
                .with(middleware)
                .with_arc(auth_checker.clone())
                .build();

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert!(auth_checker.checked.load(Ordering::Acquire));
        }

        #[tokio::test]
        async fn middleware_with_defaults_ignores_plain_http_request() {
            let middleware = prepare_middleware();
            let auth_checker = Arc::new(NoAuthChecker::default());

            let client = ClientBuilder::new(Client::default())
                .with(middleware)
                .with_arc(auth_checker.clone())
                .build();

            let resp = client.get("http://example.com").send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert!(auth_checker.checked.load(Ordering::Acquire));
        }

        mod and_predicate_evaluates_to_attach {
            use super::*;

            #[tokio::test]
            async fn middleware_attaches_access_token() {
                let middleware = prepare_middleware().with_predicate(predicate::always());
                let auth_checker = Arc::new(AuthChecker::new(BEARER_TEST_TOKEN));

                let client = ClientBuilder::new(Client::default())
                    .with(middleware)
                    .with_arc(auth_checker.clone())
                    .build();

                let resp = client.get("http://example.com").send().await.unwrap();

                assert_eq!(resp.status(), http::StatusCode::OK);
                assert!(auth_checker.checked.load(Ordering::Acquire));
            }
        }

        mod and_predicate_evaluates_to_ignore {
            use super::*;

            #[tokio::test]
            async fn middleware_does_not_attach_access_token() {
                let middleware = prepare_middleware().with_predicate(predicate::never());
                let auth_checker = Arc::new(NoAuthChecker::default());

                let client = ClientBuilder::new(Client::default())
                    .with(middleware)
                    .with_arc(auth_checker.clone())
                    .build();

                let resp = client.get("https://example.com").send().await.unwrap();

                assert_eq!(resp.status(), http::StatusCode::OK);
                assert!(auth_checker.checked.load(Ordering::Acquire));
            }
        }

        mod and_refresher_fails {
            use super::*;

            #[tokio::test]
            async fn request_is_not_dispatched() {
                let refresher = Arc::new(FailingRefresher::default());
                let middleware =
                    AccessTokenMiddleware::new(refresher.clone(), AccountId::from_static(TEST_ACCOUNT))
                        .unwrap();
                let downstream = Arc::new(NoAuthChecker::default());

                let client = ClientBuilder::new(Client::default())
                    .with(middleware)
                    .with_arc(downstream.clone())
                    .build();

                let err = client
                    .get("https://example.com")
                    .send()
                    .await
                    .unwrap_err();

                assert!(matches!(err, reqwest_middleware::Error::Middleware(_)), "{:?}", err);
                assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
                assert!(!downstream.checked.load(Ordering::Acquire));
            }
        }
    }

    mod when_request_already_contains_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn middleware_does_not_attach_access_token() {
            const OVERRIDE_TOKEN: &str = "overridden!";
            // Reqwest uses a capital `B` bearer
            const BEARER_OVERRIDE_TOKEN: &str = "Bearer overridden!";

            let middleware = prepare_middleware();
            let auth_checker = Arc::new(AuthChecker::new(BEARER_OVERRIDE_TOKEN));

            let client = ClientBuilder::new(Client::default())
                .with(middleware)
                .with_arc(auth_checker.clone())
                .build();

            let resp = client
                .get("https://example.com")
                .bearer_auth(OVERRIDE_TOKEN)
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert!(auth_checker.checked.load(Ordering::Acquire));
        }

        #[tokio::test]
        async fn refresher_is_not_consulted() {
            let refresher = Arc::new(FailingRefresher::default());
            let middleware =
                AccessTokenMiddleware::new(refresher.clone(), AccountId::from_static(TEST_ACCOUNT))
                    .unwrap();
            let auth_checker = Arc::new(AuthChecker::new("Bearer overridden!"));

            let client = ClientBuilder::new(Client::default())
                .with(middleware)
                .with_arc(auth_checker.clone())
                .build();

            let resp = client
                .get("https://example.com")
                .bearer_auth("overridden!")
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
        }
    }

    mod account_id {
        use super::*;

        #[tokio::test]
        async fn invalid_header_value_is_rejected() {
            let result = AccessTokenMiddleware::new(
                Arc::new(FailingRefresher::default()),
                AccountId::from_static("acct\n1234"),
            );

            assert!(result.is_err());
        }
    }

    mod https_only_predicate {
        use super::*;

        #[test]
        fn matches_when_request_has_https_scheme() {
            let request =
                Request::new(reqwest::Method::GET, "https://example.com".parse().unwrap());
            let predicate = HttpsOnly;
            let result = dbg!(predicate.find_case(true, &request));
            assert!(result.is_none())
        }

        #[test]
        fn does_not_match_when_request_has_http_scheme() {
            let request = Request::new(reqwest::Method::GET, "http://example.com".parse().unwrap());
            let predicate = HttpsOnly;
            let result = dbg!(predicate.find_case(false, &request));
            assert!(result.is_none())
        }
    }

    mod exact_host_match_predicate {
        use super::*;

        #[test]
        fn matches_when_request_has_same_host() {
            let request = Request::new(
                reqwest::Method::GET,
                "https://api.us-west-2.cloud.twisp.com".parse().unwrap(),
            );
            let predicate = ExactHostMatch::new("api.us-west-2.cloud.twisp.com");
            let result = dbg!(predicate.find_case(true, &request));
            assert!(result.is_none())
        }

        #[test]
        fn does_not_match_when_request_has_different_host() {
            let request = Request::new(
                reqwest::Method::GET,
                "http://does-not-match.com".parse().unwrap(),
            );
            let predicate = ExactHostMatch::new("api.us-west-2.cloud.twisp.com");
            let result = dbg!(predicate.find_case(false, &request));
            assert!(result.is_none())
        }
    }
}
