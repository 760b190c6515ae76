//! Cached token access with proactive background renewal

use std::{
    error, fmt, ops,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    sync::{watch, Mutex},
    time::Instant,
};
use twisp_clock::{Clock, DurationSecs, System, UnixTime};

use crate::{
    backoff::{ErrorBackoffConfig, ErrorBackoffHandler},
    generators::TokenGenerator,
    tokens::TokenLifetime,
    AccessTokenRef, CachedToken, GeneratedToken,
};

/// The ceiling on a single call to a generator
pub const DEFAULT_GENERATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Hands out the current token, obtaining a new one when required
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// The error type returned when no valid token can be provided
    type Error: error::Error + Send + Sync + 'static;

    /// Gets a valid token
    async fn token(&self) -> Result<IssuedToken, Self::Error>;

    /// Stops any background renewal
    ///
    /// Calls to [`token()`][Self::token()] continue to work afterwards.
    fn stop(&self);
}

#[async_trait]
impl<R: TokenRefresher + ?Sized> TokenRefresher for Arc<R> {
    type Error = R::Error;

    async fn token(&self) -> Result<IssuedToken, Self::Error> {
        (**self).token().await
    }

    fn stop(&self) {
        (**self).stop()
    }
}

/// A token handed out by a [`TokenRefresher`]
#[derive(Clone, Debug)]
pub struct IssuedToken {
    token: Arc<CachedToken>,
    refreshed: bool,
}

impl IssuedToken {
    fn cached(token: Arc<CachedToken>) -> Self {
        Self {
            token,
            refreshed: false,
        }
    }

    fn refreshed(token: Arc<CachedToken>) -> Self {
        Self {
            token,
            refreshed: true,
        }
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        self.token.access_token()
    }

    /// Whether obtaining this token required a call to the generator
    #[inline]
    pub fn was_refreshed(&self) -> bool {
        self.refreshed
    }

    /// Gets the snapshot the token was taken from
    #[inline]
    pub fn snapshot(&self) -> &Arc<CachedToken> {
        &self.token
    }
}

impl ops::Deref for IssuedToken {
    type Target = CachedToken;

    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

/// An error obtaining a token from a refresher
#[derive(Debug, Error)]
pub enum RefreshError<E> {
    /// The generator failed to produce a token
    #[error("unable to generate a new token")]
    Generate(#[source] E),
    /// The generator did not produce a token in time
    #[error("token generation timed out after {0:?}")]
    TimedOut(Duration),
}

impl<E> RefreshError<E> {
    /// Gets the generator's error, if that was the cause
    pub fn generator_error(&self) -> Option<&E> {
        match self {
            Self::Generate(e) => Some(e),
            Self::TimedOut(_) => None,
        }
    }
}

/// Configuration of a [`TtlRefresher`]
#[derive(Clone, Debug)]
pub struct RefresherConfig {
    max_token_age: DurationSecs,
    max_refresh_age: DurationSecs,
    generate_timeout: Duration,
    prefetch: bool,
    error_backoff: Option<ErrorBackoffConfig>,
}

impl Default for RefresherConfig {
    /// Tokens are used right up to their expiry and renewed in the background at
    /// expiry. Generation is bounded by [`DEFAULT_GENERATE_TIMEOUT`], nothing is
    /// prefetched, and failed background renewals are not retried.
    fn default() -> Self {
        Self {
            max_token_age: DurationSecs::ZERO,
            max_refresh_age: DurationSecs::ZERO,
            generate_timeout: DEFAULT_GENERATE_TIMEOUT,
            prefetch: false,
            error_backoff: None,
        }
    }
}

impl RefresherConfig {
    /// Constructs a configuration with the given safety margins
    ///
    /// A token stops being handed out `max_token_age` before its expiry, and a
    /// background renewal is attempted `max_refresh_age` before its expiry.
    /// `max_refresh_age` should be at least `max_token_age`; a smaller value is
    /// raised to `max_token_age` so that renewal never waits past the point the
    /// token stops being usable.
    pub fn new(max_token_age: DurationSecs, max_refresh_age: DurationSecs) -> Self {
        Self {
            max_token_age,
            max_refresh_age,
            ..Self::default()
        }
    }

    /// Sets the ceiling on a single call to the generator
    pub fn with_generate_timeout(mut self, timeout: Duration) -> Self {
        self.generate_timeout = timeout;
        self
    }

    /// Requests the first token in the background as soon as the refresher starts
    pub fn with_prefetch(mut self, prefetch: bool) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Retries failed background renewals after a backoff delay
    ///
    /// Without this, a failed background renewal is retried only when a caller
    /// next finds the token stale.
    pub fn with_error_backoff(mut self, backoff: ErrorBackoffConfig) -> Self {
        self.error_backoff = Some(backoff);
        self
    }

    fn lifetime(&self) -> TokenLifetime {
        let max_refresh_age = if self.max_refresh_age < self.max_token_age {
            tracing::warn!(
                max_token_age = self.max_token_age.0,
                max_refresh_age = self.max_refresh_age.0,
                "refresh age is shorter than token age, renewing at token age instead"
            );
            self.max_token_age
        } else {
            self.max_refresh_age
        };

        TokenLifetime {
            max_token_age: self.max_token_age,
            max_refresh_age,
        }
    }
}

/// A command for the background renewal task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Schedule {
    Idle,
    At { generation: u64, deadline: Instant },
    Stopped,
}

struct RefreshState<G> {
    generator: G,
    generation: u64,
    backoff: Option<ErrorBackoffHandler>,
}

struct Shared<G, C> {
    current: ArcSwapOption<CachedToken>,
    refresh: Mutex<RefreshState<G>>,
    schedule: watch::Sender<Schedule>,
    stopped: AtomicBool,
    lifetime: TokenLifetime,
    generate_timeout: Duration,
    clock: C,
}

/// A refresher that caches a token until shortly before it expires
///
/// Valid tokens are served from an atomically published snapshot without
/// locking. When the snapshot is missing or stale, one caller generates a new
/// token while concurrent callers wait for and reuse its result. A background
/// task renews the token ahead of expiry so that callers rarely wait at all.
///
/// Cloning produces another handle to the same cache.
pub struct TtlRefresher<G, C = System> {
    shared: Arc<Shared<G, C>>,
}

impl<G, C> Clone for TtlRefresher<G, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<G, C> fmt::Debug for TtlRefresher<G, C>
where
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TtlRefresher")
            .field("current", &self.shared.current.load_full())
            .field("stopped", &self.shared.stopped.load(Ordering::Relaxed))
            .field("lifetime", &self.shared.lifetime)
            .field("generate_timeout", &self.shared.generate_timeout)
            .field("clock", &self.shared.clock)
            .finish()
    }
}

impl<G> TtlRefresher<G, System>
where
    G: TokenGenerator + 'static,
{
    /// Starts a refresher backed by `generator`, using the system clock
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn spawn(generator: G, config: RefresherConfig) -> Self {
        Self::spawn_with_clock(generator, config, System)
    }
}

impl<G, C> TtlRefresher<G, C>
where
    G: TokenGenerator + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Starts a refresher backed by `generator`, using the given clock
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn spawn_with_clock(generator: G, config: RefresherConfig, clock: C) -> Self {
        let (tx, rx) = watch::channel(Schedule::Idle);

        let shared = Arc::new(Shared {
            current: ArcSwapOption::empty(),
            refresh: Mutex::new(RefreshState {
                generator,
                generation: 0,
                backoff: config.error_backoff.map(ErrorBackoffHandler::new),
            }),
            schedule: tx,
            stopped: AtomicBool::new(false),
            lifetime: config.lifetime(),
            generate_timeout: config.generate_timeout,
            clock,
        });

        let join = tokio::spawn(background_refresh(Arc::downgrade(&shared), rx));

        tokio::spawn(async move {
            if let Err(err) = join.await {
                if err.is_panic() {
                    tracing::error!("background token refresh panicked!")
                } else if err.is_cancelled() {
                    tracing::info!("background token refresh was cancelled")
                }
            }
        });

        if config.prefetch {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                if let Err(error) = shared.token().await {
                    tracing::warn!(
                        error = (&error as &dyn error::Error),
                        "unable to prefetch token"
                    );
                }
            });
        }

        Self { shared }
    }

    /// Gets the most recently published token without refreshing it
    ///
    /// The returned snapshot may be stale.
    pub fn current(&self) -> Option<Arc<CachedToken>> {
        self.shared.current.load_full()
    }

    /// Whether background renewal has been stopped
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

#[async_trait]
impl<G, C> TokenRefresher for TtlRefresher<G, C>
where
    G: TokenGenerator + 'static,
    C: Clock + Send + Sync + 'static,
{
    type Error = RefreshError<G::Error>;

    async fn token(&self) -> Result<IssuedToken, Self::Error> {
        self.shared.token().await
    }

    fn stop(&self) {
        self.shared.stop()
    }
}

impl<G, C> Shared<G, C>
where
    G: TokenGenerator,
    C: Clock,
{
    fn valid_token(&self) -> Option<Arc<CachedToken>> {
        self.current
            .load_full()
            .filter(|token| token.is_valid_with_clock(&self.clock))
    }

    async fn token(&self) -> Result<IssuedToken, RefreshError<G::Error>> {
        if let Some(token) = self.valid_token() {
            return Ok(IssuedToken::cached(token));
        }

        let mut state = self.refresh.lock().await;

        if let Some(token) = self.valid_token() {
            tracing::trace!(
                generation = token.generation(),
                "token was renewed while waiting"
            );
            return Ok(IssuedToken::cached(token));
        }

        tracing::debug!("no valid token, requesting new token");
        let generated = generate_with_timeout(&mut state.generator, self.generate_timeout).await?;
        Ok(IssuedToken::refreshed(self.publish(&mut state, generated)))
    }

    /// Renews the token ahead of expiry, scheduling a retry if backoff applies
    async fn refresh_in_background(&self, generation: u64) {
        let mut state = self.refresh.lock().await;

        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        if state.generation != generation {
            tracing::trace!(
                armed = generation,
                current = state.generation,
                "token already renewed, skipping background refresh"
            );
            return;
        }

        tracing::debug!(generation, "renewing token ahead of expiry");
        match generate_with_timeout(&mut state.generator, self.generate_timeout).await {
            Ok(generated) => {
                if self.stopped.load(Ordering::Acquire) {
                    tracing::debug!("refresher stopped during renewal, discarding token");
                } else {
                    self.publish(&mut state, generated);
                }
            }
            Err(error) => {
                let retry = state.backoff.as_mut().map(ErrorBackoffHandler::error);
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    retry_ms = retry.map(|d| d.as_millis() as u64),
                    "background token renewal failed"
                );

                // Armed under the lock: a newer generation's schedule must never be replaced.
                if let Some(retry) = retry {
                    self.schedule_at(generation, retry);
                }
            }
        }
    }

    fn publish(&self, state: &mut RefreshState<G>, generated: GeneratedToken) -> Arc<CachedToken> {
        state.generation += 1;
        if let Some(backoff) = state.backoff.as_mut() {
            backoff.success();
        }

        let token = Arc::new(CachedToken::new(
            generated,
            &self.lifetime,
            state.generation,
        ));
        self.current.store(Some(Arc::clone(&token)));

        let now = self.clock.now();
        let renew_in = renewal_delay(&token, now);
        tracing::debug!(
            generation = token.generation(),
            expiry = token.expiry().0,
            valid_until = token.valid_until().0,
            refresh_at = token.refresh_at().0,
            renew_in = renew_in.map(|d| d.0),
            "published new token"
        );

        match renew_in {
            Some(delay) => self.schedule_at(token.generation(), delay.into()),
            None => {
                tracing::warn!(
                    generation = token.generation(),
                    expiry = token.expiry().0,
                    "token is already stale, background renewal disabled for it"
                );
                self.schedule(Schedule::Idle);
            }
        }
        token
    }

    fn schedule_at(&self, generation: u64, delay: Duration) {
        let next = match Instant::now().checked_add(delay) {
            Some(deadline) => Schedule::At {
                generation,
                deadline,
            },
            None => Schedule::Idle,
        };
        self.schedule(next);
    }

    fn schedule(&self, next: Schedule) {
        // A stop that raced this call must not be overwritten.
        self.schedule.send_if_modified(|current| {
            if *current == Schedule::Stopped {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            tracing::trace!("refresher already stopped");
            return;
        }

        self.schedule.send_replace(Schedule::Stopped);
        tracing::debug!("stopped background token renewal");
    }
}

/// How long to wait before renewing `token` in the background
///
/// A token issued with less lifetime than the refresh margin is already due,
/// so it is renewed halfway through its remaining validity instead. A token
/// that is stale on arrival is never renewed in the background.
fn renewal_delay(token: &CachedToken, now: UnixTime) -> Option<DurationSecs> {
    let until_refresh = token.until_refresh_at(now);
    if until_refresh > DurationSecs::ZERO {
        return Some(until_refresh);
    }

    let half_remaining = DurationSecs(token.until_invalid_at(now).0 / 2);
    (half_remaining > DurationSecs::ZERO).then_some(half_remaining)
}

async fn generate_with_timeout<G: TokenGenerator>(
    generator: &mut G,
    timeout: Duration,
) -> Result<GeneratedToken, RefreshError<G::Error>> {
    match tokio::time::timeout(timeout, generator.generate()).await {
        Ok(result) => result.map_err(RefreshError::Generate),
        Err(_) => Err(RefreshError::TimedOut(timeout)),
    }
}

async fn background_refresh<G, C>(shared: Weak<Shared<G, C>>, mut rx: watch::Receiver<Schedule>)
where
    G: TokenGenerator,
    C: Clock,
{
    loop {
        let schedule = *rx.borrow_and_update();

        match schedule {
            Schedule::Stopped => {
                tracing::debug!("halting background token renewal");
                return;
            }
            Schedule::Idle => {}
            Schedule::At {
                generation,
                deadline,
            } => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        let Some(shared) = shared.upgrade() else {
                            return;
                        };

                        shared.refresh_in_background(generation).await;
                    }
                    changed = rx.changed() => {
                        if changed.is_err() {
                            tracing::info!("all refresher handles dropped");
                            return;
                        }
                        continue;
                    }
                }
            }
        }

        if rx.changed().await.is_err() {
            tracing::info!("all refresher handles dropped");
            return;
        }
    }
}

/// A refresher that generates a new token on every call
///
/// Useful when the issuer is cheap to call or when tokens must never be reused.
pub struct UncachedRefresher<G> {
    state: Mutex<RefreshState<G>>,
    lifetime: TokenLifetime,
    generate_timeout: Duration,
}

impl<G> UncachedRefresher<G> {
    /// Constructs a refresher around `generator`
    pub fn new(generator: G) -> Self {
        Self {
            state: Mutex::new(RefreshState {
                generator,
                generation: 0,
                backoff: None,
            }),
            lifetime: TokenLifetime::default(),
            generate_timeout: DEFAULT_GENERATE_TIMEOUT,
        }
    }

    /// Sets the ceiling on a single call to the generator
    pub fn with_generate_timeout(mut self, timeout: Duration) -> Self {
        self.generate_timeout = timeout;
        self
    }
}

impl<G> fmt::Debug for UncachedRefresher<G> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UncachedRefresher")
            .field("generate_timeout", &self.generate_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<G: TokenGenerator> TokenRefresher for UncachedRefresher<G> {
    type Error = RefreshError<G::Error>;

    async fn token(&self) -> Result<IssuedToken, Self::Error> {
        let mut state = self.state.lock().await;
        let generated = generate_with_timeout(&mut state.generator, self.generate_timeout).await?;
        state.generation += 1;

        Ok(IssuedToken::refreshed(Arc::new(CachedToken::new(
            generated,
            &self.lifetime,
            state.generation,
        ))))
    }

    fn stop(&self) {}
}
