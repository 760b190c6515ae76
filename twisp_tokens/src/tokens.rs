use twisp_clock::{Clock, DurationSecs, UnixTime};

use crate::{AccessToken, AccessTokenRef};

/// A token freshly produced by a [`TokenGenerator`][crate::generators::TokenGenerator]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedToken {
    access_token: AccessToken,
    expiry: UnixTime,
}

impl GeneratedToken {
    /// Pairs an access token with the absolute expiry stated by its issuer
    pub fn new(access_token: impl Into<AccessToken>, expiry: UnixTime) -> Self {
        Self {
            access_token: access_token.into(),
            expiry,
        }
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the issuer-stated expiry
    #[inline]
    pub fn expiry(&self) -> UnixTime {
        self.expiry
    }
}

/// A token's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is valid and not yet due for renewal
    Fresh,
    /// The token is still valid, but a background renewal should be underway
    RefreshDue,
    /// The token is past its effective validity and must not be handed out
    Stale,
}

/// An immutable snapshot of the cached token
///
/// Snapshots are only ever replaced, never modified. The derived boundaries are
/// computed once when the snapshot is created.
#[derive(Debug)]
pub struct CachedToken {
    access_token: Box<AccessTokenRef>,
    expiry: UnixTime,
    valid_until: UnixTime,
    refresh_at: UnixTime,
    generation: u64,
}

impl CachedToken {
    pub(crate) fn new(
        token: GeneratedToken,
        lifetime: &TokenLifetime,
        generation: u64,
    ) -> Self {
        let expiry = token.expiry;
        Self {
            access_token: token.access_token.into_boxed_ref(),
            expiry,
            valid_until: expiry - lifetime.max_token_age,
            refresh_at: expiry - lifetime.max_refresh_age,
            generation,
        }
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the issuer-stated expiry
    #[inline]
    pub fn expiry(&self) -> UnixTime {
        self.expiry
    }

    /// Gets the first moment at which the token is no longer handed out
    #[inline]
    pub fn valid_until(&self) -> UnixTime {
        self.valid_until
    }

    /// Gets the moment a background renewal is scheduled for
    #[inline]
    pub fn refresh_at(&self) -> UnixTime {
        self.refresh_at
    }

    /// Gets the sequence number of this snapshot
    ///
    /// Every successful refresh publishes a snapshot with a higher generation.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the token may be handed out at `time`
    #[inline]
    pub fn is_valid_at(&self, time: UnixTime) -> bool {
        time < self.valid_until
    }

    /// Whether the token may be handed out according to `clock`
    #[inline]
    pub fn is_valid_with_clock<C: Clock + ?Sized>(&self, clock: &C) -> bool {
        self.is_valid_at(clock.now())
    }

    /// Gets the token's lifecycle status as of the provided time
    #[inline]
    pub fn token_status_at(&self, time: UnixTime) -> TokenStatus {
        if time >= self.valid_until {
            TokenStatus::Stale
        } else if time >= self.refresh_at {
            TokenStatus::RefreshDue
        } else {
            TokenStatus::Fresh
        }
    }

    /// Gets how much longer the token may be handed out as of the provided time
    #[inline]
    pub fn until_invalid_at(&self, time: UnixTime) -> DurationSecs {
        self.valid_until - time
    }

    /// Gets how long until a background renewal is due as of the provided time
    #[inline]
    pub fn until_refresh_at(&self, time: UnixTime) -> DurationSecs {
        self.refresh_at - time
    }
}

/// The safety margins applied to every token's issuer-stated expiry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct TokenLifetime {
    pub(crate) max_token_age: DurationSecs,
    pub(crate) max_refresh_age: DurationSecs,
}
