//! Time source and validity-window helpers shared by the JWT signer and the token broker.

use chrono::{DateTime, Duration, DurationRound, Utc};

/// A cached bearer JWT is reused only while it has at least this long left.
pub const BEARER_GRACE: Duration = Duration::seconds(30);

/// How far in the past a new JWT's `iat` is placed, to tolerate clock drift with GitHub.
pub const BEARER_BACKDATE: Duration = Duration::seconds(30);

/// Lifetime of a new JWT, counted from its back-dated `iat`.
pub const BEARER_LIFETIME: Duration = Duration::seconds(120);

/// A cached installation token is reused only while it has at least this long left.
pub const TOKEN_GRACE: Duration = Duration::seconds(60);

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// True when a credential expiring at `expires_at` still has `grace` left at `now`.
pub fn is_fresh(expires_at: DateTime<Utc>, now: DateTime<Utc>, grace: Duration) -> bool {
    match now.checked_add_signed(grace) {
        Some(deadline) => deadline <= expires_at,
        None => false,
    }
}

/// Drop sub-second precision; JWT `NumericDate`s are whole seconds.
pub fn truncate_to_seconds(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant
        .duration_trunc(Duration::seconds(1))
        .unwrap_or(instant)
}
