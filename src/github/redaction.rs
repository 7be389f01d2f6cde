//! Secret redaction for host environments that scrub logs.
//!
//! Every newly minted JWT and installation token is handed to a [`SecretSink`] so the
//! host can keep it out of its logs. A sink never fails token issuance; write errors
//! are logged and dropped.

use parking_lot::Mutex;
use std::io::Write;
use tracing::warn;

/// What kind of secret is being registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    PrivateKey,
    BearerAssertion,
    InstallationToken,
}

impl SecretKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretKind::PrivateKey => "private key",
            SecretKind::BearerAssertion => "app JWT",
            SecretKind::InstallationToken => "installation token",
        }
    }
}

/// Receives secrets that must not appear in output.
pub trait SecretSink: Send + Sync {
    fn mask(&self, kind: SecretKind, secret: &str);
}

/// Discards everything. Used outside GitHub Actions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl SecretSink for NoopSink {
    fn mask(&self, _kind: SecretKind, _secret: &str) {}
}

/// Emits `::add-mask::` workflow commands so the Actions runner redacts the value.
pub struct ActionsMaskSink<W: Write + Send> {
    out: Mutex<W>,
}

impl ActionsMaskSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> ActionsMaskSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write + Send> SecretSink for ActionsMaskSink<W> {
    fn mask(&self, kind: SecretKind, secret: &str) {
        let mut out = self.out.lock();
        // The runner matches masks line by line, so multi-line secrets (PEM keys) are
        // registered one line at a time.
        for line in secret.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Err(e) = writeln!(out, "::add-mask::{}", line) {
                warn!(kind = kind.as_str(), error = %e, "Failed to register secret mask");
                return;
            }
        }
        if let Err(e) = out.flush() {
            warn!(kind = kind.as_str(), error = %e, "Failed to flush secret mask");
        }
    }
}
