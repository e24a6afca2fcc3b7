//! Replay protection for the secure channel.
//!
//! Nonces on a session are strictly increasing. The guard remembers the last
//! accepted nonce and rejects anything not greater than it. Checking and
//! committing are separate steps so a record that later fails (for example on
//! decryption) never moves the window.

use crate::error::{ProtocolError, Result};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct ReplayGuard {
    last_accepted: u32,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with [`ProtocolError::Replay`] unless `nonce` is fresh.
    pub fn check(&self, nonce: u32) -> Result<()> {
        if nonce <= self.last_accepted {
            warn!(
                nonce,
                last = self.last_accepted,
                "Replay detected - nonce not strictly increasing"
            );
            return Err(ProtocolError::Replay {
                nonce,
                last: self.last_accepted,
            });
        }
        Ok(())
    }

    /// Record `nonce` as accepted. Call only after [`check`](Self::check) passed.
    pub fn commit(&mut self, nonce: u32) {
        debug!(nonce, "Nonce accepted");
        self.last_accepted = nonce;
    }

    pub fn last_accepted(&self) -> u32 {
        self.last_accepted
    }

    /// Forget history (new key exchange epoch).
    pub fn reset(&mut self) {
        self.last_accepted = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_detection() {
        let mut guard = ReplayGuard::new();
        assert!(guard.check(1).is_ok());
        guard.commit(1);
        assert!(matches!(
            guard.check(1),
            Err(ProtocolError::Replay { nonce: 1, last: 1 })
        ));
        assert!(guard.check(2).is_ok());
    }

    #[test]
    fn test_zero_never_fresh() {
        let guard = ReplayGuard::new();
        assert!(guard.check(0).is_err());
    }

    #[test]
    fn test_gaps_allowed_but_not_rewind() {
        let mut guard = ReplayGuard::new();
        guard.commit(10);
        assert!(guard.check(5).is_err());
        assert!(guard.check(11).is_ok());
        assert!(guard.check(500).is_ok());
    }

    #[test]
    fn test_check_without_commit_does_not_advance() {
        let guard = ReplayGuard::new();
        assert!(guard.check(3).is_ok());
        assert_eq!(guard.last_accepted(), 0);
    }

    #[test]
    fn test_reset() {
        let mut guard = ReplayGuard::new();
        guard.commit(7);
        guard.reset();
        assert!(guard.check(1).is_ok());
    }
}
