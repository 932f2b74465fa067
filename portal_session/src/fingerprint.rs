//! Client environment fingerprints
//!
//! A fingerprint is a short digest of a handful of properties of the client
//! environment. It has very little entropy and anyone able to read the
//! session can recompute it, so it is only a tamper signal: a session
//! descriptor replayed from a different environment stops validating. It is
//! not, on its own, a security boundary.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Fingerprint;

/// The observable properties of the environment a client runs in
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnvironment {
    /// The user agent string
    pub user_agent: String,
    /// The preferred language tag
    pub language: String,
    /// Screen width in pixels
    pub screen_width: u32,
    /// Screen height in pixels
    pub screen_height: u32,
    /// Screen colour depth in bits
    pub color_depth: u8,
    /// Offset from UTC in minutes
    pub timezone_offset_minutes: i32,
}

impl ClientEnvironment {
    /// Computes the fingerprint of this environment
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.user_agent.as_bytes());
        hasher.update(b"|");
        hasher.update(self.language.as_bytes());
        hasher.update(
            format!(
                "|{}x{}x{}|{}",
                self.screen_width, self.screen_height, self.color_depth, self.timezone_offset_minutes
            )
            .as_bytes(),
        );
        let digest = hasher.finalize();

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        Fingerprint::new(format!("{:016x}", u64::from_be_bytes(prefix)))
    }
}

/// A source for the current client environment
///
/// The environment is re-read on every validation so that a descriptor
/// carried into a different environment is detected.
pub trait EnvironmentProbe: Send + Sync {
    /// Observes the current environment
    fn environment(&self) -> ClientEnvironment;
}

impl EnvironmentProbe for ClientEnvironment {
    fn environment(&self) -> ClientEnvironment {
        self.clone()
    }
}

impl<T: EnvironmentProbe + ?Sized> EnvironmentProbe for Arc<T> {
    fn environment(&self) -> ClientEnvironment {
        (**self).environment()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desktop() -> ClientEnvironment {
        ClientEnvironment {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64)".to_owned(),
            language: "ko-KR".to_owned(),
            screen_width: 1920,
            screen_height: 1080,
            color_depth: 24,
            timezone_offset_minutes: -540,
        }
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let first = desktop().fingerprint();
        let second = desktop().fingerprint();

        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), 16);
    }

    #[test]
    fn any_property_change_alters_the_fingerprint() {
        let base = desktop().fingerprint();

        let mut moved = desktop();
        moved.timezone_offset_minutes = 0;
        assert_ne!(moved.fingerprint(), base);

        let mut resized = desktop();
        resized.screen_width = 1280;
        assert_ne!(resized.fingerprint(), base);

        let mut other_browser = desktop();
        other_browser.user_agent.push_str(" Firefox/128.0");
        assert_ne!(other_browser.fingerprint(), base);
    }
}
