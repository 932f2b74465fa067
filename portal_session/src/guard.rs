use std::{fmt, sync::Arc};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use portal_clock::{Clock, DurationSecs, System, UnixTime};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    CsrfToken, CsrfTokenRef, EnvironmentProbe, Fingerprint, InMemorySessionStorage, SessionId,
    SessionStorage,
};

/// How long a session stays valid after creation
pub const DEFAULT_SESSION_TTL: DurationSecs = DurationSecs(24 * 60 * 60);

const CSRF_TOKEN_BYTES: usize = 32;

/// The client-side session record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    /// The random session identifier
    pub session_id: SessionId,
    /// When the session was created
    pub created_at: UnixTime,
    /// The fingerprint of the environment the session was created in
    pub fingerprint: Fingerprint,
    /// The anti-forgery token bound to this session
    pub csrf_token: CsrfToken,
}

/// The reason a session failed validation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum InvalidSession {
    /// No session is stored
    #[error("no session is present")]
    Missing,
    /// The session is older than its time-to-live
    #[error("session has expired")]
    Expired,
    /// The session was created in a different environment
    #[error("session fingerprint does not match the current environment")]
    FingerprintMismatch,
}

/// Whether a session is usable, without the reason
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionValidity {
    /// The session validates
    Valid,
    /// The session is missing, expired, or tampered with
    Invalid,
}

/// Creates, validates, and destroys the client-side session
///
/// A session binds a random identifier and an anti-forgery token to the
/// environment it was created in. Validation fails once the session is
/// older than its time-to-live or the environment no longer matches, and
/// any failed validation removes the stored session.
pub struct SessionGuard {
    storage: Arc<dyn SessionStorage>,
    probe: Arc<dyn EnvironmentProbe>,
    clock: Arc<dyn Clock + Send + Sync>,
    ttl: DurationSecs,
}

impl fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionGuard")
            .field("ttl", &self.ttl)
            .field("valid", &self.validity())
            .finish()
    }
}

impl SessionGuard {
    /// Constructs a guard over the given storage and environment
    pub fn new<St, P>(storage: St, probe: P) -> Self
    where
        St: SessionStorage + 'static,
        P: EnvironmentProbe + 'static,
    {
        Self {
            storage: Arc::new(storage),
            probe: Arc::new(probe),
            clock: Arc::new(System),
            ttl: DEFAULT_SESSION_TTL,
        }
    }

    /// Constructs a guard backed by in-memory storage
    pub fn in_memory<P>(probe: P) -> Self
    where
        P: EnvironmentProbe + 'static,
    {
        Self::new(InMemorySessionStorage::new(), probe)
    }

    /// Replaces the clock used to age sessions
    #[must_use]
    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Replaces the session time-to-live
    #[must_use]
    pub fn with_ttl(mut self, ttl: DurationSecs) -> Self {
        self.ttl = ttl;
        self
    }

    /// The session time-to-live
    pub fn ttl(&self) -> DurationSecs {
        self.ttl
    }

    /// The environment as currently observed
    pub fn environment(&self) -> crate::ClientEnvironment {
        self.probe.environment()
    }

    /// Creates a fresh session, replacing any existing one
    pub fn generate(&self) -> SessionId {
        let descriptor = self.create();
        let session_id = descriptor.session_id.clone();
        let created_at = descriptor.created_at;
        self.storage.store(descriptor);
        tracing::debug!(created_at = created_at.0, "created session");
        session_id
    }

    /// Validates the stored session
    ///
    /// On failure the stored session is removed before the reason is
    /// returned.
    pub fn check(&self) -> Result<(), InvalidSession> {
        let outcome = self.evaluate();
        if let Err(reason) = outcome {
            if reason != InvalidSession::Missing {
                tracing::warn!(%reason, "discarding invalid session");
            }
            self.storage.remove();
        }
        outcome
    }

    /// Validates the stored session, discarding it if invalid
    pub fn validate(&self) -> bool {
        self.check().is_ok()
    }

    /// Reports whether the stored session would validate without removing it
    pub fn validity(&self) -> SessionValidity {
        match self.evaluate() {
            Ok(()) => SessionValidity::Valid,
            Err(_) => SessionValidity::Invalid,
        }
    }

    /// The anti-forgery token of the stored session, if one exists
    pub fn csrf_token(&self) -> Option<CsrfToken> {
        self.storage.load().map(|d| d.csrf_token)
    }

    /// Returns the anti-forgery token of a valid session
    ///
    /// If the stored session is missing or invalid, a new session is created
    /// first.
    pub fn ensure_csrf_token(&self) -> CsrfToken {
        if self.check().is_ok() {
            if let Some(descriptor) = self.storage.load() {
                return descriptor.csrf_token;
            }
        }

        let descriptor = self.create();
        let csrf_token = descriptor.csrf_token.clone();
        tracing::debug!(created_at = descriptor.created_at.0, "created session");
        self.storage.store(descriptor);
        csrf_token
    }

    /// Checks a presented anti-forgery token against the stored session
    pub fn verify_csrf_token(&self, presented: &CsrfTokenRef) -> bool {
        self.storage
            .load()
            .map_or(false, |d| d.csrf_token.as_str() == presented.as_str())
    }

    /// Removes the stored session
    pub fn clear(&self) {
        self.storage.remove();
    }

    fn evaluate(&self) -> Result<(), InvalidSession> {
        let descriptor = self.storage.load().ok_or(InvalidSession::Missing)?;

        if self.clock.now() - descriptor.created_at > self.ttl {
            return Err(InvalidSession::Expired);
        }

        if self.probe.environment().fingerprint() != descriptor.fingerprint {
            return Err(InvalidSession::FingerprintMismatch);
        }

        Ok(())
    }

    fn create(&self) -> SessionDescriptor {
        SessionDescriptor {
            session_id: SessionId::new(uuid::Uuid::new_v4().to_string()),
            created_at: self.clock.now(),
            fingerprint: self.probe.environment().fingerprint(),
            csrf_token: generate_csrf_token(),
        }
    }
}

fn generate_csrf_token() -> CsrfToken {
    let mut bytes = [0u8; CSRF_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    CsrfToken::new(URL_SAFE_NO_PAD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use portal_clock::TestClock;

    use super::*;
    use crate::ClientEnvironment;

    #[derive(Debug)]
    struct SwappableEnvironment(Mutex<ClientEnvironment>);

    impl SwappableEnvironment {
        fn swap(&self, env: ClientEnvironment) {
            *self.0.lock().unwrap() = env;
        }
    }

    impl EnvironmentProbe for SwappableEnvironment {
        fn environment(&self) -> ClientEnvironment {
            self.0.lock().unwrap().clone()
        }
    }

    fn laptop() -> ClientEnvironment {
        ClientEnvironment {
            user_agent: "Mozilla/5.0 (Macintosh)".to_owned(),
            language: "en-US".to_owned(),
            screen_width: 1440,
            screen_height: 900,
            color_depth: 30,
            timezone_offset_minutes: 480,
        }
    }

    fn guard_at(clock: &TestClock) -> SessionGuard {
        SessionGuard::in_memory(laptop()).with_clock(clock.clone())
    }

    #[test]
    fn missing_session_is_invalid() {
        let guard = guard_at(&TestClock::new(UnixTime(1_000)));

        assert_eq!(guard.check(), Err(InvalidSession::Missing));
        assert!(guard.csrf_token().is_none());
    }

    #[test]
    fn generated_session_validates() {
        let guard = guard_at(&TestClock::new(UnixTime(1_000)));
        guard.generate();

        assert!(guard.validate());
        assert_eq!(guard.validity(), SessionValidity::Valid);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn session_identifiers_stay_out_of_logs() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let guard = guard_at(&TestClock::new(UnixTime(1_000)));
        let session_id = tracing::subscriber::with_default(subscriber, || {
            let session_id = guard.generate();
            guard.clear();
            guard.ensure_csrf_token();
            session_id
        });
        let regenerated = guard.storage.load().unwrap().session_id;

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("created session"));
        assert!(!output.contains(session_id.as_str()));
        assert!(!output.contains(regenerated.as_str()));
    }

    #[test]
    fn sessions_get_distinct_identifiers_and_tokens() {
        let guard = guard_at(&TestClock::new(UnixTime(1_000)));

        let first_id = guard.generate();
        let first_csrf = guard.csrf_token().unwrap();
        let second_id = guard.generate();
        let second_csrf = guard.csrf_token().unwrap();

        assert_ne!(first_id, second_id);
        assert_ne!(first_csrf, second_csrf);
        assert_eq!(first_csrf.as_str().len(), 43);
    }

    #[test]
    fn csrf_token_is_redacted_in_logs() {
        let guard = guard_at(&TestClock::new(UnixTime(1_000)));
        let csrf = guard.ensure_csrf_token();

        assert_eq!(format!("{:?}", csrf), "***CSRF TOKEN***");
        assert_eq!(format!("{}", csrf), "***CSRF TOKEN***");
    }

    mod when_the_session_ages {
        use super::*;

        #[test]
        fn is_valid_at_exactly_the_ttl() {
            let clock = TestClock::new(UnixTime(1_000));
            let guard = guard_at(&clock);
            guard.generate();

            clock.inc(DEFAULT_SESSION_TTL.0);

            assert!(guard.validate());
        }

        #[test]
        fn expires_after_the_ttl_and_is_removed() {
            let clock = TestClock::new(UnixTime(1_000));
            let guard = guard_at(&clock);
            guard.generate();

            clock.inc(DEFAULT_SESSION_TTL.0 + 1);

            assert_eq!(guard.validity(), SessionValidity::Invalid);
            assert_eq!(guard.check(), Err(InvalidSession::Expired));
            assert_eq!(guard.check(), Err(InvalidSession::Missing));
        }

        #[test]
        fn custom_ttl_is_honoured() {
            let clock = TestClock::new(UnixTime(1_000));
            let guard = guard_at(&clock).with_ttl(DurationSecs(60));
            guard.generate();

            clock.inc(61);

            assert_eq!(guard.check(), Err(InvalidSession::Expired));
        }
    }

    mod when_the_environment_changes {
        use super::*;

        #[test]
        fn session_is_rejected_and_removed() {
            let env = Arc::new(SwappableEnvironment(Mutex::new(laptop())));
            let guard = SessionGuard::in_memory(Arc::clone(&env));
            guard.generate();

            let mut travelling = laptop();
            travelling.timezone_offset_minutes = -60;
            env.swap(travelling);

            assert_eq!(guard.check(), Err(InvalidSession::FingerprintMismatch));
            assert!(guard.csrf_token().is_none());
        }

        #[test]
        fn ensure_csrf_token_starts_a_new_session() {
            let env = Arc::new(SwappableEnvironment(Mutex::new(laptop())));
            let guard = SessionGuard::in_memory(Arc::clone(&env));
            let original = guard.ensure_csrf_token();

            let mut external = laptop();
            external.screen_width = 3840;
            env.swap(external);

            let replacement = guard.ensure_csrf_token();
            assert_ne!(original, replacement);
            assert!(guard.validate());
        }
    }

    #[test]
    fn ensure_csrf_token_is_stable_for_a_valid_session() {
        let guard = guard_at(&TestClock::new(UnixTime(1_000)));

        let first = guard.ensure_csrf_token();
        let second = guard.ensure_csrf_token();

        assert_eq!(first, second);
    }

    #[test]
    fn presented_tokens_are_verified() {
        let guard = guard_at(&TestClock::new(UnixTime(1_000)));
        let csrf = guard.ensure_csrf_token();

        assert!(guard.verify_csrf_token(&csrf));
        assert!(!guard.verify_csrf_token(CsrfTokenRef::from_static("forged")));
    }

    #[test]
    fn clear_removes_the_session() {
        let guard = guard_at(&TestClock::new(UnixTime(1_000)));
        guard.generate();

        guard.clear();

        assert_eq!(guard.check(), Err(InvalidSession::Missing));
    }

    #[test]
    fn shared_storage_sees_the_same_session() {
        let storage = Arc::new(InMemorySessionStorage::new());
        let first = SessionGuard::new(Arc::clone(&storage), laptop());
        let second = SessionGuard::new(Arc::clone(&storage), laptop());

        let csrf = first.ensure_csrf_token();

        assert_eq!(second.csrf_token(), Some(csrf));
    }
}
