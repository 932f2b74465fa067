//! Security event reporting
//!
//! Security-relevant occurrences in the client, such as a rejected request or
//! a failed refresh, are described by a [`SecurityEvent`] and handed to a
//! [`SecurityEventSink`]. Recording is fire-and-forget: a sink must never
//! block its caller or fail the operation that produced the event.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use portal_clock::{Clock, System, UnixTime};
use serde::Serialize;
use serde_json::{Map, Value};
use url::Url;

use crate::{CsrfToken, SessionGuard, SessionValidity};

const CSRF_HEADER: &str = "X-CSRF-Token";

const REDACTED_KEYS: [&str; 6] = [
    "token",
    "authorization",
    "cookie",
    "password",
    "secret",
    "csrf",
];

/// The category of a security event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityEventKind {
    /// The client session was missing, expired, or tampered with
    InvalidSession,
    /// The access token could not be refreshed
    RefreshFailed,
    /// A request was refused because of rate limiting
    RateLimitExceeded,
    /// A request targeted an origin that is not allowed
    AccessDenied,
    /// A request carried input that looks like an injection attempt
    SuspiciousInput,
    /// A request was rejected again after a successful refresh
    RepeatedUnauthorized,
}

impl SecurityEventKind {
    /// The event name as a static string
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidSession => "INVALID_SESSION",
            Self::RefreshFailed => "REFRESH_FAILED",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::SuspiciousInput => "SUSPICIOUS_INPUT",
            Self::RepeatedUnauthorized => "REPEATED_UNAUTHORIZED",
        }
    }
}

impl fmt::Display for SecurityEventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ambient information about the client at the time of an event
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    /// The client user agent
    pub user_agent: String,
    /// The URL being requested, if any
    pub url: Option<Url>,
    /// Whether the session validated
    pub session: SessionValidity,
    /// The session anti-forgery token, sent alongside rather than inside the event
    #[serde(skip)]
    pub csrf_token: Option<CsrfToken>,
}

/// A security-relevant occurrence
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    /// When the event occurred
    pub timestamp: UnixTime,
    /// The category of the event
    #[serde(rename = "eventType")]
    pub kind: SecurityEventKind,
    /// Event-specific details
    pub details: Value,
    /// Ambient client information
    pub context: EventContext,
}

/// A destination for security events
pub trait SecurityEventSink: Send + Sync + fmt::Debug {
    /// Records an event without blocking or failing
    fn record(&self, event: SecurityEvent);
}

impl<T: SecurityEventSink + ?Sized> SecurityEventSink for Arc<T> {
    fn record(&self, event: SecurityEvent) {
        (**self).record(event)
    }
}

/// Emits security events as `tracing` events on the `security` target
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl SecurityEventSink for TracingSink {
    fn record(&self, event: SecurityEvent) {
        tracing::warn!(
            target: "security",
            event = event.kind.as_str(),
            details = %event.details,
            url = event.context.url.as_ref().map_or("", Url::as_str),
            session = ?event.context.session,
            timestamp = event.timestamp.0,
            "security event"
        );
    }
}

/// Delivers security events to a remote collection endpoint
///
/// Each event is POSTed as JSON from a spawned task, carrying the session
/// anti-forgery token in the `X-CSRF-Token` header. Delivery failures are
/// logged at debug level and otherwise ignored. Events recorded outside of a
/// tokio runtime are dropped.
#[derive(Clone, Debug)]
pub struct RemoteSink {
    client: reqwest::Client,
    endpoint: Url,
}

impl RemoteSink {
    /// Constructs a sink posting to `endpoint`
    pub fn new(client: reqwest::Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }

    /// The collection endpoint
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl SecurityEventSink for RemoteSink {
    fn record(&self, event: SecurityEvent) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(event = event.kind.as_str(), "no runtime, dropping security event");
            return;
        };

        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        runtime.spawn(async move {
            let mut request = client.post(endpoint).json(&event);
            if let Some(csrf) = &event.context.csrf_token {
                request = request.header(CSRF_HEADER, csrf.as_str());
            }

            let outcome = request
                .send()
                .await
                .and_then(reqwest::Response::error_for_status);

            if let Err(error) = outcome {
                tracing::debug!(event = event.kind.as_str(), %error, "failed to deliver security event");
            }
        });
    }
}

/// Keeps recorded events in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<SecurityEvent>>,
}

impl MemorySink {
    /// Constructs an empty sink
    pub const fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    /// A snapshot of the events recorded so far
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The kinds of the events recorded so far, in order
    pub fn kinds(&self) -> Vec<SecurityEventKind> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| e.kind)
            .collect()
    }
}

impl SecurityEventSink for MemorySink {
    fn record(&self, event: SecurityEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Builds security events from the current session and forwards them to a sink
#[derive(Clone)]
pub struct SecurityReporter {
    sink: Arc<dyn SecurityEventSink>,
    session: Arc<SessionGuard>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl fmt::Debug for SecurityReporter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SecurityReporter")
            .field("sink", &self.sink)
            .field("session", &self.session)
            .finish()
    }
}

impl SecurityReporter {
    /// Constructs a reporter for the given session
    pub fn new<K>(sink: K, session: Arc<SessionGuard>) -> Self
    where
        K: SecurityEventSink + 'static,
    {
        Self {
            sink: Arc::new(sink),
            session,
            clock: Arc::new(System),
        }
    }

    /// Replaces the clock used to timestamp events
    #[must_use]
    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// The session this reporter describes
    pub fn session(&self) -> &Arc<SessionGuard> {
        &self.session
    }

    /// Records an event of the given kind
    ///
    /// Object members of `details` whose keys look like credentials are
    /// masked before the event leaves the reporter.
    pub fn report(&self, kind: SecurityEventKind, details: Value, url: Option<&Url>) {
        let context = EventContext {
            user_agent: self.session.environment().user_agent,
            url: url.cloned(),
            session: self.session.validity(),
            csrf_token: self.session.csrf_token(),
        };

        self.sink.record(SecurityEvent {
            timestamp: self.clock.now(),
            kind,
            details: redact(details),
            context,
        });
    }
}

fn redact(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    let lowered = key.to_ascii_lowercase();
                    if REDACTED_KEYS.iter().any(|k| lowered.contains(k)) {
                        (key, Value::String("[REDACTED]".to_owned()))
                    } else {
                        (key, redact(value))
                    }
                })
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact).collect()),
        other => other,
    }
}
