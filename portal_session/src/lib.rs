//! Client-side session binding for portal clients
//!
//! A [`SessionGuard`] owns a small session record that ties a random session
//! identifier and an anti-forgery token to the environment the client runs
//! in. Requests carry the anti-forgery token, and a session that has outlived
//! its time-to-live or moved to a different environment is discarded.
//!
//! Security-relevant occurrences are reported through the [`events`] module.
//!
//! ```
//! use std::sync::Arc;
//! use portal_session::{
//!     events::{SecurityEventKind, SecurityReporter, TracingSink},
//!     ClientEnvironment, SessionGuard,
//! };
//!
//! let session = Arc::new(SessionGuard::in_memory(ClientEnvironment::default()));
//! let csrf = session.ensure_csrf_token();
//! assert!(session.validate());
//! assert!(session.verify_csrf_token(&csrf));
//!
//! let reporter = SecurityReporter::new(TracingSink, Arc::clone(&session));
//! reporter.report(SecurityEventKind::AccessDenied, serde_json::Value::Null, None);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod events;
mod fingerprint;
mod guard;
mod storage;

pub use braids::*;
pub use fingerprint::{ClientEnvironment, EnvironmentProbe};
pub use guard::{
    InvalidSession, SessionDescriptor, SessionGuard, SessionValidity, DEFAULT_SESSION_TTL,
};
pub use storage::{InMemorySessionStorage, SessionStorage};
