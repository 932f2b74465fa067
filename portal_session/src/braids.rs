use aliri_braid::braid;
use std::fmt;

/// An identifier for a client-side session
#[braid(serde)]
pub struct SessionId;

/// A per-session anti-forgery token sent with every request
#[braid(serde, debug = "owned", display = "owned")]
pub struct CsrfToken;

impl fmt::Debug for CsrfTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("***CSRF TOKEN***")
    }
}

impl fmt::Display for CsrfTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("***CSRF TOKEN***")
    }
}

/// A digest of the client environment a session was created in
#[braid(serde)]
pub struct Fingerprint;
