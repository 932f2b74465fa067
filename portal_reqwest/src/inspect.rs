//! Outbound input inspection

use reqwest::Url;

const SUSPICIOUS_PATTERNS: [&str; 8] = [
    "<script",
    "</script",
    "javascript:",
    "vbscript:",
    "data:text/html",
    "onerror=",
    "onload=",
    "<iframe",
];

/// A query parameter whose value looks like an injection attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SuspiciousParameter {
    pub(crate) name: String,
}

/// Finds the first query parameter carrying markup, script URLs, or control characters
///
/// Names and values are inspected after percent-decoding.
pub(crate) fn find_suspicious_parameter(url: &Url) -> Option<SuspiciousParameter> {
    url.query_pairs()
        .find(|(name, value)| is_suspicious(name) || is_suspicious(value))
        .map(|(name, _)| SuspiciousParameter {
            name: name.into_owned(),
        })
}

fn is_suspicious(input: &str) -> bool {
    if input
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
    {
        return true;
    }

    let lowered = input.to_ascii_lowercase();
    SUSPICIOUS_PATTERNS.iter().any(|p| lowered.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inspect(url: &str) -> Option<String> {
        find_suspicious_parameter(&Url::parse(url).unwrap()).map(|p| p.name)
    }

    #[test]
    fn ordinary_queries_pass() {
        assert_eq!(inspect("https://portal.example.com/api/users?page=2&q=kim%20min"), None);
        assert_eq!(inspect("https://portal.example.com/api/users"), None);
    }

    #[test]
    fn encoded_markup_is_detected() {
        assert_eq!(
            inspect("https://portal.example.com/search?q=%3CScript%3Ealert(1)%3C%2Fscript%3E"),
            Some("q".to_owned())
        );
    }

    #[test]
    fn script_urls_are_detected() {
        assert_eq!(
            inspect("https://portal.example.com/r?next=JavaScript:alert(1)"),
            Some("next".to_owned())
        );
    }

    #[test]
    fn nul_bytes_are_detected_in_names() {
        assert_eq!(
            inspect("https://portal.example.com/r?id%00=1"),
            Some("id\0".to_owned())
        );
    }
}
