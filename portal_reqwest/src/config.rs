use std::{sync::Arc, time::Duration};

use portal_clock::DurationSecs;
use portal_session::events::{RemoteSink, SecurityEventSink, TracingSink};
use portal_tokens::RefreshConfig;
use reqwest::Url;

use crate::{AllowedOrigins, Mode, RateLimiter};

/// Settings for a portal client
///
/// Every option can be supplied on the command line or through the
/// environment.
#[derive(Clone, Debug, clap::Parser)]
#[command(about = "Portal client settings")]
pub struct PortalConfig {
    /// Base URL of the authentication service
    #[arg(long, env)]
    pub auth_server_url: Url,

    /// Base URL of the authorization service
    #[arg(long, env)]
    pub authz_server_url: Url,

    /// Base URL of the portal service
    #[arg(long, env)]
    pub portal_server_url: Url,

    /// The access token refresh endpoint
    #[arg(long, env)]
    pub refresh_url: Url,

    /// Seconds before expiry at which the access token is refreshed
    #[arg(long, env, default_value_t = 300)]
    pub refresh_margin_secs: u64,

    /// Hosts that requests may be sent to, subdomains included
    #[arg(long, env, value_delimiter = ',', default_value = "localhost")]
    pub allowed_origins: Vec<String>,

    /// Requests allowed to any one host per window
    #[arg(long, env, default_value_t = 100)]
    pub rate_limit_max_requests: usize,

    /// Length of the rate limit window in seconds
    #[arg(long, env, default_value_t = 60)]
    pub rate_limit_window_secs: u64,

    /// Whether errors and security events are reported for developers or end users
    #[arg(long, env = "PORTAL_MODE", value_enum, default_value_t = Mode::Development)]
    pub mode: Mode,

    /// Endpoint that collects security events in production
    #[arg(long, env)]
    pub security_log_url: Option<Url>,
}

impl PortalConfig {
    /// Token refresh timing
    pub fn refresh_config(&self) -> RefreshConfig {
        RefreshConfig::new(
            DurationSecs(self.refresh_margin_secs),
            RefreshConfig::default().min_refresh_interval(),
        )
    }

    /// The origin allow-list
    pub fn allowed_origins(&self) -> AllowedOrigins {
        AllowedOrigins::new(&self.allowed_origins)
    }

    /// A fresh client-side rate limiter
    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(
            self.rate_limit_max_requests,
            Duration::from_secs(self.rate_limit_window_secs),
        )
    }

    /// The destination for security events
    ///
    /// Production clients with a collection endpoint deliver events
    /// remotely. Everything else logs them locally.
    pub fn security_sink(&self, client: &reqwest::Client) -> Arc<dyn SecurityEventSink> {
        match (self.mode, &self.security_log_url) {
            (Mode::Production, Some(endpoint)) => {
                Arc::new(RemoteSink::new(client.clone(), endpoint.clone()))
            }
            (Mode::Production, None) => {
                tracing::warn!("no security log endpoint configured, logging security events locally");
                Arc::new(TracingSink)
            }
            (Mode::Development, _) => Arc::new(TracingSink),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    const REQUIRED: [&str; 9] = [
        "portal",
        "--auth-server-url",
        "https://auth.example.com",
        "--authz-server-url",
        "https://authz.example.com",
        "--portal-server-url",
        "https://portal.example.com",
        "--refresh-url",
        "https://auth.example.com/auth/refresh",
    ];

    #[test]
    fn defaults_apply() {
        let config = PortalConfig::try_parse_from(REQUIRED).unwrap();

        assert_eq!(config.refresh_config().refresh_margin(), DurationSecs(300));
        assert_eq!(config.allowed_origins().hosts(), ["localhost"]);
        assert_eq!(config.rate_limiter().limit(), 100);
        assert_eq!(config.rate_limiter().window(), Duration::from_secs(60));
        assert_eq!(config.mode, Mode::Development);
        assert_eq!(config.security_log_url, None);
    }

    #[test]
    fn origins_are_comma_separated() {
        let config = PortalConfig::try_parse_from(
            REQUIRED
                .into_iter()
                .chain(["--allowed-origins", "example.com,https://partner.example.org"]),
        )
        .unwrap();

        assert_eq!(
            config.allowed_origins().hosts(),
            ["example.com", "partner.example.org"]
        );
    }

    #[test]
    fn production_mode_is_parsed() {
        let config = PortalConfig::try_parse_from(
            REQUIRED.into_iter().chain([
                "--mode",
                "production",
                "--security-log-url",
                "https://portal.example.com/api/security-log",
            ]),
        )
        .unwrap();

        assert_eq!(config.mode, Mode::Production);
        let sink = config.security_sink(&reqwest::Client::new());
        assert!(format!("{:?}", sink).contains("RemoteSink"));
    }

    #[test]
    fn base_urls_are_required() {
        assert!(PortalConfig::try_parse_from(["portal"]).is_err());
    }
}
