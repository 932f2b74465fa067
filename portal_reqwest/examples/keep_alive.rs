use clap::Parser;
use portal_reqwest::{ApiError, PortalClient, PortalConfig, Service};
use portal_session::ClientEnvironment;
use portal_tokens::{AccessToken, TokenEvent, TokenStatus};
use std::time::Duration;
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    #[command(flatten)]
    portal: PortalConfig,

    /// An access token obtained at login
    #[arg(long, env, hide_env_values = true)]
    access_token: String,

    /// The portal path to poll
    #[arg(long, env, default_value = "/users/me")]
    poll_path: String,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let environment = ClientEnvironment {
        user_agent: format!("portal-keep-alive/{}", env!("CARGO_PKG_VERSION")),
        language: "en-US".to_owned(),
        ..ClientEnvironment::default()
    };

    let client = PortalClient::from_config(&opts.portal, environment)?;
    client.sign_in(AccessToken::new(opts.access_token))?;

    let mut events = client.tokens().store().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                TokenEvent::Updated => tracing::info!("access token replaced"),
                TokenEvent::Cleared => tracing::info!("access token cleared"),
                TokenEvent::Expired => tracing::warn!("session expired, sign in again"),
            }
        }
    });

    let mut interval = time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;

        if let Some(token) = client.tokens().store().get() {
            let decoded = portal_tokens::DecodedToken::decode(token)?;
            let status = decoded.token_status(client.tokens().config().refresh_margin());
            match status {
                TokenStatus::Fresh => {
                    tracing::debug!(?status, expiry = decoded.expiry().0, "held token")
                }
                TokenStatus::ExpiringSoon => {
                    tracing::warn!(?status, expiry = decoded.expiry().0, "held token")
                }
                TokenStatus::Expired => {
                    tracing::error!(?status, expiry = decoded.expiry().0, "held token")
                }
            }
        }

        match client
            .get_json::<serde_json::Value>(Service::Portal, &opts.poll_path)
            .await
        {
            Ok(body) => tracing::info!(%body, "polled portal"),
            Err(ApiError::ReauthenticationRequired) => {
                tracing::error!("session ended");
                break;
            }
            Err(err) if err.should_notify() => {
                tracing::warn!(message = %err.user_message(client.mode()), "request failed")
            }
            Err(err) => tracing::debug!(error = %err, "request rejected"),
        }
    }

    Ok(())
}
