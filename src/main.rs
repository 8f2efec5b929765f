use cordkit::core::config::ClientConfig;
use cordkit::core::kernel::{HttpMethod, RestClient, RestRequest};
use cordkit::Session;
use serde_json::json;
use tracing::{error, info};

/// Minimal bot: logs in, answers `!ping` with `pong`, stops on Ctrl-C.
///
/// Reads `DISCORD_TOKEN` (and the optional `DISCORD_SHARD_*`,
/// `DISCORD_COMPRESS`, `DISCORD_API_BASE`) from the environment or a
/// `.env` file.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    #[cfg(feature = "env-file")]
    let config = ClientConfig::from_env_auto("DISCORD")?;
    #[cfg(not(feature = "env-file"))]
    let config = ClientConfig::from_env("DISCORD")?;

    let mut session = Session::new(config)?;

    session.set_callback("READY", |ctx, _event| async move {
        let name = ctx
            .cache
            .read()
            .user
            .as_ref()
            .map(|u| u.username.clone())
            .unwrap_or_default();
        info!(user = %name, shard = ?ctx.shard, "Logged in");
    })?;

    session.set_callback("MESSAGE_CREATE", |ctx, event| async move {
        let content = event.data["content"].as_str().unwrap_or_default();
        let Some(channel_id) = event.data["channel_id"].as_str() else {
            return;
        };
        if content.trim() != "!ping" {
            return;
        }

        let request = RestRequest::new(
            HttpMethod::Post,
            format!("/channels/{}/messages", channel_id),
        )
        .map(|r| r.json(json!({ "content": "pong" })));
        match request {
            Ok(request) => {
                if let Err(e) = ctx.rest.request(request).await {
                    error!(channel_id, error = %e, "Reply failed");
                }
            }
            Err(e) => error!(error = %e, "Bad request"),
        }
    })?;

    session.set_default_callback(|_ctx, event| async move {
        tracing::debug!(event = %event.name, seq = ?event.seq, "Event");
    });

    session.connect().await?;

    tokio::select! {
        res = session.wait() => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            session.disconnect().await?;
        }
    }

    Ok(())
}
