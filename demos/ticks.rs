//! Streams `R_100` ticks to two consumers over one server-side subscription.
//!
//! Also issues a one-shot `time` request while the stream is running.
//!
//! Run with tracing enabled:
//! ```sh
//! DERIV_APP_ID=1089 RUST_LOG=info,deriv_api_client=debug cargo run --example ticks --features tracing
//! ```

use std::time::Duration;

use deriv_api_client::api::{Client, Endpoint};
use deriv_api_client::ws::config::Config;
use futures::StreamExt as _;
use serde_json::json;
use tokio::time::timeout;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let endpoint = Endpoint::from_env()?;
    let url = endpoint.url()?;
    info!(%url, "Connecting");
    let client = Client::for_endpoint(&endpoint, Config::default())?;
    client.wait_connected().await?;

    let ticks = client.subscribe("ticks", &json!({ "ticks": "R_100" }))?;
    info!(id = %ticks.id(), "Subscribing");

    let listener = ticks.subscribe(|tick| match tick {
        Ok(tick) => info!(consumer = "callback", tick = ?tick.data()),
        Err(e) => debug!(consumer = "callback", error = %e),
    })?;

    let mut stream = Box::pin(ticks.stream()?);
    info!(subscriptions = client.subscription_count(), "Two consumers attached");

    let time = client.request(&json!({ "time": 1 })).await?;
    info!(endpoint = "time", time = ?time.data());

    let mut count = 0;
    while let Ok(Some(result)) = timeout(Duration::from_secs(10), stream.next()).await {
        match result {
            Ok(tick) => {
                info!(consumer = "stream", tick = ?tick.data());
                count += 1;
                if count >= 5 {
                    break;
                }
            }
            Err(e) => {
                debug!(consumer = "stream", error = %e);
                break;
            }
        }
    }
    info!(received = count);

    drop(stream);
    listener.unsubscribe();
    info!(subscriptions = client.subscription_count(), "Unsubscribed");

    client.shutdown();
    Ok(())
}
