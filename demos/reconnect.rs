//! Watches connection state and re-subscribes from the reconnect callback.
//!
//! Kill the network for a moment while it runs to see the reconnect cycle.
//!
//! ```sh
//! DERIV_APP_ID=1089 RUST_LOG=info cargo run --example reconnect --features tracing
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use deriv_api_client::api::{Client, Endpoint, Listener, Subscription};
use deriv_api_client::ws::config::Config;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn listen(subscription: &Subscription) -> Option<Listener> {
    let listener = subscription.subscribe(|tick| match tick {
        Ok(tick) => info!(tick = ?tick.data()),
        Err(e) => warn!(error = %e, "Tick stream ended"),
    });

    match listener {
        Ok(listener) => Some(listener),
        Err(e) => {
            warn!(error = %e, "Subscribe failed");
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let client = Client::for_endpoint(&Endpoint::from_env()?, Config::default())?;
    let ticks = client.subscribe("ticks", &json!({ "ticks": "R_100" }))?;
    let listener: Arc<Mutex<Option<Listener>>> = Arc::default();

    {
        let ticks = ticks.clone();
        let listener = Arc::clone(&listener);
        client.set_on_connected(move || {
            info!("Connected");
            *listener.lock().unwrap_or_else(|e| e.into_inner()) = listen(&ticks);
        });
    }
    {
        let ticks = ticks.clone();
        let listener = Arc::clone(&listener);
        client.set_on_reconnected(move || {
            info!("Reconnected, subscribing again");
            *listener.lock().unwrap_or_else(|e| e.into_inner()) = listen(&ticks);
        });
    }

    let mut states = client.state_receiver();
    let watch = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            info!(?state, "Connection state");
            if state.is_closed() {
                break;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(60)).await;

    client.shutdown();
    _ = watch.await;
    Ok(())
}
