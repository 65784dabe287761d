#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use deriv_api_client::Result;
use deriv_api_client::api::{ApiError, Client, Response};
use deriv_api_client::error::Kind;
use deriv_api_client::ws::WsError;
use deriv_api_client::ws::config::{Config, ReconnectConfig};
use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

/// Mock Deriv server.
///
/// Records every frame the client sends (keepalive pings are only counted),
/// broadcasts frames to every open connection and can drop all connections
/// without a close handshake.
struct MockServer {
    addr: SocketAddr,
    /// Broadcast frames to ALL connected clients
    message_tx: broadcast::Sender<String>,
    /// Closes every open connection abruptly
    kill_tx: broadcast::Sender<()>,
    /// Frames received from clients, pings excluded
    frame_rx: mpsc::UnboundedReceiver<Value>,
    connections: Arc<AtomicUsize>,
    pings: Arc<AtomicUsize>,
}

impl MockServer {
    /// Start a mock server on a random port.
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (message_tx, _) = broadcast::channel::<String>(100);
        let (kill_tx, _) = broadcast::channel::<()>(4);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Value>();
        let connections = Arc::new(AtomicUsize::new(0));
        let pings = Arc::new(AtomicUsize::new(0));

        let broadcast_tx = message_tx.clone();
        let kill = kill_tx.clone();
        let accepted = Arc::clone(&connections);
        let pinged = Arc::clone(&pings);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };

                let (mut write, mut read) = ws_stream.split();
                let frame_tx = frame_tx.clone();
                let mut msg_rx = broadcast_tx.subscribe();
                let mut kill_rx = kill.subscribe();
                let pinged = Arc::clone(&pinged);
                accepted.fetch_add(1, Ordering::SeqCst);

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        let frame: Value = serde_json::from_str(&text).unwrap();
                                        if frame == json!({ "ping": 1 }) {
                                            pinged.fetch_add(1, Ordering::SeqCst);
                                        } else {
                                            drop(frame_tx.send(frame));
                                        }
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            msg = msg_rx.recv() => {
                                match msg {
                                    Ok(text) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                            _ = kill_rx.recv() => break,
                        }
                    }
                });
            }
        });

        Self {
            addr,
            message_tx,
            kill_tx,
            frame_rx,
            connections,
            pings,
        }
    }

    fn ws_url(&self) -> String {
        format!(
            "ws://{}/websockets/v3?app_id=1089&l=EN&brand=deriv",
            self.addr
        )
    }

    /// Send a frame to all connected clients.
    fn send(&self, frame: &Value) {
        drop(self.message_tx.send(frame.to_string()));
    }

    /// Drop every open connection without a close frame.
    fn drop_connections(&self) {
        drop(self.kill_tx.send(()));
    }

    /// Receive the next non-ping frame.
    async fn recv_frame(&mut self) -> Option<Value> {
        self.recv_frame_within(Duration::from_secs(2)).await
    }

    async fn recv_frame_within(&mut self, wait: Duration) -> Option<Value> {
        timeout(wait, self.frame_rx.recv()).await.ok().flatten()
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

fn config() -> Config {
    Config::builder()
        .reconnect(
            ReconnectConfig::builder()
                .delay(Duration::from_millis(50))
                .build(),
        )
        .build()
}

async fn connected_client(server: &MockServer, config: Config) -> Client {
    let client = Client::new(&server.ws_url(), config).unwrap();
    timeout(Duration::from_secs(2), client.wait_connected())
        .await
        .unwrap()
        .unwrap();
    client
}

type Received = mpsc::UnboundedReceiver<Result<Response>>;

fn channel_consumer() -> (impl Fn(Result<Response>) + Send + Sync + 'static, Received) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |result| {
            drop(tx.send(result));
        },
        rx,
    )
}

async fn next(received: &mut Received) -> Result<Response> {
    timeout(Duration::from_secs(2), received.recv())
        .await
        .unwrap()
        .unwrap()
}

/// Poll `condition` until it holds or two seconds pass.
async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

fn tick(req_id: &Value, subscription_id: &str, quote: f64) -> Value {
    json!({
        "echo_req": { "ticks": "R_100", "subscribe": 1, "req_id": req_id },
        "msg_type": "tick",
        "req_id": req_id,
        "subscription": { "id": subscription_id },
        "tick": { "symbol": "R_100", "quote": quote }
    })
}

mod subscriptions {
    use super::*;

    #[tokio::test]
    async fn identical_subscriptions_share_one_frame_and_fan_out() {
        let mut server = MockServer::start().await;
        let client = connected_client(&server, config()).await;

        let (first, mut first_rx) = channel_consumer();
        let (second, mut second_rx) = channel_consumer();

        let ticks = client.subscribe("ticks", &json!({ "ticks": "R_100" })).unwrap();
        let _first = ticks.subscribe(first).unwrap();
        let _second = client
            .subscribe("ticks", &json!({ "ticks": "R_100" }))
            .unwrap()
            .subscribe(second)
            .unwrap();

        let frame = server.recv_frame().await.unwrap();
        assert_eq!(frame["ticks"], "R_100");
        assert_eq!(frame["subscribe"], 1);
        assert!(frame["req_id"].is_u64());
        assert!(
            server
                .recv_frame_within(Duration::from_millis(200))
                .await
                .is_none(),
            "Second consumer must not send another subscribe frame"
        );
        assert_eq!(client.subscription_count(), 1);

        server.send(&tick(&frame["req_id"], "sub-1", 1234.5));

        for received in [&mut first_rx, &mut second_rx] {
            let tick = next(received).await.unwrap();
            assert_eq!(tick.subscription_id(), Some("sub-1"));
            assert_eq!(tick.data().unwrap()["quote"], 1234.5);
        }
    }

    #[tokio::test]
    async fn streamed_frames_without_req_id_are_routed() {
        let mut server = MockServer::start().await;
        let client = connected_client(&server, config()).await;

        let stream = client
            .subscribe("ticks", &json!({ "ticks": "R_100" }))
            .unwrap()
            .stream()
            .unwrap();
        let mut stream = Box::pin(stream);

        let frame = server.recv_frame().await.unwrap();
        server.send(&tick(&frame["req_id"], "sub-1", 1.0));
        let mut untagged = tick(&Value::Null, "sub-1", 2.0);
        untagged.as_object_mut().unwrap().remove("req_id");
        server.send(&untagged);

        for quote in [1.0, 2.0] {
            let tick = timeout(Duration::from_secs(2), stream.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(tick.data().unwrap()["quote"], quote);
        }
    }

    #[tokio::test]
    async fn last_consumer_out_sends_forget_once() {
        let mut server = MockServer::start().await;
        let client = connected_client(&server, config()).await;

        let ticks = client.subscribe("ticks", &json!({ "ticks": "R_100" })).unwrap();
        let (consumer, mut received) = channel_consumer();
        let listener = ticks.subscribe(consumer).unwrap();
        let stream = ticks.stream().unwrap();
        assert_eq!(listener.id().fingerprint(), ticks.id());

        let frame = server.recv_frame().await.unwrap();
        server.send(&tick(&frame["req_id"], "sub-1", 1.0));
        next(&mut received).await.unwrap();

        listener.unsubscribe();
        assert!(
            server
                .recv_frame_within(Duration::from_millis(200))
                .await
                .is_none(),
            "One consumer is still attached"
        );

        drop(stream);
        let forget = server.recv_frame().await.unwrap();
        assert_eq!(forget, json!({ "forget": "sub-1" }));
        assert_eq!(client.subscription_count(), 0);

        listener.unsubscribe();
        ticks.unsubscribe();
        assert!(
            server
                .recv_frame_within(Duration::from_millis(200))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn unsubscribe_before_ack_forgets_on_first_response() {
        let mut server = MockServer::start().await;
        let client = connected_client(&server, config()).await;

        let (consumer, mut received) = channel_consumer();
        let ticks = client.subscribe("ticks", &json!({ "ticks": "R_100" })).unwrap();
        let _listener = ticks.subscribe(consumer).unwrap();
        let frame = server.recv_frame().await.unwrap();

        client.unsubscribe(ticks.id());
        assert_eq!(client.subscription_count(), 0);

        server.send(&tick(&frame["req_id"], "late", 1.0));
        let forget = server.recv_frame().await.unwrap();
        assert_eq!(forget, json!({ "forget": "late" }));
        assert!(received.try_recv().is_err());
    }

    #[tokio::test]
    async fn server_rejection_fails_consumers() {
        let mut server = MockServer::start().await;
        let client = connected_client(&server, config()).await;

        let (consumer, mut received) = channel_consumer();
        let _listener = client
            .subscribe("ticks", &json!({ "ticks": "NOPE" }))
            .unwrap()
            .subscribe(consumer)
            .unwrap();
        let frame = server.recv_frame().await.unwrap();

        server.send(&json!({
            "echo_req": { "ticks": "NOPE", "subscribe": 1, "req_id": frame["req_id"] },
            "error": { "code": "InvalidSymbol", "message": "Symbol NOPE is invalid." },
            "msg_type": "tick",
            "req_id": frame["req_id"]
        }));

        let err = next(&mut received).await.unwrap_err();
        assert_eq!(err.kind(), Kind::Api);
        assert_eq!(err.downcast_ref::<ApiError>().unwrap().code, "InvalidSymbol");
        assert!(eventually(|| client.subscription_count() == 0).await);
    }
}

mod requests {
    use super::*;

    #[tokio::test]
    async fn response_is_matched_by_req_id() {
        let mut server = MockServer::start().await;
        let client = connected_client(&server, config()).await;

        let request = {
            let client = client.clone();
            tokio::spawn(async move { client.request(&json!({ "time": 1 })).await })
        };

        let frame = server.recv_frame().await.unwrap();
        assert_eq!(frame["time"], 1);
        let req_id = frame["req_id"].clone();

        // Unrelated traffic is ignored
        server.send(&json!({ "msg_type": "time", "time": 1, "req_id": 999_999 }));
        server.send(&json!({
            "echo_req": { "time": 1, "req_id": req_id },
            "msg_type": "time",
            "time": 1_700_000_000,
            "req_id": req_id
        }));

        let response = timeout(Duration::from_secs(2), request)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(response.msg_type, "time");
        assert_eq!(response.data().unwrap(), &json!(1_700_000_000));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_response_is_an_api_error() {
        let mut server = MockServer::start().await;
        let client = connected_client(&server, config()).await;

        let request = {
            let client = client.clone();
            tokio::spawn(async move { client.request(&json!({ "balance": 1 })).await })
        };

        let frame = server.recv_frame().await.unwrap();
        server.send(&json!({
            "error": { "code": "AuthorizationRequired", "message": "Please log in." },
            "msg_type": "balance",
            "req_id": frame["req_id"]
        }));

        let err = timeout(Duration::from_secs(2), request)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), Kind::Api);
        assert_eq!(
            err.downcast_ref::<ApiError>().unwrap().code,
            "AuthorizationRequired"
        );
    }

    #[tokio::test]
    async fn subscriptions_and_requests_never_share_a_req_id() {
        let mut server = MockServer::start().await;
        let client = connected_client(&server, config()).await;

        let _listener = client
            .subscribe("ticks", &json!({ "ticks": "R_100" }))
            .unwrap()
            .subscribe(|_| {})
            .unwrap();
        let subscribe = server.recv_frame().await.unwrap();

        let _request = {
            let client = client.clone();
            tokio::spawn(async move { client.request(&json!({ "time": 1 })).await })
        };
        let request = server.recv_frame().await.unwrap();

        assert_ne!(subscribe["req_id"], request["req_id"]);
    }
}

mod lifecycle {
    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn keepalive_pings_until_shutdown() {
        let server = MockServer::start().await;
        let config = Config::builder()
            .keepalive_interval(Duration::from_millis(100))
            .build();
        let client = connected_client(&server, config).await;

        assert!(eventually(|| server.pings() >= 2).await);

        client.shutdown();
        assert!(eventually(|| client.connection_state().is_closed()).await);
        let pings = server.pings();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(server.pings(), pings);
    }

    #[tokio::test]
    async fn no_ping_before_first_interval() {
        let server = MockServer::start().await;
        let _client = connected_client(&server, config()).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.pings(), 0);
    }

    #[tokio::test]
    async fn on_reconnected_fires_once_per_reopen() {
        let server = MockServer::start().await;
        let client = Client::new(&server.ws_url(), config()).unwrap();

        let (connected, on_connected) = counter();
        let (reconnected, on_reconnected) = counter();
        client.set_on_connected(on_connected);
        client.set_on_reconnected(on_reconnected);

        assert!(eventually(|| connected.load(Ordering::SeqCst) == 1).await);
        assert_eq!(reconnected.load(Ordering::SeqCst), 0);

        for expected in 1..=2 {
            server.drop_connections();
            assert!(eventually(|| reconnected.load(Ordering::SeqCst) == expected).await);
            assert_eq!(server.connections(), expected + 1);
        }

        assert_eq!(connected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn on_connected_runs_immediately_when_open() {
        let server = MockServer::start().await;
        let client = connected_client(&server, config()).await;

        let (connected, on_connected) = counter();
        client.set_on_connected(on_connected);
        assert_eq!(connected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unexpected_close_invalidates_subscriptions_and_requests() {
        let mut server = MockServer::start().await;
        let client = connected_client(&server, config()).await;

        let (consumer, mut received) = channel_consumer();
        let _listener = client
            .subscribe("ticks", &json!({ "ticks": "R_100" }))
            .unwrap()
            .subscribe(consumer)
            .unwrap();
        server.recv_frame().await.unwrap();

        let request = {
            let client = client.clone();
            tokio::spawn(async move { client.request(&json!({ "time": 1 })).await })
        };
        server.recv_frame().await.unwrap();

        server.drop_connections();

        let err = next(&mut received).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WsError>(),
            Some(WsError::ConnectionClosed)
        ));
        let err = timeout(Duration::from_secs(2), request)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WsError>(),
            Some(WsError::ConnectionClosed)
        ));
        assert_eq!(client.subscription_count(), 0);

        // Reconnected, and nothing is re-sent
        assert!(eventually(|| server.connections() == 2).await);
        assert!(
            server
                .recv_frame_within(Duration::from_millis(200))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn resubscribe_on_reconnect_keeps_consumers() {
        let mut server = MockServer::start().await;
        let config = Config::builder()
            .reconnect(
                ReconnectConfig::builder()
                    .delay(Duration::from_millis(50))
                    .build(),
            )
            .resubscribe_on_reconnect(true)
            .build();
        let client = connected_client(&server, config).await;

        let (consumer, mut received) = channel_consumer();
        let _listener = client
            .subscribe("ticks", &json!({ "ticks": "R_100" }))
            .unwrap()
            .subscribe(consumer)
            .unwrap();
        let first = server.recv_frame().await.unwrap();
        server.send(&tick(&first["req_id"], "old", 1.0));
        next(&mut received).await.unwrap();

        server.drop_connections();

        let second = server.recv_frame().await.unwrap();
        assert_eq!(second["ticks"], "R_100");
        assert_ne!(second["req_id"], first["req_id"]);
        assert_eq!(client.subscription_count(), 1);

        server.send(&tick(&second["req_id"], "new", 2.0));
        let tick = next(&mut received).await.unwrap();
        assert_eq!(tick.subscription_id(), Some("new"));
    }

    #[tokio::test]
    async fn shutdown_drops_subscriptions_and_closes() {
        let mut server = MockServer::start().await;
        let client = connected_client(&server, config()).await;

        let (consumer, mut received) = channel_consumer();
        let _listener = client
            .subscribe("ticks", &json!({ "ticks": "R_100" }))
            .unwrap()
            .subscribe(consumer)
            .unwrap();
        server.recv_frame().await.unwrap();

        client.shutdown();

        assert_eq!(client.subscription_count(), 0);
        assert!(eventually(|| client.connection_state().is_closed()).await);
        assert!(received.try_recv().is_err());

        let err = client.request(&json!({ "time": 1 })).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WsError>(),
            Some(WsError::NotConnected)
        ));

        // No reconnect after shutdown
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.connections(), 1);
    }

    #[tokio::test]
    async fn dropping_the_last_clone_disconnects() {
        let server = MockServer::start().await;
        let client = connected_client(&server, config()).await;
        let mut states = client.state_receiver();

        drop(client);

        let closed = timeout(
            Duration::from_secs(2),
            states.wait_for(|state| state.is_closed()),
        )
        .await
        .unwrap();
        assert!(closed.is_ok());
    }
}

mod bounded_reconnect {
    use tokio::sync::oneshot;

    use super::*;

    /// Accepts one connection and stops listening. Closing it leaves nothing
    /// to reconnect to.
    struct SingleUseServer {
        addr: SocketAddr,
        frame_rx: mpsc::UnboundedReceiver<Value>,
        close_tx: Option<oneshot::Sender<()>>,
    }

    impl SingleUseServer {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Value>();
            let (close_tx, mut close_rx) = oneshot::channel::<()>();

            tokio::spawn(async move {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                drop(listener);

                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let (_write, mut read) = ws_stream.split();

                loop {
                    tokio::select! {
                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    drop(frame_tx.send(serde_json::from_str(&text).unwrap()));
                                }
                                Some(Ok(_)) => {}
                                _ => break,
                            }
                        }
                        _ = &mut close_rx => break,
                    }
                }
            });

            Self {
                addr,
                frame_rx,
                close_tx: Some(close_tx),
            }
        }

        fn ws_url(&self) -> String {
            format!("ws://{}/websockets/v3?app_id=1089&l=EN&brand=deriv", self.addr)
        }

        async fn recv_frame(&mut self) -> Option<Value> {
            timeout(Duration::from_secs(2), self.frame_rx.recv())
                .await
                .ok()
                .flatten()
        }

        /// Drop the only connection without a close frame.
        fn close(&mut self) {
            if let Some(close_tx) = self.close_tx.take() {
                drop(close_tx.send(()));
            }
        }
    }

    fn config(resubscribe_on_reconnect: bool) -> Config {
        Config::builder()
            .reconnect(
                ReconnectConfig::builder()
                    .delay(Duration::from_millis(50))
                    .max_attempts(2)
                    .build(),
            )
            .resubscribe_on_reconnect(resubscribe_on_reconnect)
            .build()
    }

    #[tokio::test]
    async fn exhausted_policy_ends_streams_kept_for_resubscribe() {
        let mut server = SingleUseServer::start().await;
        let client = Client::new(&server.ws_url(), config(true)).unwrap();
        timeout(Duration::from_secs(2), client.wait_connected())
            .await
            .unwrap()
            .unwrap();

        let stream = client
            .subscribe("ticks", &json!({ "ticks": "R_100" }))
            .unwrap()
            .stream()
            .unwrap();
        let mut stream = Box::pin(stream);
        server.recv_frame().await.unwrap();

        server.close();

        let item = timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        let err = item.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WsError>(),
            Some(WsError::ConnectionClosed)
        ));
        let end = timeout(Duration::from_secs(2), stream.next()).await.unwrap();
        assert!(end.is_none(), "Stream must end after the terminal error");

        assert!(client.connection_state().is_closed());
        assert_eq!(client.subscription_count(), 0);
        client.wait_connected().await.unwrap_err();
    }

    #[tokio::test]
    async fn exhausted_policy_notifies_consumers_once() {
        let mut server = SingleUseServer::start().await;
        let client = Client::new(&server.ws_url(), config(false)).unwrap();
        timeout(Duration::from_secs(2), client.wait_connected())
            .await
            .unwrap()
            .unwrap();

        let reconnected = Arc::new(AtomicUsize::new(0));
        {
            let reconnected = Arc::clone(&reconnected);
            client.set_on_reconnected(move || {
                reconnected.fetch_add(1, Ordering::SeqCst);
            });
        }

        let (consumer, mut received) = channel_consumer();
        let _listener = client
            .subscribe("ticks", &json!({ "ticks": "R_100" }))
            .unwrap()
            .subscribe(consumer)
            .unwrap();
        server.recv_frame().await.unwrap();

        server.close();

        let err = next(&mut received).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WsError>(),
            Some(WsError::ConnectionClosed)
        ));
        assert!(eventually(|| client.connection_state().is_closed()).await);
        client.wait_connected().await.unwrap_err();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(received.try_recv().is_err(), "Only one terminal notification");
        assert_eq!(reconnected.load(Ordering::SeqCst), 0);
        assert_eq!(client.subscription_count(), 0);
    }
}
