//! Reconnecting WebSocket subscriber for the beacon event stream.
//!
//! Used by log tails and dashboards: maintain a single subscription to
//! the daemon's `/ws` endpoint, hand parsed envelopes to a callback, and
//! ride out daemon restarts with exponential backoff. The type filter is
//! part of the URL so the server does the filtering.

use beacon_protocol::Envelope;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_millis(30_000);
const JITTER_MAX_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub host: String,
    pub port: u16,
    /// Narrow the subscription to one event type; the server filters.
    pub event_type: Option<String>,
    pub reconnect: bool,
    pub base_delay: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4519,
            event_type: None,
            reconnect: true,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

pub fn stream_url(config: &SubscriberConfig) -> String {
    match config.event_type.as_deref() {
        Some(event_type) => format!(
            "ws://{}:{}/ws?type={}",
            config.host, config.port, event_type
        ),
        None => format!("ws://{}:{}/ws", config.host, config.port),
    }
}

/// `min(base · 2^attempt + random(0..1s), 30s)`.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    use rand::Rng;
    let exp_ms = base.as_millis().saturating_mul(1u128 << attempt.min(16));
    let exp_ms = u64::try_from(exp_ms).unwrap_or(u64::MAX);
    let jitter_ms = rand::thread_rng().gen_range(0..JITTER_MAX_MS);
    let capped = exp_ms
        .saturating_add(jitter_ms)
        .min(MAX_RECONNECT_DELAY.as_millis() as u64);
    Duration::from_millis(capped)
}

/// A live subscription. Dropping without [`Subscriber::close`] leaves the
/// background task running until the runtime shuts down.
pub struct Subscriber {
    closed: Arc<AtomicBool>,
    attempts: Arc<AtomicU32>,
    task: JoinHandle<()>,
}

impl Subscriber {
    /// Start the subscription loop on the current runtime.
    pub fn spawn(
        config: SubscriberConfig,
        on_event: impl Fn(Envelope) + Send + Sync + 'static,
        on_error: impl Fn(String) + Send + Sync + 'static,
    ) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let attempts = Arc::new(AtomicU32::new(0));
        let task = tokio::spawn(run_loop(
            config,
            Arc::clone(&closed),
            Arc::clone(&attempts),
            Box::new(on_event),
            Box::new(on_error),
        ));
        Self {
            closed,
            attempts,
            task,
        }
    }

    /// Consecutive failed attempts since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Terminal: cancels any pending reconnect timer and closes the
    /// socket. No callbacks fire afterwards.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

async fn run_loop(
    config: SubscriberConfig,
    closed: Arc<AtomicBool>,
    attempts: Arc<AtomicU32>,
    on_event: Box<dyn Fn(Envelope) + Send + Sync>,
    on_error: Box<dyn Fn(String) + Send + Sync>,
) {
    let url = stream_url(&config);

    loop {
        if closed.load(Ordering::SeqCst) {
            return;
        }

        match connect_async(url.as_str()).await {
            Ok((mut stream, _)) => {
                debug!(url = %url, "Subscription open");
                attempts.store(0, Ordering::Relaxed);

                while let Some(frame) = stream.next().await {
                    if closed.load(Ordering::SeqCst) {
                        return;
                    }
                    match frame {
                        Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                            Ok(envelope) => on_event(envelope),
                            // A bad frame is surfaced but does not cost us
                            // the connection.
                            Err(err) => on_error(format!("failed to parse event frame: {}", err)),
                        },
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            on_error(format!("stream error: {}", err));
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                on_error(format!("connect to {} failed: {}", url, err));
            }
        }

        if !config.reconnect || closed.load(Ordering::SeqCst) {
            return;
        }

        let attempt = attempts.fetch_add(1, Ordering::Relaxed);
        let delay = backoff_delay(config.base_delay, attempt);
        debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Reconnecting");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
    use axum::routing::get;
    use axum::Router;
    use beacon_protocol::{create_event, EventContext, Source};
    use serde_json::Map;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn test_envelope(event_type: &str) -> Envelope {
        let ctx = EventContext {
            app: "claude-code".to_string(),
            app_root: "/repo".to_string(),
            source: Source::Cli,
            correlation_id: None,
        };
        create_event(event_type, Map::new(), &ctx)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    #[test]
    fn stream_url_carries_the_filter() {
        let mut config = SubscriberConfig {
            host: "127.0.0.1".to_string(),
            port: 4519,
            ..SubscriberConfig::default()
        };
        assert_eq!(stream_url(&config), "ws://127.0.0.1:4519/ws");

        config.event_type = Some("worktree.deleted".to_string());
        assert_eq!(
            stream_url(&config),
            "ws://127.0.0.1:4519/ws?type=worktree.deleted"
        );
    }

    #[test]
    fn backoff_grows_monotonically_to_the_cap() {
        let base = Duration::from_millis(1000);
        let mut previous_floor = 0u64;

        for attempt in 0..6 {
            let floor = 1000u64 << attempt;
            for _ in 0..50 {
                let delay = backoff_delay(base, attempt).as_millis() as u64;
                assert!(delay >= floor.min(30_000), "attempt {}: {}", attempt, delay);
                assert!(
                    delay < (floor + JITTER_MAX_MS).min(30_001),
                    "attempt {}: {}",
                    attempt,
                    delay
                );
            }
            assert!(floor >= previous_floor);
            previous_floor = floor;
        }

        // Far past the cap the delay is pinned to it.
        assert_eq!(
            backoff_delay(base, 12),
            MAX_RECONNECT_DELAY,
        );
    }

    async fn spawn_ws_server(behavior: fn(WebSocket) -> futures::future::BoxFuture<'static, ()>) -> u16 {
        let router = Router::new().route(
            "/ws",
            get(move |ws: WebSocketUpgrade| async move {
                ws.on_upgrade(move |socket| behavior(socket))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let port = listener.local_addr().expect("local addr").port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        port
    }

    #[tokio::test]
    async fn events_flow_and_bad_frames_keep_the_connection() {
        fn feed(mut socket: WebSocket) -> futures::future::BoxFuture<'static, ()> {
            Box::pin(async move {
                let first = serde_json::to_string(&test_envelope("a.one")).expect("serialize");
                let second = serde_json::to_string(&test_envelope("a.two")).expect("serialize");
                let _ = socket.send(AxumMessage::Text(first)).await;
                let _ = socket.send(AxumMessage::Text("{not json".to_string())).await;
                let _ = socket.send(AxumMessage::Text(second)).await;
                // Hold the socket open so the client does not reconnect.
                tokio::time::sleep(Duration::from_secs(5)).await;
            })
        }

        let port = spawn_ws_server(feed).await;

        let events = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(AtomicUsize::new(0));
        let events_sink = Arc::clone(&events);
        let errors_sink = Arc::clone(&errors);

        let subscriber = Subscriber::spawn(
            SubscriberConfig {
                port,
                ..SubscriberConfig::default()
            },
            move |envelope| events_sink.lock().unwrap().push(envelope.event_type),
            move |_| {
                errors_sink.fetch_add(1, Ordering::Relaxed);
            },
        );

        assert!(
            wait_until(
                || events.lock().unwrap().len() == 2,
                Duration::from_secs(5)
            )
            .await
        );
        assert_eq!(*events.lock().unwrap(), vec!["a.one", "a.two"]);
        assert_eq!(errors.load(Ordering::Relaxed), 1);
        assert_eq!(subscriber.attempts(), 0);

        subscriber.close();
    }

    #[tokio::test]
    async fn reconnects_with_backoff_until_closed() {
        fn slam(mut socket: WebSocket) -> futures::future::BoxFuture<'static, ()> {
            Box::pin(async move {
                let _ = socket.send(AxumMessage::Close(None)).await;
            })
        }

        let port = spawn_ws_server(slam).await;

        let errors = Arc::new(AtomicUsize::new(0));
        let errors_sink = Arc::clone(&errors);
        let subscriber = Subscriber::spawn(
            SubscriberConfig {
                port,
                base_delay: Duration::from_millis(10),
                ..SubscriberConfig::default()
            },
            |_| {},
            move |_| {
                errors_sink.fetch_add(1, Ordering::Relaxed);
            },
        );

        // Every accepted connection is slammed shut, so the loop keeps
        // coming back.
        let reconnected = wait_until(|| subscriber.attempts() >= 1, Duration::from_secs(5)).await;
        assert!(reconnected);

        subscriber.close();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let attempts_after_close = subscriber.attempts();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(subscriber.attempts(), attempts_after_close);
    }

    #[tokio::test]
    async fn connect_failure_surfaces_and_retries() {
        // Nothing listens on this port.
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("probe");
            probe.local_addr().expect("local addr").port()
        };

        let errors = Arc::new(AtomicUsize::new(0));
        let errors_sink = Arc::clone(&errors);
        let subscriber = Subscriber::spawn(
            SubscriberConfig {
                port,
                base_delay: Duration::from_millis(10),
                ..SubscriberConfig::default()
            },
            |_| {},
            move |_| {
                errors_sink.fetch_add(1, Ordering::Relaxed);
            },
        );

        assert!(wait_until(|| errors.load(Ordering::Relaxed) >= 2, Duration::from_secs(5)).await);
        assert!(subscriber.attempts() >= 1);
        subscriber.close();
    }
}
