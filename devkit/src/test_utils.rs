/*!
Shared helpers for async tests: tracing setup and polling waits.
*/

use std::future::Future;
use std::sync::Once;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::mqtt_stub::MockBroker;

static TRACING: Once = Once::new();

/// Installs a test subscriber once; honours RUST_LOG.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Polls `condition` every 20ms until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(20)).await;
    }
}

/// A broker plus timing defaults for pump-level tests.
pub struct TestHarness {
    pub broker: MockBroker,
    pub timeout: Duration,
}

impl TestHarness {
    pub fn new() -> Self {
        init_tracing();
        Self { broker: MockBroker::new(), timeout: Duration::from_secs(2) }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Waits until `count` messages reached (host, vpn).
    pub async fn wait_for_messages(&self, host: &str, vpn: &str, count: usize) -> bool {
        let broker = self.broker.clone();
        let (host, vpn) = (host.to_string(), vpn.to_string());
        wait_until(self.timeout, || {
            let broker = broker.clone();
            let (host, vpn) = (host.clone(), vpn.clone());
            async move { broker.published_on(&host, &vpn).len() >= count }
        })
        .await
    }

    /// Asserts a topic was published on (host, vpn), panicking with what was seen.
    pub fn assert_topic_published(&self, host: &str, vpn: &str, topic: &str) {
        let seen: Vec<String> = self.broker.published_on(host, vpn).into_iter().map(|m| m.topic).collect();
        assert!(seen.iter().any(|t| t == topic), "topic {topic} not published on {host}/{vpn}; saw {seen:?}");
    }

    pub fn assert_nothing_on(&self, host: &str, vpn: &str) {
        let seen = self.broker.published_on(host, vpn);
        assert!(seen.is_empty(), "expected no traffic on {host}/{vpn}, saw {} messages", seen.len());
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
