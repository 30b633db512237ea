/*!
# statspump devkit - test doubles for the stats pump

- In-memory MQTT client and broker keyed by (host, VPN)
- SEMP reply fixtures (hostname, redundancy, message spool, paginated VPN pages)
- A small harness with polling assertions
*/

pub mod mqtt_stub;
pub mod semp_fixtures;
pub mod test_utils;

pub use mqtt_stub::{MockBroker, MockMessage, MockMqttClient};
pub use semp_fixtures::{SempReplyBuilder, VpnFixture};
pub use test_utils::{init_tracing, wait_until, TestHarness};
