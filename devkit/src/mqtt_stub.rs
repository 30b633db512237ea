/*!
Mock MQTT client and broker for running the pump without a real broker.

Every publish is recorded so tests can assert on what reached which VPN.
*/

use anyhow::Result;
use rumqttc::v5::mqttbytes::v5::PublishProperties;
use rumqttc::v5::mqttbytes::QoS;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub properties: PublishProperties,
}

impl MockMessage {
    /// First MQTT 5 user property named `key`.
    pub fn user_property(&self, key: &str) -> Option<&str> {
        self.properties.user_properties.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Mock client shaped like rumqttc::v5::AsyncClient
#[derive(Clone)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    connected: Arc<AtomicBool>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self {
            published_messages: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Records a publish (same signature as AsyncClient::publish)
    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        self.publish_with_properties(topic, qos, retain, payload, PublishProperties::default()).await
    }

    /// Records a publish with MQTT 5 properties
    pub async fn publish_with_properties<S, V>(
        &self,
        topic: S,
        qos: QoS,
        retain: bool,
        payload: V,
        properties: PublishProperties,
    ) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage { topic: topic.into(), payload: payload.into(), qos, retain, properties };
        if !self.is_connected() {
            anyhow::bail!("mock client not connected, dropping {}", message.topic);
        }
        tracing::debug!("[MOCK] Published to {}: {} bytes", message.topic, message.payload.len());
        self.published_messages.lock().unwrap().push(message);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Simulates a dropped or restored connection
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().unwrap().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parses the last message published on a topic as JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let messages = self.find_messages_by_topic(topic);
        if let Some(last_msg) = messages.last() {
            let parsed: T = serde_json::from_slice(&last_msg.payload)?;
            Ok(Some(parsed))
        } else {
            Ok(None)
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().unwrap().clear();
    }
}

impl Default for MockMqttClient {
    fn default() -> Self {
        Self::new()
    }
}

/// One mock client per (host, VPN), created on first connect.
#[derive(Clone, Default)]
pub struct MockBroker {
    clients: Arc<Mutex<BTreeMap<(String, String), Arc<MockMqttClient>>>>,
    connects: Arc<AtomicUsize>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_for(&self, host: &str, vpn: &str) -> Arc<MockMqttClient> {
        let mut clients = self.clients.lock().unwrap();
        clients
            .entry((host.to_ascii_lowercase(), vpn.to_string()))
            .or_insert_with(|| {
                self.connects.fetch_add(1, Ordering::Relaxed);
                Arc::new(MockMqttClient::new())
            })
            .clone()
    }

    pub fn published_on(&self, host: &str, vpn: &str) -> Vec<MockMessage> {
        self.clients
            .lock()
            .unwrap()
            .get(&(host.to_ascii_lowercase(), vpn.to_string()))
            .map(|client| client.get_published_messages())
            .unwrap_or_default()
    }

    /// VPNs on `host` that received at least one message
    pub fn vpns_with_traffic(&self, host: &str) -> Vec<String> {
        let host = host.to_ascii_lowercase();
        self.clients
            .lock()
            .unwrap()
            .iter()
            .filter(|((h, _), client)| *h == host && !client.get_published_messages().is_empty())
            .map(|((_, vpn), _)| vpn.clone())
            .collect()
    }

    pub fn total_published(&self) -> usize {
        self.clients.lock().unwrap().values().map(|c| c.get_published_messages().len()).sum()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }
}
