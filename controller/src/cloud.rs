//! MQTT bridge: device-bound messages and direct methods in, method replies out.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tracing::{debug, info, warn};

use homelink_common::{
    envelope::{decode_json, encode_json},
    topics::{self, InboundTopic},
    Envelope, NetworkConfig,
};

use crate::ingress::Ingress;

/// A publish the bridge wants to send back to the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Clone)]
pub struct CloudBridge {
    ingress: Ingress,
    device_id: String,
}

impl CloudBridge {
    pub fn new(ingress: Ingress, device_id: impl Into<String>) -> Self {
        Self {
            ingress,
            device_id: device_id.into(),
        }
    }

    pub fn subscriptions(&self) -> [String; 2] {
        [
            topics::device_bound_filter(&self.device_id),
            topics::TOPIC_DIRECT_METHODS.to_string(),
        ]
    }

    /// Routes one inbound publish. Returns the reply to publish, if any.
    pub async fn handle_publish(&self, topic: &str, payload: &[u8]) -> Option<Outbound> {
        match topics::classify(topic, &self.device_id) {
            Some(InboundTopic::DeviceBound) => {
                self.device_bound(payload);
                None
            }
            Some(InboundTopic::DirectMethod { method, rid }) => {
                debug!("cloud: direct method {method} rid={rid}");
                Some(self.direct_method(rid, payload).await)
            }
            None => {
                debug!("cloud: ignoring publish on {topic}");
                None
            }
        }
    }

    fn device_bound(&self, payload: &[u8]) {
        if payload.is_empty() {
            warn!("cloud: empty device-bound message dropped");
            return;
        }
        let command = match Envelope::from_prefix(payload) {
            Ok(command) => command,
            Err(err) => {
                warn!("cloud: device-bound message dropped: {err}");
                return;
            }
        };
        if !command.op().is_request() {
            warn!("cloud: device-bound {} dropped", command.op().as_str());
            return;
        }
        if let Err(err) = self.ingress.post(command) {
            warn!("cloud: device-bound message not relayed: {err}");
        }
    }

    async fn direct_method(&self, rid: u64, payload: &[u8]) -> Outbound {
        let reply = match decode_json(payload) {
            Ok(command) => {
                let transmission_id = (rid % 256) as u8;
                let preferred = (transmission_id != 0).then_some(transmission_id);
                self.ingress.request_with_id(command, preferred).await
            }
            Err(err) => {
                warn!("cloud: direct method rid={rid} has a malformed payload: {err}");
                Envelope::default().error_reply("malformed envelope")
            }
        };

        let status = topics::direct_method_status(reply.op());
        let payload = encode_json(&reply).unwrap_or_else(|err| {
            warn!("cloud: failed to encode reply: {err}");
            b"[]".to_vec()
        });
        Outbound {
            topic: topics::direct_method_reply_topic(status, rid),
            payload,
        }
    }
}

pub fn connect(network: &NetworkConfig) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(
        network.device_id.clone(),
        network.mqtt_host.clone(),
        network.mqtt_port,
    );
    options.set_keep_alive(Duration::from_secs(30));
    if !network.mqtt_user.is_empty() {
        options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
    }
    AsyncClient::new(options, 64)
}

/// Polls the broker connection forever, (re)subscribing on every ConnAck.
pub fn spawn_mqtt_loop(bridge: CloudBridge, mqtt: AsyncClient, mut eventloop: EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    let bridge = bridge.clone();
                    let mqtt = mqtt.clone();
                    tokio::spawn(async move {
                        let Some(reply) = bridge
                            .handle_publish(&message.topic, &message.payload)
                            .await
                        else {
                            return;
                        };
                        if let Err(err) = mqtt
                            .publish(reply.topic, QoS::AtMostOnce, false, reply.payload)
                            .await
                        {
                            warn!("cloud: reply publish failed: {err}");
                        }
                    });
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    for filter in bridge.subscriptions() {
                        if let Err(err) = mqtt.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
                            warn!("mqtt subscribe to {filter} failed: {err}");
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}
