//! MQTT connection plumbing: subscriptions, topic → channel mapping, and
//! the event-loop task that queues inbound commands for the cycle.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::dispatch::{Channel, Command};

/// Extract the command channel from `<namespace>/<node_id>/{riego,admin}`.
///
/// Topics for other nodes or namespaces map to nothing.
pub(crate) fn channel_for_topic(topic: &str, namespace: &str, node_id: &str) -> Option<Channel> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 3 || parts[0] != namespace || parts[1] != node_id {
        return None;
    }
    match parts[2] {
        "riego" => Some(Channel::Irrigation),
        "admin" => Some(Channel::Admin),
        _ => None,
    }
}

/// Connect and spawn the event-loop task. Command topics are subscribed on
/// every `ConnAck`, so a clean-session reconnect gets them back. Inbound
/// commands arrive on the returned receiver; the cycle drains it once per
/// iteration.
pub(crate) fn connect(cfg: &NodeConfig) -> (AsyncClient, mpsc::UnboundedReceiver<Command>) {
    let mut mqttoptions = MqttOptions::new(cfg.mqtt_client_id(), &cfg.mqtt_host, cfg.mqtt_port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, eventloop) = AsyncClient::new(mqttoptions, 10);
    let (tx, rx) = mpsc::unbounded_channel();
    let inbound = Inbound {
        client: client.clone(),
        namespace: cfg.namespace.clone(),
        node_id: cfg.node_id.clone(),
        topics: [cfg.irrigation_topic(), cfg.admin_topic()],
        tx,
    };
    tokio::spawn(pump_events(eventloop, inbound));

    (client, rx)
}

/// The receiving half of the connection.
struct Inbound {
    client: AsyncClient,
    namespace: String,
    node_id: String,
    topics: [String; 2],
    tx: mpsc::UnboundedSender<Command>,
}

impl Inbound {
    /// Queue the command subscriptions without waiting on the request
    /// channel, which only drains while this task polls the event loop.
    fn subscribe(&self) {
        for topic in &self.topics {
            if let Err(e) = self.client.try_subscribe(topic, QoS::AtLeastOnce) {
                warn!(topic = %topic, "subscribe failed: {e}");
            }
        }
        info!(topics = ?self.topics, "subscribed to command topics");
    }

    /// Returns `false` once the cycle has dropped its receiver.
    fn handle(&self, event: Event) -> bool {
        match event {
            Event::Incoming(Packet::Publish(p)) => {
                let Some(channel) = channel_for_topic(&p.topic, &self.namespace, &self.node_id)
                else {
                    debug!(topic = %p.topic, "unhandled topic");
                    return true;
                };
                let text = String::from_utf8_lossy(&p.payload).into_owned();
                info!(topic = %p.topic, text = %text, "command received");
                self.tx.send(Command::new(channel, text)).is_ok()
            }
            Event::Incoming(Packet::ConnAck(_)) => {
                info!("mqtt connected");
                self.subscribe();
                true
            }
            _ => true,
        }
    }
}

/// Keep the connection alive and forward command publishes. Reconnection is
/// left to rumqttc; we only pace retries.
async fn pump_events(mut eventloop: EventLoop, inbound: Inbound) {
    loop {
        match eventloop.poll().await {
            Ok(event) => {
                if !inbound.handle(event) {
                    // The cycle is gone; nothing left to deliver to.
                    return;
                }
            }
            Err(e) => {
                warn!("mqtt error: {e}. retrying...");
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Take every command queued since the last cycle, oldest first.
pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<Command>) -> Vec<Command> {
    let mut commands = Vec::new();
    while let Ok(cmd) = rx.try_recv() {
        commands.push(cmd);
    }
    commands
}

// ===========================================================================
// Tests
// ===========================================================================
