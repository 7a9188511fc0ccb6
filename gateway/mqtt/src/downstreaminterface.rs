use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tracing::{info, warn};

/// Raw message as received from the equipment broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct MqttDownstreamConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub subscribe_filter: String,
    /// Request queue size of the rumqttc client.
    pub channel_capacity: usize,
}

impl Default for MqttDownstreamConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "validation-ingress".into(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            subscribe_filter: "validations/#".into(),
            channel_capacity: 50,
        }
    }
}

#[async_trait]
pub trait DownstreamInterface: Send {
    async fn subscribe(&mut self) -> Result<()>;

    /// Next publish from the broker; `None` when the source is exhausted.
    async fn recv(&mut self) -> Result<Option<MqttMessage>>;
}

pub struct MqttDownstream {
    cfg: MqttDownstreamConfig,
    client: AsyncClient,
    eventloop: rumqttc::EventLoop,
    connected_once: bool,
}

impl MqttDownstream {
    pub async fn connect(cfg: MqttDownstreamConfig) -> Result<Self> {
        let mut opts = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
        opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));

        if let (Some(u), Some(p)) = (cfg.username.clone(), cfg.password.clone()) {
            opts.set_credentials(u, p);
        }

        let (client, eventloop) = AsyncClient::new(opts, cfg.channel_capacity.max(1));
        info!(host = %cfg.host, port = cfg.port, client_id = %cfg.client_id, "mqtt client created");
        Ok(Self { cfg, client, eventloop, connected_once: false })
    }
}

#[async_trait]
impl DownstreamInterface for MqttDownstream {
    async fn subscribe(&mut self) -> Result<()> {
        self.client
            .subscribe(&self.cfg.subscribe_filter, QoS::AtLeastOnce)
            .await
            .with_context(|| format!("subscribe failed for '{}'", self.cfg.subscribe_filter))?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<MqttMessage>> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    return Ok(Some(MqttMessage {
                        topic: p.topic,
                        payload: p.payload.to_vec(),
                    }));
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    // clean sessions lose their subscriptions on reconnect
                    if self.connected_once {
                        if let Err(e) = self.client.try_subscribe(&self.cfg.subscribe_filter, QoS::AtLeastOnce) {
                            warn!("resubscribe to '{}' failed: {e}", self.cfg.subscribe_filter);
                        }
                    }
                    self.connected_once = true;
                }
                Ok(_) => continue,
                Err(e) => {
                    // rumqttc reconnects on the next poll
                    warn!("MQTT poll error: {:?} (retrying)", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}
