use std::sync::Arc;

use abstractgateway::{Gateway, GatewayTransport, SubmitError};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::downstreaminterface::{DownstreamInterface, MqttDownstream, MqttDownstreamConfig};
use crate::upstreaminterface::{DefaultUpstream, UpstreamConfig, UpstreamInterface};

#[derive(Debug, Clone)]
pub struct MqttGatewayConfig {
    pub downstream: MqttDownstreamConfig,
    pub upstream: UpstreamConfig,
    /// Submissions allowed to wait on the pipeline at the same time.
    pub max_in_flight: usize,
}

impl Default for MqttGatewayConfig {
    fn default() -> Self {
        Self {
            downstream: MqttDownstreamConfig::default(),
            upstream: UpstreamConfig::default(),
            max_in_flight: 100,
        }
    }
}

/// Counters for one run of the receive loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngressStats {
    pub messages: u64,
    pub decode_errors: u64,
    pub events: u64,
}

/// Receive loop shared by the real gateway and tests: decode every message and
/// submit its events with at most `max_in_flight` submissions pending. Returns
/// once the gateway is shut down or the source is exhausted, after every
/// pending submission has finished.
pub async fn pump<D>(
    downstream: &mut D,
    upstream: &dyn UpstreamInterface,
    gateway: &Gateway,
    max_in_flight: usize,
) -> Result<IngressStats>
where
    D: DownstreamInterface + ?Sized,
{
    let cancel = gateway.cancellation_token();
    let slots = Arc::new(Semaphore::new(max_in_flight.max(1)));
    let tracker = TaskTracker::new();
    let mut stats = IngressStats::default();

    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = downstream.recv() => match msg? {
                Some(m) => m,
                None => break,
            },
        };
        stats.messages += 1;

        let events = match upstream.decode_events(&msg) {
            Ok(events) => events,
            Err(e) => {
                stats.decode_errors += 1;
                warn!(gateway = gateway.name(), topic = %msg.topic, "dropping undecodable payload: {e}");
                continue;
            }
        };
        debug!(topic = %msg.topic, count = events.len(), "decoded validation payload");

        for event in events {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = slots.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else { break };
            stats.events += 1;

            let gw = gateway.clone();
            tracker.spawn(async move {
                // refusals are logged by `forward`; shutdown refusals are expected
                if let Err(SubmitError::ShuttingDown) = gw.forward(event).await {
                    debug!(gateway = gw.name(), "event refused during shutdown");
                }
                drop(permit);
            });
        }
    }

    tracker.close();
    tracker.wait().await;
    Ok(stats)
}

/// MQTT equipment gateway: subscribes to the validation topics and forwards
/// every decoded event to the pipeline.
pub struct MqttGateway {
    cfg: MqttGatewayConfig,
    upstream: DefaultUpstream,
    downstream: Option<MqttDownstream>,
}

impl MqttGateway {
    pub fn new(cfg: MqttGatewayConfig) -> Self {
        let upstream = DefaultUpstream::new(cfg.upstream.clone());
        Self { cfg, upstream, downstream: None }
    }

    pub fn config(&self) -> &MqttGatewayConfig {
        &self.cfg
    }
}

#[async_trait]
impl GatewayTransport for MqttGateway {
    fn protocol(&self) -> &'static str {
        "mqtt"
    }

    async fn connect(&mut self) -> Result<()> {
        let mut downstream = MqttDownstream::connect(self.cfg.downstream.clone())
            .await
            .context("mqtt connect failed")?;
        downstream.subscribe().await?;
        info!(
            host = %self.cfg.downstream.host,
            filter = %self.cfg.downstream.subscribe_filter,
            "mqtt gateway subscribed"
        );
        self.downstream = Some(downstream);
        Ok(())
    }

    async fn run(&mut self, gateway: &Gateway) -> Result<()> {
        let downstream = self
            .downstream
            .as_mut()
            .ok_or_else(|| anyhow!("run() called before connect()"))?;
        let stats = pump(downstream, &self.upstream, gateway, self.cfg.max_in_flight).await?;
        info!(
            gateway = gateway.name(),
            messages = stats.messages,
            events = stats.events,
            decode_errors = stats.decode_errors,
            "mqtt gateway stopped"
        );
        Ok(())
    }
}
