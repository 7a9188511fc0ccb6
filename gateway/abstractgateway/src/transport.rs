//! Lifecycle of a protocol gateway: open the equipment-side connection once,
//! then decode incoming payloads and submit every validation event through a
//! [`Gateway`] handle until that handle is shut down.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use crate::abstractgateway::Gateway;

/// Only `Send`: transports own their protocol client, which is rarely `Sync`,
/// and are driven through `&mut self` from a single task.
#[async_trait]
pub trait GatewayTransport: Send {
    /// Label used in logs and errors, e.g. `mqtt`.
    fn protocol(&self) -> &'static str;

    /// Opens the connection and subscriptions. Called once, before `run`.
    async fn connect(&mut self) -> Result<()>;

    /// Submits decoded events through `gateway` until `gateway.shutdown()` is
    /// called or the source ends. Undecodable payloads are skipped, not fatal.
    async fn run(&mut self, gateway: &Gateway) -> Result<()>;
}

/// `connect` then `run`, for callers that have no use for the split.
pub async fn serve<T>(transport: &mut T, gateway: &Gateway) -> Result<()>
where
    T: GatewayTransport + ?Sized,
{
    let protocol = transport.protocol();
    transport
        .connect()
        .await
        .with_context(|| format!("{protocol} gateway '{}' failed to connect", gateway.name()))?;
    info!(protocol, gateway = gateway.name(), "ingress connected");
    transport.run(gateway).await
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::abstractgateway::{IngressSink, SubmitError};
    use crate::upstream::ValidationEvent;

    #[derive(Default)]
    struct Counting {
        seen: Mutex<usize>,
    }

    #[async_trait]
    impl IngressSink for Counting {
        async fn submit(&self, _event: ValidationEvent) -> Result<(), SubmitError> {
            *self.seen.lock().unwrap() += 1;
            Ok(())
        }
    }

    /// Emits a fixed number of events; refuses to connect when `reachable` is false.
    struct Scripted {
        reachable: bool,
        connected: bool,
        events: usize,
    }

    #[async_trait]
    impl GatewayTransport for Scripted {
        fn protocol(&self) -> &'static str {
            "scripted"
        }

        async fn connect(&mut self) -> Result<()> {
            anyhow::ensure!(self.reachable, "equipment unreachable");
            self.connected = true;
            Ok(())
        }

        async fn run(&mut self, gateway: &Gateway) -> Result<()> {
            anyhow::ensure!(self.connected, "run before connect");
            for seq in 0..self.events {
                if gateway.is_shutdown() {
                    break;
                }
                gateway.forward(ValidationEvent::new("EQ-1", format!("T-{seq}"), "STATION-NORD")).await?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn serve_connects_then_forwards() {
        let sink = Arc::new(Counting::default());
        let gateway = Gateway::new("line-1", sink.clone());
        let mut transport = Scripted { reachable: true, connected: false, events: 3 };

        serve(&mut transport, &gateway).await.unwrap();
        assert_eq!(*sink.seen.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn connect_failure_names_the_protocol() {
        let gateway = Gateway::new("line-1", Arc::new(Counting::default()));
        let mut transport = Scripted { reachable: false, connected: false, events: 3 };

        let err = serve(&mut transport, &gateway).await.unwrap_err();
        assert!(err.to_string().contains("scripted gateway 'line-1'"));
    }

    #[tokio::test]
    async fn shut_down_gateway_forwards_nothing() {
        let sink = Arc::new(Counting::default());
        let gateway = Gateway::new("line-1", sink.clone());
        gateway.shutdown();
        let mut transport: Box<dyn GatewayTransport> =
            Box::new(Scripted { reachable: true, connected: false, events: 3 });

        serve(transport.as_mut(), &gateway).await.unwrap();
        assert_eq!(*sink.seen.lock().unwrap(), 0);
    }
}
