//! MQTT ingress: equipment publish fare validations on `validations/#`.
pub mod downstreaminterface;
pub mod gateway;
pub mod upstreaminterface;

pub use downstreaminterface::{DownstreamInterface, MqttDownstream, MqttDownstreamConfig, MqttMessage};
pub use gateway::{pump, IngressStats, MqttGateway, MqttGatewayConfig};
pub use upstreaminterface::{DecodeError, DefaultUpstream, UpstreamConfig, UpstreamInterface};
