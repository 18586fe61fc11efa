//! NATS-backed gateway client, inbound handler and broadcaster
//!
//! Gateway and ingestion services answer with the same `SuccessResponse` /
//! `ErrorResponse` envelopes this worker uses for its own replies.

use anyhow::{Context, Result};
use async_nats::Client;
use async_trait::async_trait;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::services::collaborators::{Broadcaster, GatewayClient, InboundHandler};
use crate::types::{ErrorResponse, GatewayHandle, RawInboundMessage, Request, SuccessResponse};

const INBOUND_SUBJECT: &str = "chatdesk.inbound.handle";

fn gateway_subject(connection_id: Uuid, action: &str) -> String {
    format!("chatdesk.gateway.{}.{}", connection_id, action)
}

/// Send a request envelope and decode the reply
async fn request<Req, Resp>(client: &Client, subject: String, payload: Req) -> Result<Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let body = serde_json::to_vec(&Request::new(payload))?;
    let reply = client
        .request(subject.clone(), body.into())
        .await
        .with_context(|| format!("request to {} failed", subject))?;
    decode_reply(&reply.payload).with_context(|| format!("bad reply from {}", subject))
}

/// Decode a reply envelope; error envelopes become errors
fn decode_reply<Resp: DeserializeOwned>(payload: &[u8]) -> Result<Resp> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    if value.get("error").is_some() {
        let error: ErrorResponse = serde_json::from_value(value)?;
        anyhow::bail!("{}: {}", error.error.code, error.error.message);
    }
    let success: SuccessResponse<Resp> = serde_json::from_value(value)?;
    Ok(success.payload)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GatewayQuery {
    connection_id: Uuid,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InboundRequest<'a> {
    message: &'a RawInboundMessage,
    handle: &'a GatewayHandle,
    company_id: Uuid,
    is_import: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    routing_key_override: Option<&'a str>,
}

pub struct NatsGatewayClient {
    client: Client,
}

impl NatsGatewayClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GatewayClient for NatsGatewayClient {
    async fn connection_handle(&self, connection_id: Uuid) -> Result<Option<GatewayHandle>> {
        request(
            &self.client,
            gateway_subject(connection_id, "handle"),
            GatewayQuery { connection_id },
        )
        .await
    }

    async fn buffered_messages(&self, connection_id: Uuid) -> Result<Vec<RawInboundMessage>> {
        let messages: Vec<RawInboundMessage> = request(
            &self.client,
            gateway_subject(connection_id, "buffered"),
            GatewayQuery { connection_id },
        )
        .await?;
        debug!(
            connection_id = %connection_id,
            "Gateway returned {} buffered messages",
            messages.len()
        );
        Ok(messages)
    }
}

pub struct NatsInboundHandler {
    client: Client,
}

impl NatsInboundHandler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InboundHandler for NatsInboundHandler {
    async fn handle(
        &self,
        message: &RawInboundMessage,
        handle: &GatewayHandle,
        company_id: Uuid,
        is_import: bool,
        routing_key_override: Option<&str>,
    ) -> Result<()> {
        let payload = InboundRequest {
            message,
            handle,
            company_id,
            is_import,
            routing_key_override,
        };
        let _: IgnoredAny = request(&self.client, INBOUND_SUBJECT.to_string(), payload).await?;
        Ok(())
    }
}

pub struct NatsBroadcaster {
    client: Client,
}

impl NatsBroadcaster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Broadcaster for NatsBroadcaster {
    async fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<()> {
        let body = serde_json::to_vec(&payload)?;
        self.client
            .publish(channel.to_string(), body.into())
            .await
            .with_context(|| format!("publish to {} failed", channel))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_subjects() {
        let id = Uuid::nil();
        assert_eq!(
            gateway_subject(id, "handle"),
            "chatdesk.gateway.00000000-0000-0000-0000-000000000000.handle"
        );
    }

    #[test]
    fn test_decode_success_reply() {
        let reply = SuccessResponse::new(
            Uuid::nil(),
            Some(GatewayHandle {
                connection_id: Uuid::nil(),
                session: "s1".to_string(),
            }),
        );
        let bytes = serde_json::to_vec(&reply).unwrap();
        let handle: Option<GatewayHandle> = decode_reply(&bytes).unwrap();
        assert_eq!(handle.unwrap().session, "s1");
    }

    #[test]
    fn test_decode_null_handle_means_offline() {
        let reply = SuccessResponse::new(Uuid::nil(), serde_json::Value::Null);
        let bytes = serde_json::to_vec(&reply).unwrap();
        let handle: Option<GatewayHandle> = decode_reply(&bytes).unwrap();
        assert!(handle.is_none());
    }

    #[test]
    fn test_decode_error_reply() {
        let reply = ErrorResponse::new(Uuid::nil(), "NOT_CONNECTED", "session down");
        let bytes = serde_json::to_vec(&reply).unwrap();
        let err = decode_reply::<Option<GatewayHandle>>(&bytes).unwrap_err();
        assert!(err.to_string().contains("NOT_CONNECTED"));
    }

    #[test]
    fn test_inbound_request_shape() {
        let message = RawInboundMessage {
            external_id: "m1".to_string(),
            routing_key: "r@chat".to_string(),
            alt_routing_key: None,
            timestamp: chrono::DateTime::<chrono::Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
            from_me: false,
            is_group: false,
            push_name: None,
            payload: serde_json::Value::Null,
        };
        let handle = GatewayHandle {
            connection_id: Uuid::nil(),
            session: "s".to_string(),
        };
        let json = serde_json::to_value(InboundRequest {
            message: &message,
            handle: &handle,
            company_id: Uuid::nil(),
            is_import: true,
            routing_key_override: Some("alt@chat"),
        })
        .unwrap();
        assert_eq!(json["isImport"], true);
        assert_eq!(json["routingKeyOverride"], "alt@chat");
        assert_eq!(json["message"]["timestamp"], 1_700_000_000);
    }
}
