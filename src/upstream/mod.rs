//! Client for the upstream hub's WebSocket API: auth handshake, registry
//! list requests, and the `state_changed` event subscription.

use chrono::{DateTime, Utc};
use futures::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::{domain_of, NewEvent};
use crate::registry::{Area, Device, Entity, Floor, Registry};

pub mod supervisor;

pub use supervisor::{run_supervisor, Backoff};


#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("connection error: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct UpstreamClient {
    stream: WsStream,
    next_id: u64,
}

impl UpstreamClient {
    /// Connect to the hub and complete the auth handshake.
    pub async fn connect(url: &str, token: &str) -> Result<Self, UpstreamError> {
        let (stream, _) = connect_async(url).await?;
        let mut client = Self { stream, next_id: 0 };
        client.authenticate(token).await?;
        info!(url = %url, "connected to upstream hub");
        Ok(client)
    }

    async fn authenticate(&mut self, token: &str) -> Result<(), UpstreamError> {
        let greeting = self.recv_json().await?;
        if greeting.get("type").and_then(Value::as_str) != Some("auth_required") {
            info!("upstream authentication not required");
            return Ok(());
        }

        self.send_json(&json!({"type": "auth", "access_token": token}))
            .await?;

        let result = self.recv_json().await?;
        match result.get("type").and_then(Value::as_str) {
            Some("auth_ok") => {
                info!("authenticated with upstream hub");
                Ok(())
            }
            other => Err(UpstreamError::Auth(format!(
                "unexpected auth response: {other:?}"
            ))),
        }
    }

    /// Fetch the four registry lists (floors, entities, areas, devices).
    pub async fn fetch_registry(&mut self) -> Result<Registry, UpstreamError> {
        let floors = self.call_list("config/floor_registry/list").await?;
        let entities = self.call_list("config/entity_registry/list").await?;
        let areas = self.call_list("config/area_registry/list").await?;
        let devices = self.call_list("config/device_registry/list").await?;

        let registry = Registry {
            entities: collect(&entities, Entity::from_upstream, |e| e.id.clone()),
            floors: collect(&floors, Floor::from_upstream, |f| f.id.clone()),
            areas: collect(&areas, Area::from_upstream, |a| a.id.clone()),
            devices: collect(&devices, Device::from_upstream, |d| d.id.clone()),
        };
        info!(
            entities = registry.entities.len(),
            floors = registry.floors.len(),
            areas = registry.areas.len(),
            devices = registry.devices.len(),
            "fetched registry from upstream"
        );
        Ok(registry)
    }

    /// Subscribe to `state_changed` events. A rejected subscription leaves
    /// the session useless, so it surfaces as a protocol error and the
    /// supervisor reconnects.
    pub async fn subscribe_events(&mut self) -> Result<u64, UpstreamError> {
        let request_id = self.next_request_id();
        self.send_json(&json!({
            "id": request_id,
            "type": "subscribe_events",
            "event_type": "state_changed",
        }))
        .await?;

        let result = self.recv_json().await?;
        if result.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(UpstreamError::Protocol(
                "subscribe_events rejected by upstream".to_string(),
            ));
        }
        info!(event_type = "state_changed", "subscribed to upstream events");
        Ok(request_id)
    }

    /// Next state-change event, or None when the peer closes the channel.
    /// Result frames received while streaming are logged and skipped.
    pub async fn next_event(&mut self) -> Result<Option<NewEvent>, UpstreamError> {
        loop {
            let Some(frame) = self.recv_json_opt().await? else {
                return Ok(None);
            };
            match frame.get("type").and_then(Value::as_str) {
                Some("event") => match map_state_change(&frame) {
                    Some(event) => return Ok(Some(event)),
                    None => warn!("discarding unmappable event frame"),
                },
                Some("result") => debug!("result frame received while streaming"),
                other => warn!(frame_type = ?other, "unexpected upstream frame"),
            }
        }
    }

    /// Adapt the subscribed client into a finite stream of raw events; the
    /// stream ends on disconnect or error and is not restartable.
    pub fn into_event_stream(self) -> impl Stream<Item = NewEvent> + Unpin {
        Box::pin(futures::stream::unfold(self, |mut client| async move {
            match client.next_event().await {
                Ok(Some(event)) => Some((event, client)),
                Ok(None) => {
                    info!("upstream connection closed");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "upstream stream failed");
                    None
                }
            }
        }))
    }

    fn next_request_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    async fn call_list(&mut self, method: &str) -> Result<Vec<Value>, UpstreamError> {
        let request_id = self.next_request_id();
        self.send_json(&json!({"id": request_id, "type": method}))
            .await?;

        let result = self.recv_json().await?;
        if result.get("id").and_then(Value::as_u64) != Some(request_id) {
            return Err(UpstreamError::Protocol(format!(
                "unexpected response id for {method}"
            )));
        }
        match result.get("result") {
            Some(Value::Array(items)) => Ok(items.clone()),
            _ => Err(UpstreamError::Protocol(format!(
                "{method} returned no result list"
            ))),
        }
    }

    async fn send_json(&mut self, value: &Value) -> Result<(), UpstreamError> {
        self.stream.send(Message::Text(value.to_string())).await?;
        Ok(())
    }

    async fn recv_json(&mut self) -> Result<Value, UpstreamError> {
        self.recv_json_opt().await?.ok_or_else(|| {
            UpstreamError::Protocol("connection closed mid-exchange".to_string())
        })
    }

    async fn recv_json_opt(&mut self) -> Result<Option<Value>, UpstreamError> {
        while let Some(frame) = self.stream.next().await {
            match frame? {
                Message::Text(text) => return Ok(Some(serde_json::from_str(&text)?)),
                Message::Close(_) => return Ok(None),
                // Ping/pong and binary frames carry no protocol data
                _ => continue,
            }
        }
        Ok(None)
    }
}

fn collect<T>(
    rows: &[Value],
    parse: impl Fn(&Value) -> Option<T>,
    key: impl Fn(&T) -> String,
) -> std::collections::HashMap<String, T> {
    rows.iter()
        .filter_map(|row| {
            let parsed = parse(row);
            if parsed.is_none() {
                warn!("skipping unparsable registry row");
            }
            parsed
        })
        .map(|item| (key(&item), item))
        .collect()
}

/// Map one raw `state_changed` frame into a storable event. The upstream
/// `context.id` becomes the external id used for deduplication.
pub(crate) fn map_state_change(frame: &Value) -> Option<NewEvent> {
    let event = frame.get("event")?;
    let entity_id = event.pointer("/data/entity_id")?.as_str()?.to_string();
    let external_id = event.pointer("/context/id")?.as_str()?.to_string();
    let event_type = event.get("event_type")?.as_str()?.to_string();
    let timestamp = parse_time_fired(event.get("time_fired")?.as_str()?)?;

    let new_state = event
        .pointer("/data/new_state")
        .filter(|value| !value.is_null())
        .cloned()
        .unwrap_or_else(|| json!({}));
    let state = new_state
        .get("state")
        .and_then(Value::as_str)
        .map(str::to_string);
    let unit = new_state
        .pointer("/attributes/unit_of_measurement")
        .and_then(Value::as_str)
        .map(str::to_string);

    Some(NewEvent {
        domain: domain_of(&entity_id).to_string(),
        entity_id,
        event_id: Uuid::new_v4(),
        event_type,
        external_id,
        timestamp,
        state,
        unit,
        data: new_state,
        metadata: json!({}),
    })
}

fn parse_time_fired(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}
