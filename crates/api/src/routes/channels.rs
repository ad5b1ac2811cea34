//! Real-time channels
//!
//! When the in-process hub is active, subscribers read a channel as a
//! Server-Sent Events stream. With an external pub/sub service, clients
//! connect to that service instead and the stream endpoint is absent.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    response::{
        sse::{Event, KeepAlive},
        Sse,
    },
    Json,
};
use creatorpay_settlement::{BroadcastHub, NotifyOutcome};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::Value;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::error::{ApiError, ApiJson, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AnnouncementBody {
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

/// Releases the hub channel once its SSE stream is dropped
struct ChannelLease {
    hub: BroadcastHub,
    channel: String,
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let hub = self.hub.clone();
        let channel = std::mem::take(&mut self.channel);
        tracing::debug!(channel = %channel, "Channel subscriber disconnected");
        runtime.spawn(async move { hub.release(&channel).await });
    }
}

pub async fn stream_channel(
    State(state): State<AppState>,
    Path(channel): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let hub = state.hub.as_ref().ok_or_else(|| {
        ApiError::NotFound("Channels are served by the external pub/sub service".to_string())
    })?;

    if !state.settlement.notifier.channels().is_known(&channel) {
        return Err(ApiError::NotFound(format!("Unknown channel: {}", channel)));
    }

    let receiver = hub.subscribe(&channel).await;
    tracing::debug!(channel = %channel, "Channel subscriber connected");

    let lease = ChannelLease {
        hub: hub.clone(),
        channel,
    };

    let events = BroadcastStream::new(receiver).filter_map(move |message| {
        let _lease = &lease;
        match message {
            Ok(message) => match Event::default().event(message.event.as_str()).json_data(&message.data) {
                Ok(event) => Some(Ok(event)),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to encode channel event");
                    None
                }
            },
            Err(e) => {
                // Lagged: the subscriber missed events but the stream stays open
                tracing::warn!(error = %e, "Channel subscriber lagging");
                None
            }
        }
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// Broadcast a platform announcement to every creator
pub async fn announce(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<AnnouncementBody>,
) -> ApiResult<Json<NotifyOutcome>> {
    if body.title.trim().is_empty() || body.message.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "Announcements need a title and a message".to_string(),
        ));
    }

    let outcome = state
        .settlement
        .notifier
        .notify_all_creators(&body.title, &body.message, body.data)
        .await;

    Ok(Json(outcome))
}
