use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::{future, SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::bridge::{Outbound, PreparedBridge};
use crate::error::{ApiError, ErrorKind};
use crate::state::AppState;

/// Close reasons must fit a control frame.
const MAX_CLOSE_REASON: usize = 123;

/// The session check and exec attach happen before the upgrade, so a missing
/// session is a plain 404 and a dead engine a 503. Plain requests only get the
/// session check; no shell is opened for them.
pub async fn terminal(
    ws: Option<WebSocketUpgrade>,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let Some(ws) = ws else {
        state.bridge().check(&session_id).await?;
        return Err(ApiError::new(
            ErrorKind::InvalidInput,
            "terminal endpoint expects a websocket upgrade",
        ));
    };
    let prepared = state.bridge().prepare(&session_id).await?;
    Ok(ws
        .on_upgrade(move |socket| relay(socket, prepared))
        .into_response())
}

async fn relay(socket: WebSocket, prepared: PreparedBridge) {
    let session_id = prepared.session_id().to_string();
    debug!(session_id = %session_id, "terminal websocket connected");
    let (sink, stream) = socket.split();

    let inbound = stream
        .take_while(|frame| future::ready(!matches!(frame, Ok(Message::Close(_)) | Err(_))))
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(Bytes::from(text)),
                Ok(Message::Binary(data)) => Some(Bytes::from(data)),
                _ => None,
            })
        });
    let outbound =
        sink.with(|frame: Outbound| future::ready(Ok::<Message, axum::Error>(to_message(frame))));

    match prepared.run(inbound, outbound).await {
        Ok(report) => debug!(
            session_id = %session_id,
            closed_by = ?report.closed_by,
            "terminal websocket finished"
        ),
        Err(err) => warn!(session_id = %session_id, error = %err, "terminal websocket failed"),
    }
}

fn to_message(frame: Outbound) -> Message {
    match frame {
        Outbound::Data(data) => Message::Binary(data.to_vec()),
        Outbound::Close(reason) => Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: truncate(reason.unwrap_or_default(), MAX_CLOSE_REASON).into(),
        })),
    }
}

fn truncate(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}
