//! SSE wire events.
//!
//! Every record is framed as `event: <name>\ndata: <payload>\n\n`.
//! `message` payloads are the raw subprocess output line; all other
//! payloads are compact JSON.

use std::borrow::Cow;

use axum::response::sse::Event;
use serde_json::json;

pub(crate) fn connected(config_id: i64) -> Event {
    Event::default()
        .event("connected")
        .data(json!({ "id": config_id }).to_string())
}

pub(crate) fn message(line: &str) -> Event {
    // Carriage returns would corrupt the frame.
    let data: Cow<'_, str> = if line.contains('\r') {
        Cow::Owned(line.replace('\r', ""))
    } else {
        Cow::Borrowed(line)
    };
    Event::default().event("message").data(data)
}

pub(crate) fn error(text: &str) -> Event {
    Event::default()
        .event("error")
        .data(json!({ "error": text }).to_string())
}

pub(crate) fn close(code: i32) -> Event {
    Event::default()
        .event("close")
        .data(json!({ "code": code }).to_string())
}

pub(crate) fn heartbeat(timestamp: u64) -> Event {
    Event::default()
        .event("heartbeat")
        .data(json!({ "timestamp": timestamp }).to_string())
}
