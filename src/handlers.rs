use std::{
    convert::Infallible,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use axum::{
    extract::State,
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderMap,
    },
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    errors::AppError,
    metrics::InflightGuard,
    models::{static_model_list, ChatCompletionsChunk, ChatCompletionsRequest, ChatCompletionsResponse},
    prompt::Prompt,
    relay::{StreamChunk, StreamRelay},
    state::AppState,
};

const EVENT_STREAM: &str = "text/event-stream";

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => AppError::Internal(format!("metrics render failed: {error}")).into_response(),
    }
}

pub async fn list_models() -> Response {
    Json(static_model_list(unix_timestamp())).into_response()
}

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionsRequest>,
) -> Response {
    let started = Instant::now();
    let stream = request.stream || accepts_event_stream(&headers);
    let inflight = state.metrics.inflight_guard();

    let response = match process_chat_completions(&state, request, stream, inflight).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };

    state.metrics.observe_request(
        "/v1/chat/completions",
        "POST",
        stream,
        response.status().as_u16(),
        started.elapsed(),
    );

    response
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains(EVENT_STREAM))
}

async fn process_chat_completions(
    state: &AppState,
    request: ChatCompletionsRequest,
    stream: bool,
    inflight: InflightGuard,
) -> Result<Response, AppError> {
    let prompt = request.into_prompt(stream).map_err(AppError::BadRequest)?;
    info!(
        request_id = %prompt.request_id,
        model = %prompt.model,
        stream,
        messages = prompt.messages.len(),
        kind = prompt.kind().as_str(),
        "chat request accepted"
    );

    if stream {
        Ok(stream_completion(state, prompt, inflight))
    } else {
        let response = one_shot_completion(state, prompt).await;
        drop(inflight);
        response
    }
}

async fn one_shot_completion(state: &AppState, prompt: Prompt) -> Result<Response, AppError> {
    let mut relay = StreamRelay::buffered(CancellationToken::new());
    let outcome = state.router.route(&prompt, &mut relay).await?;

    let payload = ChatCompletionsResponse::new(
        format!("chatcmpl-{}", Uuid::new_v4()),
        unix_timestamp(),
        response_model(&prompt, &outcome.backend),
        outcome.content,
        outcome.finish_reason,
    );
    Ok(Json(payload).into_response())
}

/// Runs the route on its own task and turns relay chunks into SSE frames.
/// Dropping the response body cancels the route.
fn stream_completion(state: &AppState, prompt: Prompt, inflight: InflightGuard) -> Response {
    let cancel = CancellationToken::new();
    let (mut relay, mut chunks) = StreamRelay::streaming(cancel.clone(), state.relay_buffer);
    let created = unix_timestamp();
    let response_id = format!("chatcmpl-{}", Uuid::new_v4());
    let model = response_model(&prompt, "chatmux");

    let router = state.router.clone();
    tokio::spawn(async move {
        if let Err(error) = router.route(&prompt, &mut relay).await {
            debug!(request_id = %prompt.request_id, error = %error, "streaming route ended without a completion");
        }
    });

    let outbound = async_stream::stream! {
        let _inflight = inflight;
        let _disconnect = cancel.drop_guard();
        let mut first = true;

        while let Some(chunk) = chunks.recv().await {
            match chunk {
                StreamChunk::Content(content) => {
                    let delta = ChatCompletionsChunk::delta(&response_id, created, &model, content, first);
                    first = false;
                    yield Ok::<Event, Infallible>(message_event(&delta));
                }
                StreamChunk::Stop => {
                    let done = ChatCompletionsChunk::finish(&response_id, created, &model, "stop".to_owned());
                    yield Ok::<Event, Infallible>(message_event(&done));
                    break;
                }
                StreamChunk::Error(_) => {
                    let error = AppError::Upstream("no backend could serve the request".to_owned());
                    yield Ok::<Event, Infallible>(Event::default().event("message").data(error.to_json()));
                    break;
                }
            }
        }

        yield Ok::<Event, Infallible>(Event::default().data("[DONE]"));
    };

    Sse::new(outbound)
        .keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(10)))
        .into_response()
}

fn response_model(prompt: &Prompt, fallback: &str) -> String {
    if prompt.model.trim().is_empty() {
        fallback.to_owned()
    } else {
        prompt.model.clone()
    }
}

fn message_event<T: serde::Serialize>(payload: &T) -> Event {
    match serde_json::to_string(payload) {
        Ok(serialized) => Event::default().event("message").data(serialized),
        Err(error) => {
            let fallback = AppError::Internal(format!("serialization error: {error}"));
            Event::default().event("message").data(fallback.to_json())
        }
    }
}

fn unix_timestamp() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_secs() as i64
}
