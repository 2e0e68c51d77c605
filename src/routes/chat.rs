//! Request dispatcher (component G): classifies a request as small or
//! large, drives the matching engine or the plain selector accordingly, and
//! proxies to the chosen backend — streamed or not.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

use crate::api_types::CreateChatCompletionPayload;
use crate::backend::StreamPreflight;
use crate::canonical::{block_hashes_from_text, canonical_chat_prefix, prefix_key_sha256, words_from_text};
use crate::config::ThresholdMode;
use crate::error::{AppError, error_response};
use crate::state::AppState;
use crate::streaming::{DispatcherStream, FinishPolicy, boxed};

fn header_or_query<'a>(headers: &'a HeaderMap, query: &'a HashMap<String, String>, header_name: &str, query_name: &str) -> Option<String> {
    headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.get(query_name).cloned())
}

fn resolve_bounded_usize(value: Option<String>, min: usize, max: usize, default: usize) -> usize {
    value
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|n| *n >= min && *n <= max)
        .unwrap_or(default)
}

fn resolve_block_size(headers: &HeaderMap, query: &HashMap<String, String>, body_override: Option<usize>, default: usize) -> usize {
    if let Some(v) = header_or_query(headers, query, "x-block-size", "block_size") {
        if let Ok(n) = v.parse::<usize>() {
            if (1..=2048).contains(&n) {
                return n;
            }
        }
    }
    body_override.filter(|n| (1..=2048).contains(n)).unwrap_or(default)
}

fn resolve_threshold_mode(headers: &HeaderMap, query: &HashMap<String, String>, configured: ThresholdMode) -> ThresholdMode {
    let raw = header_or_query(headers, query, "x-threshold-mode", "threshold_mode");
    let candidate = raw.unwrap_or_else(|| match configured {
        ThresholdMode::Chars => "chars".to_string(),
        ThresholdMode::Words => "words".to_string(),
        ThresholdMode::Blocks => "blocks".to_string(),
    });
    match candidate.to_ascii_lowercase().as_str() {
        "chars" => ThresholdMode::Chars,
        "words" => ThresholdMode::Words,
        "blocks" => ThresholdMode::Blocks,
        _ => ThresholdMode::Chars,
    }
}

/// Classifies a request as small (below threshold, routed to the plain
/// selector) or large (routed to the matching engine), per the configured
/// or overridden threshold mode.
fn is_small(
    mode: ThresholdMode,
    prefix_len_chars: usize,
    words_count: usize,
    blocks_count: usize,
    min_chars: usize,
    min_words: usize,
    min_blocks: usize,
) -> bool {
    match mode {
        ThresholdMode::Chars => prefix_len_chars < min_chars,
        ThresholdMode::Words => words_count < min_words,
        ThresholdMode::Blocks => blocks_count < min_blocks,
    }
}

struct PrefixStats {
    key: String,
    prefix_text: String,
    blocks: Vec<String>,
    prefix_len_chars: usize,
    words_count: usize,
    words_per_block: usize,
}

fn extract_prefix_stats(payload: &CreateChatCompletionPayload, system_prompt: Option<&str>, add_bos: bool, words_per_block: usize) -> PrefixStats {
    let prefix_text = canonical_chat_prefix(&payload.messages, system_prompt, add_bos);
    let key = prefix_key_sha256(&prefix_text);
    let blocks = block_hashes_from_text(&prefix_text, words_per_block);
    let words_count = words_from_text(&prefix_text).len();
    let prefix_len_chars = prefix_text.chars().count();
    PrefixStats {
        key,
        prefix_text,
        blocks,
        prefix_len_chars,
        words_count,
        words_per_block,
    }
}

fn build_outgoing_body(payload: &CreateChatCompletionPayload, stream: bool, cache_prompt: bool) -> serde_json::Value {
    let mut map = payload.extra.clone();
    map.insert("messages".to_string(), serde_json::to_value(messages_as_json(&payload.messages)).unwrap_or_default());
    if let Some(model) = &payload.model {
        map.insert("model".to_string(), serde_json::Value::String(model.clone()));
    }
    map.insert("stream".to_string(), serde_json::Value::Bool(stream));
    if cache_prompt {
        map.insert("cache_prompt".to_string(), serde_json::Value::Bool(true));
    }
    serde_json::Value::Object(map)
}

fn messages_as_json(messages: &[crate::api_types::Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| {
            let content = match &m.content {
                None => serde_json::Value::Null,
                Some(crate::api_types::MessageContent::Text(t)) => serde_json::Value::String(t.clone()),
                Some(crate::api_types::MessageContent::Parts(parts)) => serde_json::to_value(
                    parts
                        .iter()
                        .map(|p| serde_json::json!({"type": p.kind, "text": p.text}))
                        .collect::<Vec<_>>(),
                )
                .unwrap_or_default(),
            };
            serde_json::json!({ "role": m.role, "content": content })
        })
        .collect()
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload: CreateChatCompletionPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => return AppError::Classification(e.to_string()).into_response(),
    };

    let config = &state.config;
    let words_per_block = resolve_block_size(&headers, &query, payload.words_per_block, config.words_per_block);
    let mode = resolve_threshold_mode(&headers, &query, config.threshold_mode);
    let min_chars = resolve_bounded_usize(
        header_or_query(&headers, &query, "x-min-prefix-chars", "min_prefix_chars"),
        0,
        10_000_000,
        config.min_prefix_chars,
    );
    let min_words = resolve_bounded_usize(
        header_or_query(&headers, &query, "x-min-prefix-words", "min_prefix_words"),
        0,
        10_000_000,
        config.min_prefix_words,
    );
    let min_blocks = resolve_bounded_usize(
        header_or_query(&headers, &query, "x-min-prefix-blocks", "min_prefix_blocks"),
        0,
        10_000_000,
        config.min_prefix_blocks,
    );

    let stats = extract_prefix_stats(&payload, state.system_prompt.as_deref(), config.add_bos, words_per_block);
    let blocks_count = stats.blocks.len();
    let model = payload.model.clone().unwrap_or_else(|| config.model_id.clone());

    info!(
        model = %model,
        key = %stats.key,
        stream = payload.stream,
        prefix_chars = stats.prefix_len_chars,
        words = stats.words_count,
        blocks = blocks_count,
        wpb = words_per_block,
        "request_received"
    );

    let small = is_small(mode, stats.prefix_len_chars, stats.words_count, blocks_count, min_chars, min_words, min_blocks);

    if small {
        return handle_small(state, payload, stats).await;
    }
    handle_large(state, payload, stats).await
}

async fn handle_small(state: Arc<AppState>, payload: CreateChatCompletionPayload, stats: PrefixStats) -> Response {
    let prefer = state.slot_manager.prefer_backend(&stats.key);
    let (slot, guard) = match state
        .slot_manager
        .acquire_free_or_cold_slot(&Default::default(), Some(prefer))
        .await
    {
        Ok(v) => v,
        Err(_) => return AppError::Capacity.into_response(),
    };
    let backend = state.slot_manager.backend_for(slot);
    info!(backend = backend.id, url = %backend.url, local_slot = slot.1, "small_request_use_gslot");

    if payload.stream {
        let body = build_outgoing_body(&payload, true, false);
        match backend.client.chat_stream(body, slot.1).await {
            Ok(StreamPreflight::Ready { stream, .. }) => {
                let dispatcher_stream = DispatcherStream::new(
                    stream,
                    guard,
                    state.slot_manager.clone(),
                    slot,
                    FinishPolicy::AlwaysCold,
                    false,
                    None,
                );
                sse_response(boxed(dispatcher_stream))
            }
            Ok(StreamPreflight::Failed { body, .. }) => {
                state.slot_manager.mark_slot_cold(slot);
                drop(guard);
                warn!(backend = backend.id, "backend_error");
                error_response(StatusCode::BAD_GATEWAY, body)
            }
            Err(e) => {
                state.slot_manager.mark_slot_cold(slot);
                drop(guard);
                warn!(backend = backend.id, error = %e, "backend_error");
                AppError::BackendTransport(e.to_string()).into_response()
            }
        }
    } else {
        let body = build_outgoing_body(&payload, false, false);
        let result = backend.client.chat_json(body, slot.1).await;
        drop(guard);
        match result {
            Ok(resp) => {
                state.slot_manager.mark_slot_cold(slot);
                Json(resp).into_response()
            }
            Err(e) => {
                warn!(backend = backend.id, error = %e, "backend_error");
                AppError::BackendTransport(e.to_string()).into_response()
            }
        }
    }
}

async fn handle_large(state: Arc<AppState>, payload: CreateChatCompletionPayload, stats: PrefixStats) -> Response {
    let acquisition = match state
        .slot_manager
        .ensure_slot_for_request(
            &state.metadata,
            &stats.key,
            &stats.prefix_text,
            &stats.blocks,
            stats.words_per_block,
            state.config.disk_meta_scan_limit,
        )
        .await
    {
        Ok(a) => a,
        Err(_) => return AppError::Capacity.into_response(),
    };
    let slot = acquisition.slot;
    let guard = acquisition.guard;
    let backend = state.slot_manager.backend_for(slot);
    info!(
        source = acquisition.source.as_str(),
        backend = backend.id,
        url = %backend.url,
        gslot = ?slot,
        lcp_blocks = acquisition.lcp_count,
        binding_blocks = acquisition.binding_total,
        "match_info"
    );

    if payload.stream {
        let body = build_outgoing_body(&payload, true, true);
        match backend.client.chat_stream(body, slot.1).await {
            Ok(StreamPreflight::Ready { stream, .. }) => {
                let dispatcher_stream = DispatcherStream::new(
                    stream,
                    guard,
                    state.slot_manager.clone(),
                    slot,
                    FinishPolicy::ColdOnErrorOnly,
                    true,
                    Some(state.metadata.clone()),
                );
                sse_response(boxed(dispatcher_stream))
            }
            Ok(StreamPreflight::Failed { body, .. }) => {
                drop(guard);
                warn!(backend = backend.id, "backend_error");
                error_response(StatusCode::BAD_GATEWAY, body)
            }
            Err(e) => {
                drop(guard);
                warn!(backend = backend.id, error = %e, "backend_error");
                AppError::BackendTransport(e.to_string()).into_response()
            }
        }
    } else {
        let body = build_outgoing_body(&payload, false, true);
        let result = backend.client.chat_json(body, slot.1).await;
        match result {
            Ok(resp) => {
                if let Err(e) = state.slot_manager.save_slot_cache(slot, &state.metadata).await {
                    warn!(slot = ?slot, error = %e, "slot_save_failed");
                }
                drop(guard);
                Json(resp).into_response()
            }
            Err(e) => {
                drop(guard);
                warn!(backend = backend.id, error = %e, "backend_error");
                AppError::BackendTransport(e.to_string()).into_response()
            }
        }
    }
}

fn sse_response(stream: crate::streaming::BoxedSseStream) -> Response {
    let body = Body::from_stream(stream);
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .body(body)
        .unwrap_or_else(|_| AppError::Internal("failed to build streaming response".into()).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::chars_small(ThresholdMode::Chars, 10, 0, 0, 20, 0, 0, true)]
    #[case::chars_large(ThresholdMode::Chars, 30, 0, 0, 20, 0, 0, false)]
    #[case::chars_boundary(ThresholdMode::Chars, 20, 0, 0, 20, 0, 0, false)]
    #[case::words_small(ThresholdMode::Words, 0, 3, 0, 0, 10, 0, true)]
    #[case::words_large(ThresholdMode::Words, 0, 15, 0, 0, 10, 0, false)]
    #[case::blocks_small(ThresholdMode::Blocks, 0, 0, 1, 0, 0, 5, true)]
    #[case::blocks_large(ThresholdMode::Blocks, 0, 0, 8, 0, 0, 5, false)]
    fn classification_table(
        #[case] mode: ThresholdMode,
        #[case] prefix_len_chars: usize,
        #[case] words_count: usize,
        #[case] blocks_count: usize,
        #[case] min_chars: usize,
        #[case] min_words: usize,
        #[case] min_blocks: usize,
        #[case] expected_small: bool,
    ) {
        assert_eq!(
            is_small(mode, prefix_len_chars, words_count, blocks_count, min_chars, min_words, min_blocks),
            expected_small
        );
    }

    #[rstest]
    #[case::within_range(Some("500".to_string()), 0, 1000, 100, 500)]
    #[case::below_min(Some("0".to_string()), 10, 1000, 100, 100)]
    #[case::above_max(Some("2000".to_string()), 0, 1000, 100, 100)]
    #[case::unparseable(Some("not-a-number".to_string()), 0, 1000, 100, 100)]
    #[case::absent(None, 0, 1000, 100, 100)]
    fn bounded_usize_table(#[case] value: Option<String>, #[case] min: usize, #[case] max: usize, #[case] default: usize, #[case] expected: usize) {
        assert_eq!(resolve_bounded_usize(value, min, max, default), expected);
    }

    #[rstest]
    #[case::explicit_chars("chars", ThresholdMode::Blocks, ThresholdMode::Chars)]
    #[case::explicit_words("WORDS", ThresholdMode::Blocks, ThresholdMode::Words)]
    #[case::explicit_blocks("Blocks", ThresholdMode::Chars, ThresholdMode::Blocks)]
    #[case::invalid_falls_back_to_chars("bogus", ThresholdMode::Words, ThresholdMode::Chars)]
    fn threshold_mode_header_table(#[case] raw: &str, #[case] configured: ThresholdMode, #[case] expected: ThresholdMode) {
        let mut headers = HeaderMap::new();
        headers.insert("x-threshold-mode", raw.parse().unwrap());
        let query = HashMap::new();
        assert_eq!(resolve_threshold_mode(&headers, &query, configured), expected);
    }

    #[test]
    fn threshold_mode_defaults_to_configured_when_absent() {
        let headers = HeaderMap::new();
        let query = HashMap::new();
        assert_eq!(resolve_threshold_mode(&headers, &query, ThresholdMode::Words), ThresholdMode::Words);
    }

    #[test]
    fn block_size_prefers_header_over_body_override() {
        let mut headers = HeaderMap::new();
        headers.insert("x-block-size", "64".parse().unwrap());
        let query = HashMap::new();
        assert_eq!(resolve_block_size(&headers, &query, Some(128), 32), 64);
    }

    #[test]
    fn block_size_falls_back_to_body_override_then_default() {
        let headers = HeaderMap::new();
        let query = HashMap::new();
        assert_eq!(resolve_block_size(&headers, &query, Some(128), 32), 128);
        assert_eq!(resolve_block_size(&headers, &query, None, 32), 32);
    }

    #[test]
    fn block_size_rejects_out_of_range_values() {
        let headers = HeaderMap::new();
        let query = HashMap::new();
        assert_eq!(resolve_block_size(&headers, &query, Some(0), 32), 32);
        assert_eq!(resolve_block_size(&headers, &query, Some(5000), 32), 32);
    }
}
