//! End-to-end pipeline tests against a fixture upstream.

use std::sync::Arc;
use std::time::Duration;

use axum::response::Response;
use futures::StreamExt;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gateway_audit::AuditStore;
use gateway_core::ChatMessage;
use gateway_history::{FoundationModelCandidate, FoundationModelRow, HistoryStore, NewSequence};
use gateway_providers::{InferenceOptions, OllamaUpstream, ProviderRegistry};
use gateway_retrieval::{Document, InMemoryKnowledge, RetrievalLabel, RetrievalPolicy};

use crate::pipeline::{run_continuation, ContinuationInput};
use crate::state::ServerState;

const TEST_TEMPLATE: &str =
    "{{ if .System }}[{{ .System }}]{{ end }}{{ if .Prompt }}U:{{ .Prompt }} {{ end }}A:{{ .Response }}";

const UPSTREAM_FIXTURE: &str = concat!(
    "{\"model\":\"m1\",\"created_at\":\"2024-05-01T12:00:00Z\",\"response\":\"hi\",\"done\":false}\n",
    "{\"model\":\"m1\",\"created_at\":\"2024-05-01T12:00:02Z\",\"response\":\" world\",\"done\":true,",
    "\"prompt_eval_count\":3,\"eval_count\":2,\"eval_duration\":2000000000,\"prompt_eval_duration\":1000000000}\n",
);

async fn fixture_upstream() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(UPSTREAM_FIXTURE, "application/x-ndjson"),
        )
        .mount(&server)
        .await;
    server
}

fn test_state(upstream_uri: &str, knowledge: InMemoryKnowledge) -> Arc<ServerState> {
    Arc::new(ServerState {
        history: Arc::new(HistoryStore::open_in_memory().unwrap()),
        audit: Arc::new(AuditStore::open_in_memory().unwrap()),
        registry: Arc::new(ProviderRegistry::new()),
        upstream: OllamaUpstream::new(upstream_uri).unwrap(),
        knowledge: Arc::new(knowledge),
        force_ollama_rag: false,
    })
}

fn seed_model(state: &ServerState) -> FoundationModelRow {
    state
        .history
        .insert_foundation_model(&FoundationModelCandidate {
            human_id: "m1".into(),
            provider_identifiers: state.upstream.identifiers(),
            combined_inference_parameters: Some(json!({"template": TEST_TEMPLATE})),
            ..Default::default()
        })
        .unwrap()
}

fn seed_root_sequence(state: &ServerState, content: &str) -> gateway_history::ChatSequenceRow {
    let (message_id, _) = state
        .history
        .create_message(&ChatMessage::new("user", content))
        .unwrap();
    let (sequence_id, _) = state
        .history
        .create_sequence(&NewSequence {
            current_message: message_id,
            generation_complete: true,
            ..Default::default()
        })
        .unwrap();
    state.history.get_sequence(sequence_id).unwrap().unwrap()
}

fn plain_input(
    original: gateway_history::ChatSequenceRow,
    model: FoundationModelRow,
) -> ContinuationInput {
    ContinuationInput {
        messages: vec![ChatMessage::new("user", "hello")],
        original_sequence: original,
        model,
        options: InferenceOptions::default(),
        retrieval: RetrievalLabel::default(),
        requested_system_message: None,
        reason: "chat sequence".into(),
    }
}

async fn read_ndjson(response: Response) -> Vec<Value> {
    let mut stream = response.into_body().into_data_stream();
    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.unwrap());
    }
    String::from_utf8(collected)
        .unwrap()
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

/// Keep-alive frames are timing-dependent; everything else is not.
fn without_keepalives(lines: Vec<Value>) -> Vec<Value> {
    lines
        .into_iter()
        .filter(|line| {
            !(line["message"]["content"] == json!("")
                && line["done"] == json!(false)
                && line.get("prompt_eval_count").is_none())
        })
        .collect()
}

#[tokio::test]
async fn plain_chat_streams_chunks_and_commits_everything() {
    let server = fixture_upstream().await;
    let state = test_state(&server.uri(), InMemoryKnowledge::default());
    let model = seed_model(&state);
    let original = seed_root_sequence(&state, "hello");

    let response = run_continuation(state.clone(), plain_input(original.clone(), model))
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 218);

    let lines = without_keepalives(read_ndjson(response).await);

    // Chunk order: templated prompt, streamed content in upstream order
    // (terminal done rewritten), then the commit summary.
    assert!(lines[0]["prompt_with_templating"]
        .as_str()
        .unwrap()
        .contains("U:hello"));
    assert_eq!(lines[1]["message"]["content"], json!("hi"));
    assert_eq!(lines[1]["done"], json!(false));
    assert_eq!(lines[2]["message"]["content"], json!(" world"));
    assert_eq!(lines[2]["done"], json!(false));

    let last = lines.last().unwrap();
    assert_eq!(last["done"], json!(true));
    let new_sequence_id = last["new_sequence_id"].as_i64().unwrap();
    let new_message_id = last["new_message_id"].as_i64().unwrap();
    assert!(last["autoname"].as_str().is_some());

    // Committed state: assistant message, pinned child sequence, event stats.
    let message = state.history.get_message(new_message_id).unwrap().unwrap();
    assert_eq!(message.role, "assistant");
    assert_eq!(message.content, "hi world");

    let child = state.history.get_sequence(new_sequence_id).unwrap().unwrap();
    assert!(child.user_pinned);
    assert_eq!(child.parent_sequence, Some(original.id));
    assert!(!state
        .history
        .get_sequence(original.id)
        .unwrap()
        .unwrap()
        .user_pinned);

    let event = state
        .history
        .get_inference_event(child.inference_job_id.unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(event.response_tokens, Some(2));
    assert_eq!(event.response_eval_time, Some(2.0));
    assert_eq!(event.response_error, None);
    assert_eq!(event.parent_sequence, Some(new_sequence_id));
    assert!(event
        .prompt_with_templating
        .as_deref()
        .unwrap()
        .contains("U:hello"));
}

#[tokio::test]
async fn simple_retrieval_injects_context_into_the_upstream_prompt() {
    let server = fixture_upstream().await;
    let knowledge = InMemoryKnowledge::new(vec![Document::new("the sky is blue")]);
    let state = test_state(&server.uri(), knowledge);
    let model = seed_model(&state);
    let original = seed_root_sequence(&state, "why is the sky blue?");

    let mut input = plain_input(original, model);
    input.messages = vec![ChatMessage::new("user", "why is the sky blue?")];
    input.retrieval = RetrievalLabel {
        policy: RetrievalPolicy::Simple,
        ..Default::default()
    };
    input.reason = "prompt+rag".into();

    let response = run_continuation(state.clone(), input).await.unwrap();
    let lines = read_ndjson(response).await;
    assert_eq!(lines.last().unwrap()["done"], json!(true));

    let requests = server.received_requests().await.unwrap();
    let generate_bodies: Vec<Value> = requests
        .iter()
        .filter(|request| request.url.path() == "/api/generate")
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect();
    assert!(!generate_bodies.is_empty());
    assert!(generate_bodies[0]["prompt"]
        .as_str()
        .unwrap()
        .contains("<context>\nthe sky is blue\n</context>"));
}

#[tokio::test]
async fn failed_sequence_commit_leaves_the_event_and_no_orphans() {
    let server = fixture_upstream().await;
    let state = test_state(&server.uri(), InMemoryKnowledge::default());
    let model = seed_model(&state);

    // A parent that does not exist: finalisation's commit step must fail.
    let phantom = gateway_history::ChatSequenceRow {
        id: 9_999,
        human_desc: Some("already named".into()),
        user_pinned: false,
        current_message: 1,
        parent_sequence: None,
        generated_at: None,
        generation_complete: true,
        inference_job_id: None,
        inference_error: None,
    };

    let response = run_continuation(state.clone(), plain_input(phantom, model))
        .await
        .unwrap();
    let lines = read_ndjson(response).await;

    let last = lines.last().unwrap();
    assert_eq!(last["done"], json!(true));
    assert!(last["error"].as_str().is_some());

    // The event persists, fully populated, with no error of its own.
    let event = state.history.get_inference_event(1).unwrap().unwrap();
    assert_eq!(event.response_error, None);
    assert!(event.response_info.is_some());
    assert_eq!(event.parent_sequence, None);

    // No orphan assistant message or sequence was committed.
    assert!(state
        .history
        .lookup_message("assistant", "hi world")
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn client_disconnect_does_not_cancel_the_commit() {
    let server = fixture_upstream().await;
    let state = test_state(&server.uri(), InMemoryKnowledge::default());
    let model = seed_model(&state);
    let original = seed_root_sequence(&state, "hello");

    let response = run_continuation(state.clone(), plain_input(original, model))
        .await
        .unwrap();
    // Walk away without reading a single chunk.
    drop(response);

    let mut committed = None;
    for _ in 0..100 {
        committed = state
            .history
            .lookup_message("assistant", "hi world")
            .unwrap();
        if committed.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(
        committed.is_some(),
        "the driver task must commit even with no reader"
    );
}
