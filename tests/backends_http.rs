//! HTTP-level tests for the Ollama backend and embedding provider.

use httpmock::prelude::*;
use serde_json::json;

use retrace::embeddings::{EmbeddingProvider, OllamaEmbeddings};
use retrace::llm::{GenerationBackend, GenerationRequest, OllamaBackend};
use retrace::types::RetraceError;

fn request() -> GenerationRequest {
    GenerationRequest {
        system: "You are a personal knowledge assistant.".into(),
        context: "[1] Conversation: Investing (claude)\nsome evidence".into(),
        question: "What was my strategy?".into(),
        history: Vec::new(),
    }
}

#[tokio::test]
async fn ollama_generate_parses_the_answer() {
    let server = MockServer::start_async().await;
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/api/chat")
            .json_body_partial(r#"{"model": "llama3", "stream": false}"#);
        then.status(200).json_body(json!({
            "model": "llama3",
            "message": { "role": "assistant", "content": "Index funds, mostly." },
            "done": true,
        }));
    });

    let backend = OllamaBackend::new(server.base_url(), "llama3");
    let answer = backend.generate(&request()).await.unwrap();

    assert_eq!(answer, "Index funds, mostly.");
    mock.assert();
}

#[tokio::test]
async fn ollama_server_error_is_a_generation_failure() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/api/chat");
        then.status(500);
    });

    let backend = OllamaBackend::new(server.base_url(), "llama3");
    let result = backend.generate(&request()).await;
    assert!(matches!(
        result,
        Err(RetraceError::GenerationFailed { .. })
    ));
}

#[tokio::test]
async fn ollama_missing_message_is_a_generation_failure() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/api/chat");
        then.status(200).json_body(json!({ "done": true }));
    });

    let backend = OllamaBackend::new(server.base_url(), "llama3");
    assert!(backend.generate(&request()).await.is_err());
}

#[tokio::test]
async fn ollama_empty_answer_is_ok_not_an_error() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/api/chat");
        then.status(200).json_body(json!({
            "message": { "role": "assistant", "content": "" },
        }));
    });

    let backend = OllamaBackend::new(server.base_url(), "llama3");
    let answer = backend.generate(&request()).await.unwrap();
    assert_eq!(answer, "");
}

#[tokio::test]
async fn ollama_availability_probes_tags() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/api/tags");
        then.status(200).json_body(json!({ "models": [] }));
    });

    let backend = OllamaBackend::new(server.base_url(), "llama3");
    assert!(backend.is_available().await);

    let unreachable = OllamaBackend::new("http://127.0.0.1:1", "llama3");
    assert!(!unreachable.is_available().await);
}

#[tokio::test]
async fn embeddings_round_trip() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/api/embeddings");
        then.status(200)
            .json_body(json!({ "embedding": [0.1, 0.2, 0.3] }));
    });

    let provider = OllamaEmbeddings::new(server.base_url(), "nomic-embed-text");
    let vector = provider.embed("some query").await.unwrap();
    assert_eq!(vector, vec![0.1, 0.2, 0.3]);
}

#[tokio::test]
async fn empty_embedding_is_an_error() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/api/embeddings");
        then.status(200).json_body(json!({ "embedding": [] }));
    });

    let provider = OllamaEmbeddings::new(server.base_url(), "nomic-embed-text");
    assert!(matches!(
        provider.embed("q").await,
        Err(RetraceError::Embedding(_))
    ));
}
