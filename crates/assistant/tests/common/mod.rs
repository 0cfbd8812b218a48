//! Local stand-in for the embedding provider, served with axum on an
//! ephemeral port.

#![allow(dead_code)]

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use futures::StreamExt;
use kube_ops_assistant::config::{EmbeddingConfig, StoreConfig};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DIMENSION: usize = 64;

/// A scripted reply; once the script is exhausted every call succeeds.
#[derive(Debug, Clone)]
pub enum Reply {
    Error {
        status: u16,
        message: &'static str,
        retry_after: Option<u64>,
    },
    /// Wait before sending anything, then answer normally.
    Stall(Duration),
    /// Send a 200 with the start of the body, then wait before finishing it.
    StallBody(Duration),
}

impl Reply {
    pub fn error(status: u16, message: &'static str) -> Self {
        Reply::Error {
            status,
            message,
            retry_after: None,
        }
    }

    pub fn rate_limited(retry_after: u64) -> Self {
        Reply::Error {
            status: 429,
            message: "rate limit reached for requests",
            retry_after: Some(retry_after),
        }
    }
}

#[derive(Default)]
pub struct MockProvider {
    script: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<(Instant, Value)>>,
}

impl MockProvider {
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request_times(&self) -> Vec<Instant> {
        self.requests.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    pub fn bodies(&self) -> Vec<Value> {
        self.requests.lock().unwrap().iter().map(|(_, b)| b.clone()).collect()
    }

    pub fn push(&self, reply: Reply) {
        self.script.lock().unwrap().push_back(reply);
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub provider: Arc<MockProvider>,
}

impl MockServer {
    pub async fn start() -> Self {
        let provider = Arc::new(MockProvider::default());
        let app = Router::new()
            .route("/v4/embeddings", post(embeddings))
            .with_state(provider.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, provider }
    }

    pub fn url(&self) -> String {
        format!("http://{}/v4/embeddings", self.addr)
    }

    pub fn embedding_config(&self) -> EmbeddingConfig {
        EmbeddingConfig {
            api_key: Some("test-key".to_string()),
            api_base: self.url(),
            request_delay: Duration::ZERO,
            timeout: Duration::from_secs(10),
            ..EmbeddingConfig::default()
        }
    }
}

pub fn fast_store_config() -> StoreConfig {
    StoreConfig {
        batch_size: 2,
        batch_delay: Duration::ZERO,
        max_attempts: 3,
        retry_wait: Duration::ZERO,
    }
}

/// Bag-of-words vector: each lowercase word is hashed into one bucket.
pub fn bag_of_words(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0; DIMENSION];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in word.to_lowercase().bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        vector[(hash % DIMENSION as u64) as usize] += 1.0;
    }
    vector
}

async fn embeddings(State(provider): State<Arc<MockProvider>>, Json(body): Json<Value>) -> Response {
    provider
        .requests
        .lock()
        .unwrap()
        .push((Instant::now(), body.clone()));

    let scripted = provider.script.lock().unwrap().pop_front();
    match scripted {
        Some(Reply::Error {
            status,
            message,
            retry_after,
        }) => {
            let status = StatusCode::from_u16(status).unwrap();
            let body = Json(json!({ "error": { "code": status.as_u16().to_string(), "message": message } }));
            return match retry_after {
                Some(secs) => (status, [(header::RETRY_AFTER, secs.to_string())], body).into_response(),
                None => (status, body).into_response(),
            };
        }
        Some(Reply::Stall(delay)) => tokio::time::sleep(delay).await,
        Some(Reply::StallBody(delay)) => {
            let head = futures::stream::once(async { Ok::<_, std::io::Error>(Bytes::from_static(b"{\"data\":[")) });
            let tail = futures::stream::once(async move {
                tokio::time::sleep(delay).await;
                Ok::<_, std::io::Error>(Bytes::from_static(b"]}"))
            });
            return (
                [(header::CONTENT_TYPE, "application/json")],
                Body::from_stream(head.chain(tail)),
            )
                .into_response();
        }
        None => {}
    }

    let inputs: Vec<String> = match &body["input"] {
        Value::String(text) => vec![text.clone()],
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().unwrap_or_default().to_string())
            .collect(),
        _ => return (StatusCode::BAD_REQUEST, Json(json!({ "error": { "message": "missing input" } }))).into_response(),
    };

    let data: Vec<Value> = inputs
        .iter()
        .enumerate()
        .map(|(i, text)| json!({ "object": "embedding", "index": i, "embedding": bag_of_words(text) }))
        .collect();

    Json(json!({ "object": "list", "model": body["model"], "data": data })).into_response()
}
