mod common;

use common::{bag_of_words, MockServer, Reply};
use kube_ops_assistant::rag::{Embedder, EmbeddingError, HttpEmbeddingClient, KeyCheck, RetryPolicy};
use std::time::{Duration, Instant};

const DIMENSIONS: u32 = 64;

#[tokio::test]
async fn test_rate_limit_honours_retry_after() {
    let server = MockServer::start().await;
    server.provider.push(Reply::rate_limited(2));

    let client = HttpEmbeddingClient::new(&server.embedding_config()).unwrap();
    let started = Instant::now();
    let vector = client.embed_one("pod stuck in CrashLoopBackOff").await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(server.provider.calls(), 2);
    let times = server.provider.request_times();
    assert!(times[1].duration_since(times[0]) >= Duration::from_secs(2));
    assert_eq!(vector, bag_of_words("pod stuck in CrashLoopBackOff"));
}

#[tokio::test]
async fn test_rate_limit_gives_up_after_max_retries() {
    let server = MockServer::start().await;
    for _ in 0..2 {
        server.provider.push(Reply::rate_limited(0));
    }

    let client = HttpEmbeddingClient::new(&server.embedding_config())
        .unwrap()
        .with_retry_policy(RetryPolicy {
            max_retries: 2,
            default_retry_after: Duration::ZERO,
            ..RetryPolicy::default()
        });

    let err = client.embed_one("hello").await.unwrap_err();
    assert!(matches!(err, EmbeddingError::RateLimited { attempts: 2, .. }));
    assert_eq!(server.provider.calls(), 2);
}

#[tokio::test]
async fn test_unauthorized_is_auth_failure() {
    let server = MockServer::start().await;
    server.provider.push(Reply::error(401, "invalid api key"));

    let client = HttpEmbeddingClient::new(&server.embedding_config()).unwrap();
    let err = client.embed(&["hello".to_string()]).await.unwrap_err();

    match err {
        EmbeddingError::AuthFailure(message) => assert!(message.contains("invalid api key")),
        other => panic!("expected AuthFailure, got {:?}", other),
    }
    assert_eq!(server.provider.calls(), 1);
}

#[tokio::test]
async fn test_server_error_is_not_retried() {
    let server = MockServer::start().await;
    server.provider.push(Reply::error(500, "model overloaded"));

    let client = HttpEmbeddingClient::new(&server.embedding_config()).unwrap();
    let err = client.embed_one("hello").await.unwrap_err();

    match err {
        EmbeddingError::Api { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "model overloaded");
        }
        other => panic!("expected Api error, got {:?}", other),
    }
    assert_eq!(server.provider.calls(), 1);
}

#[tokio::test]
async fn test_request_body_shape() {
    let server = MockServer::start().await;
    let mut config = server.embedding_config();
    config.batch_size = 2;

    let client = HttpEmbeddingClient::new(&config).unwrap();
    let texts: Vec<String> = ["scale up", "scale down", "restart"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let vectors = client.embed(&texts).await.unwrap();

    assert_eq!(vectors.len(), 3);
    for (text, vector) in texts.iter().zip(&vectors) {
        assert_eq!(vector, &bag_of_words(text));
    }

    let bodies = server.provider.bodies();
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0]["model"], "embedding-3");
    assert_eq!(bodies[0]["input"], serde_json::json!(["scale up", "scale down"]));
    // A single text goes out as a bare string.
    assert_eq!(bodies[1]["input"], "restart");
    assert!(bodies[0].get("dimensions").is_none());

    config.dimensions = Some(DIMENSIONS);
    let client = HttpEmbeddingClient::new(&config).unwrap();
    client.embed_one("restart").await.unwrap();
    assert_eq!(server.provider.bodies()[2]["dimensions"], DIMENSIONS);
}

#[tokio::test]
async fn test_missing_api_key_is_rejected() {
    let server = MockServer::start().await;
    let mut config = server.embedding_config();
    config.api_key = None;

    assert!(matches!(
        HttpEmbeddingClient::new(&config),
        Err(kube_ops_assistant::Error::ConfigMissing(_))
    ));
}

#[tokio::test]
async fn test_verify_api_key() {
    let server = MockServer::start().await;
    let client = HttpEmbeddingClient::new(&server.embedding_config()).unwrap();

    assert_eq!(client.verify_api_key().await.unwrap(), KeyCheck::Valid);

    server.provider.push(Reply::rate_limited(1));
    assert!(matches!(
        client.verify_api_key().await.unwrap(),
        KeyCheck::Inconclusive(_)
    ));

    server.provider.push(Reply::error(401, "token expired"));
    assert!(matches!(
        client.verify_api_key().await,
        Err(EmbeddingError::AuthFailure(_))
    ));
}

fn short_timeout_client(server: &MockServer, max_retries: u32) -> HttpEmbeddingClient {
    let mut config = server.embedding_config();
    config.timeout = Duration::from_millis(300);
    HttpEmbeddingClient::new(&config)
        .unwrap()
        .with_retry_policy(RetryPolicy {
            max_retries,
            timeout_step: Duration::from_millis(200),
            ..RetryPolicy::default()
        })
}

#[tokio::test]
async fn test_timeout_is_retried_with_linear_backoff() {
    let server = MockServer::start().await;
    server.provider.push(Reply::Stall(Duration::from_secs(2)));
    server.provider.push(Reply::Stall(Duration::from_secs(2)));

    let client = short_timeout_client(&server, 5);
    let vector = client.embed_one("node not ready").await.unwrap();

    assert_eq!(vector, bag_of_words("node not ready"));
    assert_eq!(server.provider.calls(), 3);

    // Each gap is the 300ms request timeout plus a wait that grows by 200ms per retry.
    let times = server.provider.request_times();
    assert!(times[1].duration_since(times[0]) >= Duration::from_millis(500));
    assert!(times[2].duration_since(times[1]) >= Duration::from_millis(700));
}

#[tokio::test]
async fn test_timeout_gives_up_after_max_retries() {
    let server = MockServer::start().await;
    server.provider.push(Reply::Stall(Duration::from_secs(2)));
    server.provider.push(Reply::Stall(Duration::from_secs(2)));

    let client = short_timeout_client(&server, 2);
    let err = client.embed_one("node not ready").await.unwrap_err();

    assert!(matches!(err, EmbeddingError::Timeout { attempts: 2 }));
    assert_eq!(server.provider.calls(), 2);
}

#[tokio::test]
async fn test_timeout_while_reading_body_is_retried() {
    let server = MockServer::start().await;
    server.provider.push(Reply::StallBody(Duration::from_secs(3)));

    let client = short_timeout_client(&server, 5);
    let vector = client.embed_one("disk pressure").await.unwrap();

    assert_eq!(vector, bag_of_words("disk pressure"));
    assert_eq!(server.provider.calls(), 2);
}

#[tokio::test]
async fn test_batches_are_spaced_by_request_delay() {
    let server = MockServer::start().await;
    let mut config = server.embedding_config();
    config.batch_size = 1;
    config.request_delay = Duration::from_millis(200);

    let client = HttpEmbeddingClient::new(&config).unwrap();
    let texts: Vec<String> = ["cordon", "drain", "uncordon"].iter().map(|s| s.to_string()).collect();
    let vectors = client.embed(&texts).await.unwrap();

    assert_eq!(vectors.len(), 3);
    let times = server.provider.request_times();
    assert_eq!(times.len(), 3);
    for pair in times.windows(2) {
        assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(200));
    }
}
