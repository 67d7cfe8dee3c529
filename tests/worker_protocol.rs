use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use mdworker::application::render::{
    ClientError, KatexEngine, MathEngine, MathError, MathKind, RenderClient,
    RenderPipelineConfig, RenderPool, RenderResponse, RenderWorker,
};
use tokio::sync::mpsc;

struct Plain;

impl MathEngine for Plain {
    fn typeset(&self, source: &str, _kind: MathKind) -> Result<String, MathError> {
        Ok(format!("<m>{source}</m>"))
    }
}

async fn next(responses: &mut mpsc::UnboundedReceiver<RenderResponse>) -> RenderResponse {
    tokio::time::timeout(Duration::from_secs(60), responses.recv())
        .await
        .expect("response before timeout")
        .expect("worker still running")
}

async fn shutdown(worker: RenderWorker) {
    tokio::task::spawn_blocking(move || worker.shutdown())
        .await
        .expect("join")
        .expect("clean shutdown");
}

#[tokio::test]
async fn one_worker_answers_in_request_order() {
    let (worker, mut responses) =
        RenderWorker::spawn(0, RenderPipelineConfig::default(), Arc::new(Plain)).expect("spawn");

    for (id, markdown) in [("1", "# one"), ("2", "```rust\nlet two = 2;\n```"), ("3", "three")] {
        let frame = serde_json::json!({ "id": id, "markdown": markdown }).to_string();
        worker.submit_raw(frame).expect("submit");
    }

    let ids = vec![
        next(&mut responses).await.id().to_string(),
        next(&mut responses).await.id().to_string(),
        next(&mut responses).await.id().to_string(),
    ];
    assert_eq!(ids, vec!["1", "2", "3"]);

    shutdown(worker).await;
}

#[tokio::test]
async fn malformed_frames_are_silently_dropped() {
    let (worker, mut responses) =
        RenderWorker::spawn(0, RenderPipelineConfig::default(), Arc::new(Plain)).expect("spawn");

    for frame in [
        "",
        "{",
        "[]",
        r#"{"id": 5, "markdown": "numeric id"}"#,
        r#"{"id": "no-markdown"}"#,
        r#"{"id": "last", "markdown": "ok"}"#,
    ] {
        worker.submit_raw(frame).expect("submit");
    }

    let response = next(&mut responses).await;
    assert_eq!(response, RenderResponse::html("last", "<p>ok</p>\n"));

    shutdown(worker).await;
    assert!(responses.recv().await.is_none());
}

#[tokio::test]
async fn response_frames_have_exactly_one_payload_field() {
    let (worker, mut responses) =
        RenderWorker::spawn(0, RenderPipelineConfig::default(), Arc::new(Plain)).expect("spawn");
    worker
        .submit_raw(r#"{"id":"json","markdown":"*hi*"}"#)
        .expect("submit");

    let value = serde_json::to_value(next(&mut responses).await).expect("encode");
    assert_eq!(
        value,
        serde_json::json!({ "id": "json", "html": "<p><em>hi</em></p>\n" })
    );

    shutdown(worker).await;
}

#[tokio::test]
async fn katex_failures_render_as_marked_html() {
    let (worker, mut responses) =
        RenderWorker::spawn(0, RenderPipelineConfig::default(), Arc::new(KatexEngine))
            .expect("spawn");
    worker.initialize().await.expect("engine initializes");

    worker
        .submit_raw(serde_json::json!({ "id": "bad", "markdown": r"$$\frac{1}{$$" }).to_string())
        .expect("submit");
    worker
        .submit_raw(serde_json::json!({ "id": "good", "markdown": "$x^2$" }).to_string())
        .expect("submit");

    let bad = next(&mut responses).await;
    assert_eq!(bad.id(), "bad");
    let html = bad.into_result().expect("html, not error");
    assert!(html.contains("class=\"math-error\""));
    assert!(html.contains(r"$$\frac{1}{$$"));

    let good = next(&mut responses).await.into_result().expect("html");
    assert!(good.contains("class=\"katex\""));
    assert!(!good.contains("math-error"));

    shutdown(worker).await;
}

#[tokio::test]
async fn client_correlates_responses_across_a_pool() {
    let instances = NonZeroUsize::new(3).expect("non-zero");
    let (pool, responses) =
        RenderPool::spawn(instances, RenderPipelineConfig::default(), Arc::new(Plain))
            .expect("spawn pool");
    pool.initialize().await.expect("pool initializes");

    let client = RenderClient::new(pool, responses).with_timeout(Duration::from_secs(60));
    let (a, b, c, d) = tokio::join!(
        client.render("a", "alpha $a$"),
        client.render("b", "```mermaid\nA-->B\n```"),
        client.render("c", "gamma"),
        client.render_markdown("delta"),
    );

    assert_eq!(a.expect("a"), "<p>alpha <m>a</m></p>\n");
    assert!(b.expect("b").contains("data-diagram=\"mermaid\""));
    assert_eq!(c.expect("c"), "<p>gamma</p>\n");
    assert_eq!(d.expect("d"), "<p>delta</p>\n");
    assert_eq!(client.mailbox().pending(), 0);

    let duplicate = {
        let _pending = client.mailbox().register("dup".into()).expect("register");
        client.render("dup", "again").await
    };
    assert!(matches!(duplicate, Err(ClientError::Mailbox(_))));

    let pool = client.into_sink();
    tokio::task::spawn_blocking(move || pool.shutdown())
        .await
        .expect("join")
        .expect("clean shutdown");
}
