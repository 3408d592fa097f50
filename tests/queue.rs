// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
#![cfg(feature = "redis-tests")]

//! End-to-end tests against a live Redis instance. Each test picks a
//! UUID-prefixed key namespace so concurrent test runs never collide, then
//! tears its own keys down at the end.

use std::time::Duration;

use relyq::{Config, ConnectionConfig, MapTask, ReliableQueue, Task};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn test_queue(config: Config) -> ReliableQueue<MapTask> {
    ReliableQueue::new(ConnectionConfig::new(redis_url()), config).expect("build queue")
}

fn unique_prefix(name: &str) -> String {
    format!("relyq-test-{name}-{}", uuid::Uuid::new_v4())
}

async fn cleanup(queue: &ReliableQueue<MapTask>) {
    let _ = queue.todo().clear().await;
    let _ = queue.doing().clear().await;
    let _ = queue.done().clear().await;
    let _ = queue.failed().clear().await;
}

#[tokio::test]
async fn simple_push_and_process() {
    let queue = test_queue(Config::new(unique_prefix("simple")).id_field("task_id"));

    let mut task = queue.new_task();
    task.insert("payload", "alpha");
    queue.push(&mut task).await.expect("push");
    assert!(task.get("task_id").is_some(), "identifier lands in the configured id_field");

    let mut claimed = queue.new_task();
    let got = queue.process(&mut claimed).await.expect("process");
    assert!(got);
    assert_eq!(claimed.get("payload"), task.get("payload"));
    assert_eq!(claimed.identifier(), task.identifier());

    assert_eq!(queue.todo().length().await.unwrap(), 0);
    assert_eq!(queue.doing().length().await.unwrap(), 1);

    cleanup(&queue).await;
}

#[tokio::test]
async fn clean_finish_drops_payload_and_reference() {
    let queue = test_queue(Config::new(unique_prefix("finish")));

    let mut task = MapTask::new();
    task.insert("payload", "bravo");
    queue.push(&mut task).await.unwrap();

    let mut claimed = MapTask::new();
    queue.process(&mut claimed).await.unwrap();
    queue.finish(&claimed).await.expect("finish");

    assert_eq!(queue.doing().length().await.unwrap(), 0);
    assert_eq!(queue.done().length().await.unwrap(), 0);

    let mut out = MapTask::new();
    let err = queue.get_payload(&claimed.identifier().unwrap(), &mut out).await;
    assert!(err.is_err(), "payload should be gone after a clean finish");

    cleanup(&queue).await;
}

#[tokio::test]
async fn done_queue_retains_reference_when_configured() {
    let queue = test_queue(
        Config::new(unique_prefix("done-queue"))
            .use_done_queue(true)
            .keep_done_tasks(true),
    );

    let mut task = MapTask::new();
    task.insert("payload", "charlie");
    queue.push(&mut task).await.unwrap();

    let mut claimed = MapTask::new();
    queue.process(&mut claimed).await.unwrap();
    queue.finish(&claimed).await.expect("finish");

    assert_eq!(queue.doing().length().await.unwrap(), 0);
    assert_eq!(queue.done().length().await.unwrap(), 1);

    cleanup(&queue).await;
    queue.done().clear().await.unwrap();
}

#[tokio::test]
async fn fail_path_moves_task_to_failed() {
    let queue = test_queue(Config::new(unique_prefix("fail")));

    let mut task = MapTask::new();
    task.insert("payload", "delta");
    queue.push(&mut task).await.unwrap();

    let mut claimed = MapTask::new();
    queue.process(&mut claimed).await.unwrap();
    queue.fail(&claimed).await.expect("fail");

    assert_eq!(queue.doing().length().await.unwrap(), 0);
    assert_eq!(queue.failed().length().await.unwrap(), 1);

    cleanup(&queue).await;
}

#[tokio::test]
async fn finish_falls_back_to_failed_list() {
    let queue = test_queue(Config::new(unique_prefix("finish-after-fail")));

    let mut task = MapTask::new();
    task.insert("payload", "echo");
    queue.push(&mut task).await.unwrap();

    let mut claimed = MapTask::new();
    queue.process(&mut claimed).await.unwrap();
    queue.fail(&claimed).await.unwrap();

    // A worker can still retroactively mark a failed task finished, e.g.
    // after a human operator manually resolved it.
    queue.finish(&claimed).await.expect("finish after fail");

    assert_eq!(queue.failed().length().await.unwrap(), 0);

    cleanup(&queue).await;
}

#[tokio::test]
async fn listener_delivers_tasks_and_shuts_down_cleanly() {
    let queue = test_queue(Config::new(unique_prefix("listener")));

    let mut listener = queue.listen(MapTask::new).expect("listen");

    let mut task = MapTask::new();
    task.insert("payload", "foxtrot");
    queue.push(&mut task).await.unwrap();

    let claimed = tokio::time::timeout(Duration::from_secs(5), listener.tasks.recv())
        .await
        .expect("task arrives before timeout")
        .expect("channel still open");
    assert_eq!(claimed.get("payload"), task.get("payload"));

    listener
        .finish
        .as_ref()
        .unwrap()
        .send(claimed)
        .expect("send to finish sink");

    // Give the finish sink a moment to process before tearing down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.doing().length().await.unwrap(), 0);

    listener.close().await;

    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        while listener.errors.recv().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok(), "errors channel should close within the timeout");

    cleanup(&queue).await;
}
