//! Integration tests for the coalescing pipeline core:
//! - request coalescing and fan-out
//! - cancellation semantics (partial vs last subscriber, idempotence)
//! - priority propagation and re-sorting of queued fetches
//! - result-cache short-circuiting
//! - processing and failure delivery

mod common;

use common::*;
use pixelpipe::{
    CachePolicy, ImageLoadError, ImagePipeline, ImageRequest, ImageResponse, PipelineConfig,
    PipelineServices, Priority, TaskCallbacks,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type Outcome = Result<ImageResponse, ImageLoadError>;

fn build_pipeline(
    loader: Arc<ScriptedLoader>,
    decoder: Arc<TestDecoder>,
    config: PipelineConfig,
) -> ImagePipeline {
    let services =
        PipelineServices::new(loader).with_decoder_selector(fixed_decoder_selector(decoder));
    ImagePipeline::new(services, config)
}

/// Submits a request whose completion lands on the returned channel.
fn submit_with_channel(
    pipeline: &ImagePipeline,
    request: ImageRequest,
) -> (pixelpipe::ImageTask, mpsc::UnboundedReceiver<Outcome>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = pipeline.submit(
        request,
        TaskCallbacks::new().on_completion(move |result| {
            let _ = tx.send(result);
        }),
    );
    (task, rx)
}

async fn recv_outcome(rx: &mut mpsc::UnboundedReceiver<Outcome>) -> Outcome {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for completion")
        .expect("completion channel closed")
}

#[tokio::test]
async fn test_coalesced_submissions_share_one_fetch() {
    let loader = Arc::new(ScriptedLoader::new());
    let decoder = Arc::new(TestDecoder::new());
    loader.script(
        "https://img.test/a",
        vec![
            Step::Delay(Duration::from_millis(50)),
            Step::Chunk(vec![1u8; 10], ok_response(10)),
        ],
    );

    let pipeline = build_pipeline(
        Arc::clone(&loader),
        Arc::clone(&decoder),
        PipelineConfig::default(),
    );

    let request = ImageRequest::new("https://img.test/a");
    let (_t1, mut rx1) = submit_with_channel(&pipeline, request.clone());
    let (_t2, mut rx2) = submit_with_channel(&pipeline, request.clone());
    let (_t3, mut rx3) = submit_with_channel(&pipeline, request);

    let r1 = recv_outcome(&mut rx1).await.expect("task 1 should succeed");
    let r2 = recv_outcome(&mut rx2).await.expect("task 2 should succeed");
    let r3 = recv_outcome(&mut rx3).await.expect("task 3 should succeed");

    // One fetch, one decode chain, identical payload for every subscriber.
    assert_eq!(loader.load_count(), 1);
    assert_eq!(decoder.final_decodes.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(r1.image.image(), r2.image.image()));
    assert!(Arc::ptr_eq(r1.image.image(), r3.image.image()));

    let metrics = pipeline.metrics();
    assert_eq!(metrics.sessions_created, 1);
    assert_eq!(metrics.tasks_coalesced, 2);
    assert_eq!(metrics.tasks_completed, 3);
    assert_eq!(metrics.sessions_torn_down, 1);
}

#[tokio::test]
async fn test_cache_hit_short_circuits_without_session() {
    let loader = Arc::new(ScriptedLoader::new());
    let decoder = Arc::new(TestDecoder::new());
    loader.script(
        "https://img.test/a",
        vec![Step::Chunk(vec![1u8; 8], ok_response(8))],
    );

    let pipeline = build_pipeline(
        Arc::clone(&loader),
        Arc::clone(&decoder),
        PipelineConfig::default(),
    );

    let (_t1, mut rx1) = submit_with_channel(&pipeline, ImageRequest::new("https://img.test/a"));
    let first = recv_outcome(&mut rx1).await.expect("first load succeeds");
    assert!(!first.cache_hit);

    let (t2, mut rx2) = submit_with_channel(&pipeline, ImageRequest::new("https://img.test/a"));
    let second = recv_outcome(&mut rx2).await.expect("cached load succeeds");

    assert!(second.cache_hit);
    assert!(Arc::ptr_eq(first.image.image(), second.image.image()));
    assert!(t2.metrics().was_cache_hit());

    // No second fetch, no second session, no second decode.
    assert_eq!(loader.load_count(), 1);
    assert_eq!(decoder.final_decodes.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.metrics().sessions_created, 1);
    assert_eq!(pipeline.metrics().cache_hits, 1);
}

#[tokio::test]
async fn test_cache_read_opt_out_refetches() {
    let loader = Arc::new(ScriptedLoader::new());
    let decoder = Arc::new(TestDecoder::new());
    for _ in 0..2 {
        loader.script(
            "https://img.test/a",
            vec![Step::Chunk(vec![1u8; 8], ok_response(8))],
        );
    }

    let pipeline = build_pipeline(
        Arc::clone(&loader),
        Arc::clone(&decoder),
        PipelineConfig::default(),
    );

    let (_t1, mut rx1) = submit_with_channel(&pipeline, ImageRequest::new("https://img.test/a"));
    recv_outcome(&mut rx1).await.expect("first load succeeds");

    let request = ImageRequest::new("https://img.test/a").with_cache_policy(CachePolicy {
        read_allowed: false,
        write_allowed: true,
    });
    let (_t2, mut rx2) = submit_with_channel(&pipeline, request);
    let second = recv_outcome(&mut rx2).await.expect("refetch succeeds");

    assert!(!second.cache_hit);
    assert_eq!(loader.load_count(), 2);
}

#[tokio::test]
async fn test_cancelling_one_subscriber_keeps_fetch_alive() {
    let loader = Arc::new(ScriptedLoader::new());
    let decoder = Arc::new(TestDecoder::new());
    loader.script(
        "https://img.test/a",
        vec![
            Step::Delay(Duration::from_millis(100)),
            Step::Chunk(vec![1u8; 10], ok_response(10)),
        ],
    );

    let pipeline = build_pipeline(
        Arc::clone(&loader),
        Arc::clone(&decoder),
        PipelineConfig::default(),
    );

    let request = ImageRequest::new("https://img.test/a");
    let (task_a, mut rx_a) = submit_with_channel(&pipeline, request.clone());
    let (_task_b, mut rx_b) = submit_with_channel(&pipeline, request);

    assert!(wait_until(1000, || loader.load_count() == 1).await);
    task_a.cancel();

    // B still completes from the shared fetch; A hears nothing.
    let result_b = recv_outcome(&mut rx_b).await;
    assert!(result_b.is_ok());
    assert!(rx_a.try_recv().is_err());
    assert_eq!(loader.load_count(), 1);
}

#[tokio::test]
async fn test_cancelling_last_subscriber_tears_down_session() {
    let loader = Arc::new(ScriptedLoader::new());
    let decoder = Arc::new(TestDecoder::new());
    loader.script(
        "https://img.test/a",
        vec![
            Step::Delay(Duration::from_millis(500)),
            Step::Chunk(vec![1u8; 10], ok_response(10)),
        ],
    );

    let pipeline = build_pipeline(
        Arc::clone(&loader),
        Arc::clone(&decoder),
        PipelineConfig::default(),
    );

    let (task, mut rx) = submit_with_channel(&pipeline, ImageRequest::new("https://img.test/a"));
    assert!(wait_until(1000, || loader.load_count() == 1).await);

    task.cancel();
    assert!(wait_until(1000, || pipeline.metrics().sessions_torn_down == 1).await);

    // A cancelled task receives neither success nor failure.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(pipeline.metrics().tasks_completed, 0);
    assert_eq!(pipeline.metrics().tasks_failed, 0);
    assert!(task.metrics().was_cancelled());
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let loader = Arc::new(ScriptedLoader::new());
    let decoder = Arc::new(TestDecoder::new());
    loader.script(
        "https://img.test/a",
        vec![
            Step::Delay(Duration::from_millis(200)),
            Step::Chunk(vec![1u8; 10], ok_response(10)),
        ],
    );

    let pipeline = build_pipeline(
        Arc::clone(&loader),
        Arc::clone(&decoder),
        PipelineConfig::default(),
    );

    let (task, _rx) = submit_with_channel(&pipeline, ImageRequest::new("https://img.test/a"));
    assert!(wait_until(1000, || loader.load_count() == 1).await);

    task.cancel();
    task.cancel();
    task.cancel();

    assert!(wait_until(1000, || pipeline.metrics().sessions_torn_down == 1).await);
    assert_eq!(pipeline.metrics().tasks_cancelled, 1);
}

#[tokio::test]
async fn test_priority_raise_reorders_queued_fetches() {
    let loader = Arc::new(ScriptedLoader::new());
    let decoder = Arc::new(TestDecoder::new());
    loader.script(
        "https://img.test/blocker",
        vec![
            Step::Delay(Duration::from_millis(300)),
            Step::Chunk(vec![1u8; 4], ok_response(4)),
        ],
    );
    loader.script(
        "https://img.test/slow-lane",
        vec![Step::Chunk(vec![1u8; 4], ok_response(4))],
    );
    loader.script(
        "https://img.test/fast-lane",
        vec![Step::Chunk(vec![1u8; 4], ok_response(4))],
    );

    // One fetch worker so queue order is observable.
    let pipeline = build_pipeline(
        Arc::clone(&loader),
        Arc::clone(&decoder),
        PipelineConfig::default().with_fetch_concurrency(1),
    );

    let (_blocker, mut rx_blocker) =
        submit_with_channel(&pipeline, ImageRequest::new("https://img.test/blocker"));
    assert!(wait_until(1000, || loader.load_count() == 1).await);

    let (_slow, mut rx_slow) = submit_with_channel(
        &pipeline,
        ImageRequest::new("https://img.test/slow-lane").with_priority(Priority::Normal),
    );
    let (fast, mut rx_fast) = submit_with_channel(
        &pipeline,
        ImageRequest::new("https://img.test/fast-lane").with_priority(Priority::VeryLow),
    );

    // Raise the late submission above the earlier one while both queue.
    fast.set_priority(Priority::VeryHigh);

    recv_outcome(&mut rx_blocker).await.expect("blocker");
    recv_outcome(&mut rx_fast).await.expect("fast lane");
    recv_outcome(&mut rx_slow).await.expect("slow lane");

    assert_eq!(
        loader.requested_urls(),
        vec![
            "https://img.test/blocker",
            "https://img.test/fast-lane",
            "https://img.test/slow-lane",
        ]
    );
}

#[tokio::test]
async fn test_session_priority_is_max_over_subscribers() {
    let loader = Arc::new(ScriptedLoader::new());
    let decoder = Arc::new(TestDecoder::new());
    loader.script(
        "https://img.test/blocker",
        vec![
            Step::Delay(Duration::from_millis(300)),
            Step::Chunk(vec![1u8; 4], ok_response(4)),
        ],
    );
    loader.script(
        "https://img.test/shared",
        vec![Step::Chunk(vec![2u8; 4], ok_response(4))],
    );
    loader.script(
        "https://img.test/other",
        vec![Step::Chunk(vec![3u8; 4], ok_response(4))],
    );

    let pipeline = build_pipeline(
        Arc::clone(&loader),
        Arc::clone(&decoder),
        PipelineConfig::default().with_fetch_concurrency(1),
    );

    let (_blocker, mut rx_blocker) =
        submit_with_channel(&pipeline, ImageRequest::new("https://img.test/blocker"));
    assert!(wait_until(1000, || loader.load_count() == 1).await);

    // "other" queues first at High; "shared" enters at Normal but a second
    // subscriber at VeryHigh raises the session above "other".
    let (_other, mut rx_other) = submit_with_channel(
        &pipeline,
        ImageRequest::new("https://img.test/other").with_priority(Priority::High),
    );
    let (_shared_a, mut rx_a) = submit_with_channel(
        &pipeline,
        ImageRequest::new("https://img.test/shared").with_priority(Priority::Normal),
    );
    let (_shared_b, mut rx_b) = submit_with_channel(
        &pipeline,
        ImageRequest::new("https://img.test/shared").with_priority(Priority::VeryHigh),
    );

    recv_outcome(&mut rx_blocker).await.expect("blocker");
    let a = recv_outcome(&mut rx_a).await.expect("shared a");
    let b = recv_outcome(&mut rx_b).await.expect("shared b");
    recv_outcome(&mut rx_other).await.expect("other");

    assert!(Arc::ptr_eq(a.image.image(), b.image.image()));
    assert_eq!(
        loader.requested_urls(),
        vec![
            "https://img.test/blocker",
            "https://img.test/shared",
            "https://img.test/other",
        ]
    );
    assert_eq!(pipeline.metrics().sessions_created, 3);
}

#[tokio::test]
async fn test_deduplication_disabled_fetches_separately() {
    let loader = Arc::new(ScriptedLoader::new());
    let decoder = Arc::new(TestDecoder::new());
    for _ in 0..2 {
        loader.script(
            "https://img.test/a",
            vec![Step::Chunk(vec![1u8; 6], ok_response(6))],
        );
    }

    // Cache reads off so the second submission cannot short-circuit.
    let pipeline = build_pipeline(
        Arc::clone(&loader),
        Arc::clone(&decoder),
        PipelineConfig::default().with_deduplication(false),
    );

    let request = ImageRequest::new("https://img.test/a").with_cache_policy(CachePolicy {
        read_allowed: false,
        write_allowed: false,
    });
    let (_t1, mut rx1) = submit_with_channel(&pipeline, request.clone());
    let (_t2, mut rx2) = submit_with_channel(&pipeline, request);

    recv_outcome(&mut rx1).await.expect("task 1");
    recv_outcome(&mut rx2).await.expect("task 2");

    assert_eq!(loader.load_count(), 2);
    assert_eq!(pipeline.metrics().sessions_created, 2);
    assert_eq!(pipeline.metrics().tasks_coalesced, 0);
}

#[tokio::test]
async fn test_transport_failure_delivered_to_all_subscribers() {
    let loader = Arc::new(ScriptedLoader::new());
    let decoder = Arc::new(TestDecoder::new());
    loader.script(
        "https://img.test/a",
        vec![
            Step::Chunk(vec![1u8; 4], ok_response(100)),
            Step::Fail(pixelpipe::LoadError::with_status("connection reset", 502)),
        ],
    );

    let pipeline = build_pipeline(
        Arc::clone(&loader),
        Arc::clone(&decoder),
        PipelineConfig::default(),
    );

    let request = ImageRequest::new("https://img.test/a");
    let (_t1, mut rx1) = submit_with_channel(&pipeline, request.clone());
    let (_t2, mut rx2) = submit_with_channel(&pipeline, request);

    for rx in [&mut rx1, &mut rx2] {
        match recv_outcome(rx).await {
            Err(ImageLoadError::LoadFailed(error)) => {
                assert_eq!(error.message, "connection reset");
                assert_eq!(error.status_code, Some(502));
            }
            other => panic!("expected transport failure, got {other:?}"),
        }
    }

    assert_eq!(pipeline.metrics().tasks_failed, 2);
    assert_eq!(loader.load_count(), 1);
}

#[tokio::test]
async fn test_zero_bytes_without_error_is_decode_failure() {
    let loader = Arc::new(ScriptedLoader::new());
    let decoder = Arc::new(TestDecoder::new());
    loader.script("https://img.test/empty", vec![]);

    let pipeline = build_pipeline(
        Arc::clone(&loader),
        Arc::clone(&decoder),
        PipelineConfig::default(),
    );

    let (_task, mut rx) =
        submit_with_channel(&pipeline, ImageRequest::new("https://img.test/empty"));

    match recv_outcome(&mut rx).await {
        Err(ImageLoadError::DecodingFailed) => {}
        other => panic!("expected DecodingFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_final_decode_failure() {
    let loader = Arc::new(ScriptedLoader::new());
    let decoder = Arc::new(TestDecoder::failing_final());
    loader.script(
        "https://img.test/a",
        vec![Step::Chunk(vec![1u8; 8], ok_response(8))],
    );

    let pipeline = build_pipeline(
        Arc::clone(&loader),
        Arc::clone(&decoder),
        PipelineConfig::default(),
    );

    let (_task, mut rx) = submit_with_channel(&pipeline, ImageRequest::new("https://img.test/a"));

    match recv_outcome(&mut rx).await {
        Err(ImageLoadError::DecodingFailed) => {}
        other => panic!("expected DecodingFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_processor_applied_to_final_image() {
    let loader = Arc::new(ScriptedLoader::new());
    let decoder = Arc::new(TestDecoder::new());
    loader.script(
        "https://img.test/a",
        vec![Step::Chunk(vec![1u8; 8], ok_response(8))],
    );

    let pipeline = build_pipeline(
        Arc::clone(&loader),
        Arc::clone(&decoder),
        PipelineConfig::default(),
    );

    let processor = Arc::new(TestProcessor::new("bump"));
    let request =
        ImageRequest::new("https://img.test/a").with_processor(Arc::clone(&processor) as _);
    let (_task, mut rx) = submit_with_channel(&pipeline, request);

    let response = recv_outcome(&mut rx).await.expect("processed load succeeds");

    // TestDecoder produces 8x1; the processor bumps the height.
    assert_eq!(response.image.width(), 8);
    assert_eq!(response.image.height(), 2);
    assert_eq!(processor.invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_processing_failure() {
    let loader = Arc::new(ScriptedLoader::new());
    let decoder = Arc::new(TestDecoder::new());
    loader.script(
        "https://img.test/a",
        vec![Step::Chunk(vec![1u8; 8], ok_response(8))],
    );

    let pipeline = build_pipeline(
        Arc::clone(&loader),
        Arc::clone(&decoder),
        PipelineConfig::default(),
    );

    let request = ImageRequest::new("https://img.test/a")
        .with_processor(Arc::new(TestProcessor::failing("boom")) as _);
    let (_task, mut rx) = submit_with_channel(&pipeline, request);

    match recv_outcome(&mut rx).await {
        Err(ImageLoadError::ProcessingFailed) => {}
        other => panic!("expected ProcessingFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_progress_reported_to_subscribers() {
    let loader = Arc::new(ScriptedLoader::new());
    let decoder = Arc::new(TestDecoder::new());
    loader.script(
        "https://img.test/a",
        vec![
            Step::Chunk(vec![1u8; 4], ok_response(10)),
            Step::Delay(Duration::from_millis(30)),
            Step::Chunk(vec![1u8; 6], ok_response(10)),
        ],
    );

    let pipeline = build_pipeline(
        Arc::clone(&loader),
        Arc::clone(&decoder),
        PipelineConfig::default(),
    );

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let updates = Arc::new(std::sync::Mutex::new(Vec::new()));
    let updates_clone = Arc::clone(&updates);
    let task = pipeline.submit(
        ImageRequest::new("https://img.test/a"),
        TaskCallbacks::new()
            .on_progress(move |completed, total| {
                updates_clone.lock().unwrap().push((completed, total));
            })
            .on_completion(move |result| {
                let _ = done_tx.send(result);
            }),
    );

    tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
        .await
        .expect("timed out")
        .expect("closed")
        .expect("load succeeds");

    let recorded = updates.lock().unwrap().clone();
    assert_eq!(recorded, vec![(4, 10), (10, 10)]);
    assert_eq!(task.progress(), (10, 10));
}

#[tokio::test]
async fn test_cancel_before_admission_is_silent() {
    let loader = Arc::new(ScriptedLoader::new());
    let decoder = Arc::new(TestDecoder::new());
    loader.script(
        "https://img.test/a",
        vec![Step::Chunk(vec![1u8; 4], ok_response(4))],
    );

    let pipeline = build_pipeline(
        Arc::clone(&loader),
        Arc::clone(&decoder),
        PipelineConfig::default(),
    );

    let (task, mut rx) = submit_with_channel(&pipeline, ImageRequest::new("https://img.test/a"));
    // Cancel immediately, racing admission; the preflight check must win or
    // the teardown path must drop the task either way.
    task.cancel();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
    assert!(task.is_cancelled());
}
