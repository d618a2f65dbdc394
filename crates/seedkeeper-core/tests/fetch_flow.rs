mod common;

use std::sync::Arc;

use seedkeeper_core::{ContentDescriptor, SubmitRequest, TransferError, TransferOutcome, TransferPhase};

use common::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fetched_descriptor_for_a_busy_session_is_not_left_behind() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = test_config(dir.path());
    let engine = engine();
    engine.set_stalled(true);
    let recorder = Arc::new(Recorder::default());
    let sup = supervisor(cfg.clone(), &engine, &recorder);

    sup.submit(SubmitRequest::new(
        "chat",
        ContentDescriptor::direct(movie_descriptor(PAYLOAD)),
    ))
    .await
    .expect("first transfer");
    recorder.wait_phase("chat", TransferPhase::Transferring).await;

    let base = serve_descriptor(movie_descriptor(PAYLOAD)).await;
    let err = sup
        .submit_input("chat", &format!("{base}/movie.torrent"))
        .await
        .expect_err("session busy");
    assert_eq!(err, TransferError::AlreadyActive("chat".into()));
    assert!(spooled_files(&cfg).is_empty(), "{:?}", spooled_files(&cfg));

    sup.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sessions_fetching_the_same_link_keep_their_own_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = test_config(dir.path());
    let engine = engine();
    engine.set_stalled(true);
    let recorder = Arc::new(Recorder::default());
    let sup = supervisor(cfg.clone(), &engine, &recorder);
    let url = format!(
        "{}/movie.torrent",
        serve_descriptor(movie_descriptor(PAYLOAD)).await
    );

    let first = sup.submit_input("a", &url).await.expect("a");
    sup.submit_input("b", &url).await.expect("b");
    let spooled = spooled_files(&cfg);
    assert_eq!(spooled.len(), 2, "{spooled:?}");
    let name = |p: &std::path::PathBuf| p.file_name().map(|n| n.to_string_lossy().into_owned());
    assert!(name(&spooled[0]).is_some_and(|n| n.starts_with("a-")));
    assert!(name(&spooled[1]).is_some_and(|n| n.starts_with("b-")));

    assert!(sup.cancel("a").await);
    assert_eq!(first.outcome().await, Some(TransferOutcome::Cancelled));
    assert_eq!(spooled_files(&cfg), vec![spooled[1].clone()]);

    sup.shutdown().await;
    assert!(spooled[1].exists(), "kept for the resumed transfer");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submit_refused_at_shutdown_drops_its_descriptor_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine();
    let recorder = Arc::new(Recorder::default());
    let sup = supervisor(test_config(dir.path()), &engine, &recorder);
    sup.shutdown().await;

    let spooled = dir.path().join("late.torrent");
    std::fs::write(&spooled, movie_descriptor(STEP)).expect("write");
    let err = sup
        .submit(
            SubmitRequest::new("late", ContentDescriptor::direct(movie_descriptor(STEP)))
                .with_descriptor_file(&spooled),
        )
        .await
        .expect_err("refused");
    assert_eq!(err, TransferError::ShuttingDown);
    assert!(!spooled.exists());
}
