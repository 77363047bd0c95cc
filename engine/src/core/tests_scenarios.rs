//! End-to-end annotation scenarios driven through the controller.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::{mpsc, Semaphore};

use crate::core::{
    annotations::{AnnotationStore, ApplyOutcome, FrameStatus},
    controller::{AnnotationController, BatchItemStatus},
    segmentation::testing::ScriptedProvider,
    settings::AnnotatorSettings,
    CoreError, PointLabel,
};

fn write_images(dir: &Path, names: &[&str]) {
    for name in names {
        image::RgbImage::new(64, 48).save(dir.join(name)).unwrap();
    }
}

fn setup(
    names: &[&str],
    provider: ScriptedProvider,
    settings: AnnotatorSettings,
) -> (TempDir, AnnotationController, Arc<ScriptedProvider>) {
    let dir = TempDir::new().unwrap();
    write_images(dir.path(), names);
    let provider = Arc::new(provider);
    let controller = AnnotationController::new(provider.clone(), settings);
    controller.open_folder(dir.path()).unwrap();
    (dir, controller, provider)
}

/// Waits until `condition` holds, yielding to other tasks in between
async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached");
}

// -----------------------------------------------------------------------------
// Interactive annotation
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_point_recompute_edit_navigate() {
    let (dir, controller, _) = setup(
        &["a.png", "b.png"],
        ScriptedProvider::new(),
        AnnotatorSettings::default(),
    );

    let id = controller.on_point(10.0, 10.0, PointLabel::Positive).unwrap();
    assert_eq!(id, "o1");
    let frame = controller.snapshot().unwrap();
    assert_eq!(frame.active_object_id.as_deref(), Some("o1"));
    assert_eq!(frame.objects[0].points.len(), 1);
    assert!(frame.objects[0].mask.is_none());
    assert_eq!(controller.status().unwrap(), FrameStatus::MasksStale);

    let outcome = controller.recompute().await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Applied(1));
    assert_eq!(controller.status().unwrap(), FrameStatus::MasksCurrent);
    let mask = controller.snapshot().unwrap().objects[0].mask.clone().unwrap();
    assert!(mask.contains(10, 10));

    controller.on_point(50.0, 40.0, PointLabel::Negative).unwrap();
    assert!(controller.snapshot().unwrap().objects[0].mask.is_none());
    assert_eq!(controller.status().unwrap(), FrameStatus::MasksStale);

    let position = controller.navigate(1).unwrap();
    assert_eq!(position.image_id, "b.png");
    assert_eq!(controller.status().unwrap(), FrameStatus::Empty);

    let saved = AnnotationStore::new(dir.path()).load("a.png").unwrap().unwrap();
    assert_eq!(saved.objects.len(), 1);
    assert_eq!(saved.objects[0].points.len(), 2);
}

#[tokio::test]
async fn test_next_object_cycles() {
    let (_dir, controller, _) = setup(
        &["a.png"],
        ScriptedProvider::new(),
        AnnotatorSettings::default(),
    );

    assert_eq!(controller.new_object().unwrap(), "o1");
    assert_eq!(controller.new_object().unwrap(), "o2");
    assert_eq!(controller.next_object().unwrap(), "o1");
    assert_eq!(controller.next_object().unwrap(), "o2");
    assert_eq!(controller.next_object().unwrap(), "o1");
}

#[tokio::test]
async fn test_masks_and_points_survive_reload() {
    let (dir, controller, _) = setup(
        &["a.png", "b.png"],
        ScriptedProvider::new(),
        AnnotatorSettings::default(),
    );
    controller.on_point(20.0, 20.0, PointLabel::Positive).unwrap();
    controller.new_object().unwrap();
    controller.on_point(40.0, 30.0, PointLabel::Positive).unwrap();
    controller.recompute().await.unwrap();
    let before = controller.snapshot().unwrap();
    controller.close_session().unwrap();

    let reopened = AnnotationController::new(
        Arc::new(ScriptedProvider::new()),
        AnnotatorSettings::default(),
    );
    reopened.open_folder(dir.path()).unwrap();
    let after = reopened.snapshot().unwrap();

    assert_eq!(after.objects.len(), 2);
    assert_eq!(after.active_object_id, before.active_object_id);
    for (a, b) in after.objects.iter().zip(&before.objects) {
        assert_eq!(a.points, b.points);
        assert_eq!(a.mask.as_ref().map(|m| m.data()), b.mask.as_ref().map(|m| m.data()));
    }
    assert_eq!(reopened.status().unwrap(), FrameStatus::MasksCurrent);
}

// -----------------------------------------------------------------------------
// Segmentation failures and races
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_failed_recompute_keeps_masks() {
    let (_dir, controller, provider) = setup(
        &["a.png"],
        ScriptedProvider::new(),
        AnnotatorSettings::default(),
    );
    controller.on_point(10.0, 10.0, PointLabel::Positive).unwrap();
    controller.recompute().await.unwrap();
    let before = controller.snapshot().unwrap();

    provider.fail_image("a.png");
    let err = controller.recompute().await.unwrap_err();
    assert!(matches!(err, CoreError::SegmentationFailed(_)));
    assert_eq!(controller.snapshot().unwrap(), before);

    // A later retry succeeds
    provider.recover_image("a.png");
    assert_eq!(
        controller.recompute().await.unwrap(),
        ApplyOutcome::Applied(1)
    );
}

#[tokio::test]
async fn test_edit_during_recompute_discards_result() {
    let gate = Arc::new(Semaphore::new(0));
    let (_dir, controller, provider) = setup(
        &["a.png"],
        ScriptedProvider::new().with_gate(gate.clone()),
        AnnotatorSettings::default(),
    );
    controller.on_point(10.0, 10.0, PointLabel::Positive).unwrap();

    let pending = controller.spawn_recompute();
    wait_for(|| provider.calls() == 1).await;

    controller.on_point(30.0, 30.0, PointLabel::Positive).unwrap();
    gate.add_permits(1);

    assert_eq!(pending.await.unwrap().unwrap(), ApplyOutcome::Stale);
    let frame = controller.snapshot().unwrap();
    assert_eq!(frame.objects[0].points.len(), 2);
    assert!(frame.objects[0].mask.is_none());
}

#[tokio::test]
async fn test_navigation_during_recompute_discards_result() {
    let gate = Arc::new(Semaphore::new(0));
    let (_dir, controller, provider) = setup(
        &["a.png", "b.png"],
        ScriptedProvider::new().with_gate(gate.clone()),
        AnnotatorSettings::default(),
    );
    controller.on_point(10.0, 10.0, PointLabel::Positive).unwrap();

    let pending = controller.spawn_recompute();
    wait_for(|| provider.calls() == 1).await;
    controller.navigate(1).unwrap();
    gate.add_permits(1);

    assert_eq!(pending.await.unwrap().unwrap(), ApplyOutcome::Stale);
    controller.navigate(-1).unwrap();
    assert!(controller.snapshot().unwrap().objects[0].mask.is_none());
}

#[tokio::test]
async fn test_second_recompute_is_busy() {
    let gate = Arc::new(Semaphore::new(0));
    let (_dir, controller, provider) = setup(
        &["a.png"],
        ScriptedProvider::new().with_gate(gate.clone()),
        AnnotatorSettings::default(),
    );
    controller.on_point(10.0, 10.0, PointLabel::Positive).unwrap();

    let pending = controller.spawn_recompute();
    wait_for(|| provider.calls() == 1).await;

    assert!(matches!(
        controller.recompute().await,
        Err(CoreError::Busy(_))
    ));
    // State intents stay available while the model runs
    controller.new_object().unwrap();

    gate.add_permits(1);
    pending.await.unwrap().unwrap();
    assert!(!controller.is_recompute_in_flight());
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn test_failed_flush_blocks_navigation() {
    let (dir, controller, _) = setup(
        &["a.png", "b.png"],
        ScriptedProvider::new(),
        AnnotatorSettings::default(),
    );
    controller.on_point(10.0, 10.0, PointLabel::Positive).unwrap();
    // A plain file where the annotations directory belongs
    let blocker = dir.path().join("annotations");
    std::fs::write(&blocker, b"").unwrap();

    assert!(matches!(
        controller.navigate(1),
        Err(CoreError::PersistenceError(_))
    ));
    let position = controller.position().unwrap();
    assert_eq!(position.index, 0);
    assert_eq!(position.image_id, "a.png");
    assert_eq!(controller.snapshot().unwrap().objects[0].points.len(), 1);
    assert!(controller.has_unsaved_changes());

    std::fs::remove_file(&blocker).unwrap();
    assert_eq!(controller.navigate(1).unwrap().image_id, "b.png");
    assert!(blocker.join("a.png.json").exists());
}

#[tokio::test]
async fn test_slow_provider_times_out() {
    let mut settings = AnnotatorSettings::default();
    settings.segmentation.timeout_secs = 1;
    let (_dir, controller, _) = setup(
        &["a.png"],
        ScriptedProvider::new().with_delay(Duration::from_secs(5)),
        settings,
    );
    controller.on_point(10.0, 10.0, PointLabel::Positive).unwrap();

    assert!(matches!(
        controller.recompute().await,
        Err(CoreError::Timeout(1000))
    ));
    assert_eq!(controller.status().unwrap(), FrameStatus::MasksStale);
}

// -----------------------------------------------------------------------------
// Batch processing
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_batch_continues_past_failures() {
    let names = ["a.png", "b.png", "c.png", "d.png"];
    let provider = ScriptedProvider::new();
    provider.fail_image("c.png");
    let (dir, controller, _) = setup(&names, provider, AnnotatorSettings::default());

    controller.on_point(10.0, 10.0, PointLabel::Positive).unwrap();
    controller.new_object().unwrap();
    controller.on_point(30.0, 20.0, PointLabel::Positive).unwrap();
    controller.on_point(32.0, 20.0, PointLabel::Negative).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let report = controller.process_all(Some(tx)).await.unwrap();

    assert_eq!(report.total, 4);
    assert_eq!(report.succeeded(), 3);
    assert_eq!(report.failed(), 1);
    assert!(!report.cancelled);
    assert_eq!(report.outcomes[2].image_id, "c.png");
    assert!(report.outcomes[2].error.is_some());

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(events.len(), 8);
    assert!(events.iter().any(|e| e.image_id == "c.png"
        && matches!(e.status, BatchItemStatus::Failed { .. })));

    let store = AnnotationStore::new(dir.path());
    for name in ["b.png", "d.png"] {
        let frame = store.load(name).unwrap().unwrap();
        assert_eq!(frame.objects.len(), 2);
        assert_eq!(frame.objects[1].points.len(), 2);
        assert!(frame.objects.iter().all(|o| o.mask.is_some()));
    }
    assert!(store.load("c.png").unwrap().is_none());

    // Reference frame received its masks
    assert_eq!(controller.status().unwrap(), FrameStatus::MasksCurrent);
}

#[tokio::test]
async fn test_corrupt_record_fails_only_its_image() {
    let names = ["a.png", "b.png", "c.png", "d.png"];
    let (dir, controller, _) = setup(&names, ScriptedProvider::new(), AnnotatorSettings::default());
    let annotations = dir.path().join("annotations");
    std::fs::create_dir_all(&annotations).unwrap();
    std::fs::write(annotations.join("c.png.json"), "not json").unwrap();

    controller.on_point(10.0, 10.0, PointLabel::Positive).unwrap();
    let report = controller.process_all(None).await.unwrap();

    assert_eq!(report.succeeded(), 3);
    assert_eq!(report.failed(), 1);
    let failed: Vec<_> = report.outcomes.iter().filter(|o| !o.is_success()).collect();
    assert_eq!(failed[0].image_id, "c.png");
    assert!(failed[0]
        .error
        .as_deref()
        .unwrap()
        .starts_with("Persistence error"));

    let store = AnnotationStore::new(dir.path());
    let d = store.load("d.png").unwrap().unwrap();
    assert!(d.objects[0].mask.is_some());
}

#[tokio::test]
async fn test_batch_exports_masks_and_labels() {
    let mut settings = AnnotatorSettings::default();
    settings.batch.export_masks = true;
    settings.batch.export_labels = true;
    let (dir, controller, _) = setup(&["a.png", "b.png"], ScriptedProvider::new(), settings);

    controller.on_point(10.0, 10.0, PointLabel::Positive).unwrap();
    let report = controller.process_all(None).await.unwrap();
    assert_eq!(report.succeeded(), 2);

    assert!(dir.path().join("runs").join("b_o1.png").exists());
    let labels = std::fs::read_to_string(dir.path().join("labels").join("a.txt")).unwrap();
    assert!(labels.starts_with("0 "));
}

#[tokio::test]
async fn test_batch_cancellation_stops_before_next_image() {
    let gate = Arc::new(Semaphore::new(0));
    let (_dir, controller, provider) = setup(
        &["a.png", "b.png", "c.png"],
        ScriptedProvider::new().with_gate(gate.clone()),
        AnnotatorSettings::default(),
    );
    controller.on_point(10.0, 10.0, PointLabel::Positive).unwrap();

    let handle = controller.start_batch().unwrap();
    wait_for(|| provider.calls() == 1).await;

    assert!(matches!(
        controller.process_all(None).await,
        Err(CoreError::Busy(_))
    ));
    assert!(controller.cancel());
    gate.add_permits(10);

    let report = handle.wait().await.unwrap();
    assert!(report.cancelled);
    assert!(matches!(report.completed(), Err(CoreError::Cancelled)));
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.skipped(), 2);
    assert!(report.outcomes[0].is_success());
    assert!(!controller.is_batch_running());
}

#[tokio::test]
async fn test_recompute_is_busy_while_batch_segments_reference() {
    let gate = Arc::new(Semaphore::new(0));
    let mut settings = AnnotatorSettings::default();
    settings.batch.concurrency = 1;
    let (_dir, controller, provider) = setup(
        &["a.png", "b.png"],
        ScriptedProvider::new().with_gate(gate.clone()),
        settings,
    );
    controller.on_point(10.0, 10.0, PointLabel::Positive).unwrap();

    let handle = controller.start_batch().unwrap();
    wait_for(|| provider.calls() == 1).await;
    assert!(controller.is_recompute_in_flight());
    assert!(matches!(
        controller.recompute().await,
        Err(CoreError::Busy(_))
    ));
    assert_eq!(provider.seen(), vec!["a.png".to_string()]);

    gate.add_permits(10);
    assert_eq!(handle.wait().await.unwrap().succeeded(), 2);
    assert!(!controller.is_recompute_in_flight());
    assert_eq!(controller.recompute().await.unwrap(), ApplyOutcome::Applied(1));
}

#[tokio::test]
async fn test_batch_waits_for_outstanding_recompute() {
    let gate = Arc::new(Semaphore::new(0));
    let mut settings = AnnotatorSettings::default();
    settings.batch.concurrency = 1;
    let (_dir, controller, provider) = setup(
        &["a.png", "b.png"],
        ScriptedProvider::new().with_gate(gate.clone()),
        settings,
    );
    controller.on_point(10.0, 10.0, PointLabel::Positive).unwrap();

    let pending = controller.spawn_recompute();
    wait_for(|| provider.calls() == 1).await;
    let handle = controller.start_batch().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(provider.calls(), 1);

    gate.add_permits(10);
    pending.await.unwrap().unwrap();
    assert_eq!(handle.wait().await.unwrap().succeeded(), 2);
    assert_eq!(
        provider.seen(),
        vec!["a.png".to_string(), "a.png".to_string(), "b.png".to_string()]
    );
}

#[tokio::test]
async fn test_edit_during_batch_keeps_reference_edits() {
    let gate = Arc::new(Semaphore::new(0));
    let (_dir, controller, provider) = setup(
        &["a.png", "b.png"],
        ScriptedProvider::new().with_gate(gate.clone()),
        AnnotatorSettings::default(),
    );
    controller.on_point(10.0, 10.0, PointLabel::Positive).unwrap();

    let handle = controller.start_batch().unwrap();
    wait_for(|| provider.calls() == 1).await;
    controller.on_point(20.0, 20.0, PointLabel::Positive).unwrap();
    gate.add_permits(10);

    let report = handle.wait().await.unwrap();
    assert_eq!(report.succeeded(), 2);

    let frame = controller.snapshot().unwrap();
    assert_eq!(frame.objects[0].points.len(), 2);
    assert!(frame.objects[0].mask.is_none());
}
