//! Integration tests for the ingestor and worker loops.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dropq::clock::ManualClock;
use dropq::engine::{IngestOutcome, Ingestor, IngestorConfig, Shutdown, Worker, WorkerConfig};
use dropq::event::FsEvent;
use dropq::model::{Status, TaskDescriptor, TaskId};
use dropq::store::{QueueLayout, QueueStore};
use dropq::transform::{InvertTransform, Transform, TransformError};
use image::{Rgb, RgbImage};
use tempfile::TempDir;

struct Harness {
    _root: TempDir,
    layout: QueueLayout,
    clock: ManualClock,
    shutdown: Shutdown,
}

impl Harness {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let layout = QueueLayout::under(root.path());
        layout.ensure().unwrap();
        Self {
            _root: root,
            layout,
            clock: ManualClock::default(),
            shutdown: Shutdown::new(),
        }
    }

    fn store(&self) -> QueueStore<ManualClock> {
        QueueStore::with_clock(self.layout.clone(), self.clock.clone()).max_attempts(3)
    }

    fn ingestor(&self) -> Ingestor<ManualClock> {
        Ingestor::new(self.store(), IngestorConfig::default(), self.shutdown.clone())
    }

    fn worker<T: Transform>(&self, transform: T) -> Worker<ManualClock, T> {
        Worker::new(
            self.store(),
            transform,
            WorkerConfig::default(),
            self.shutdown.clone(),
        )
    }

    fn drop_file(&self, name: &str) -> PathBuf {
        let path = self.layout.source.join(name);
        fs::write(&path, b"payload").unwrap();
        path
    }

    fn descriptor(&self, dir: &Path, id: &str) -> TaskDescriptor {
        let text = fs::read_to_string(dir.join(format!("{id}.task"))).unwrap();
        TaskDescriptor::parse(TaskId::new(id), &text).unwrap()
    }
}

fn names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Copies the payload to `{output}/inverted_{name}`.
fn copy_transform(output: PathBuf) -> impl Fn(&Path) -> Result<PathBuf, TransformError> + Send + Sync + 'static {
    move |input: &Path| {
        let name = input.file_name().unwrap().to_string_lossy();
        let out = output.join(format!("inverted_{name}"));
        fs::copy(input, &out)?;
        Ok(out)
    }
}

fn failing_transform(calls: Arc<AtomicUsize>) -> impl Fn(&Path) -> Result<PathBuf, TransformError> + Send + Sync + 'static {
    move |_: &Path| {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(TransformError::Other("boom".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Scenario: a dropped image ends up inverted and archived
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dropped_image_is_inverted_and_archived() {
    let h = Harness::new();
    let source = h.layout.source.join("a.jpg");
    RgbImage::from_pixel(8, 8, Rgb([0, 0, 0])).save(&source).unwrap();

    let outcome = h.ingestor().handle_event(FsEvent::created(&source)).await;
    assert_eq!(outcome, IngestOutcome::Queued(TaskId::new("a")));
    assert_eq!(h.clock.slept(), Duration::from_secs(1));

    let worker = h.worker(InvertTransform::new(&h.layout.output, "inverted_"));
    let report = worker.tick().await.unwrap();

    assert_eq!(report.completed, 1);
    assert_eq!(names(&h.layout.output), vec!["inverted_a.jpg"]);
    assert_eq!(names(&h.layout.archive), vec!["a.jpg", "a.task"]);
    assert!(names(&h.layout.queue).is_empty());

    let desc = h.descriptor(&h.layout.archive, "a");
    assert_eq!(desc.status, Status::Completed);
    assert_eq!(desc.output_name.as_deref(), Some("inverted_a.jpg"));

    let inverted = image::open(h.layout.output.join("inverted_a.jpg")).unwrap().to_rgb8();
    assert!(inverted.get_pixel(4, 4).0.iter().all(|&c| c > 240));
}

// ---------------------------------------------------------------------------
// Scenario: a file deleted while settling is never queued
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn file_deleted_while_settling_is_not_queued() {
    let root = tempfile::tempdir().unwrap();
    let layout = QueueLayout::under(root.path());
    layout.ensure().unwrap();
    let ingestor = Arc::new(Ingestor::new(
        QueueStore::new(layout.clone()),
        IngestorConfig::default(),
        Shutdown::new(),
    ));

    let path = layout.source.join("a.jpg");
    fs::write(&path, b"payload").unwrap();

    let handle = {
        let ingestor = Arc::clone(&ingestor);
        let path = path.clone();
        tokio::spawn(async move { ingestor.handle_event(FsEvent::created(path)).await })
    };
    tokio::task::yield_now().await;
    fs::remove_file(&path).unwrap();

    assert_eq!(handle.await.unwrap(), IngestOutcome::Vanished);
    assert!(names(&layout.queue).is_empty());
}

#[tokio::test]
async fn unrecognized_files_are_ignored_without_settling() {
    let h = Harness::new();
    let path = h.drop_file("notes.txt");
    let hidden = h.drop_file(".a.jpg");

    let ingestor = h.ingestor();
    assert_eq!(ingestor.handle_event(FsEvent::created(&path)).await, IngestOutcome::Ignored);
    assert_eq!(ingestor.handle_event(FsEvent::moved(&hidden)).await, IngestOutcome::Ignored);
    assert_eq!(h.clock.sleeps(), 0);
    assert!(path.exists());
}

// ---------------------------------------------------------------------------
// Scenario: a corrupt descriptor is quarantined and others still run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn corrupt_descriptor_is_quarantined_and_others_processed() {
    let h = Harness::new();
    fs::write(
        h.layout.queue.join("bad.task"),
        "timestamp=1700000000.0\nstatus=queued\n",
    )
    .unwrap();
    h.store().enqueue(&h.drop_file("good.png")).unwrap();

    let worker = h.worker(copy_transform(h.layout.output.clone()));
    let report = worker.tick().await.unwrap();

    assert_eq!(report.quarantined, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(names(&h.layout.quarantine), vec!["bad.task"]);
    assert_eq!(names(&h.layout.archive), vec!["good.png", "good.task"]);
    assert!(names(&h.layout.queue).is_empty());
}

#[tokio::test]
async fn descriptor_without_payload_is_quarantined() {
    let h = Harness::new();
    fs::write(
        h.layout.queue.join("lost.task"),
        "image_file=lost.jpg\ntimestamp=1700000000.0\nstatus=queued\n",
    )
    .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let report = h
        .worker(failing_transform(Arc::clone(&calls)))
        .tick()
        .await
        .unwrap();

    assert_eq!(report.quarantined, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(names(&h.layout.quarantine), vec!["lost.task.claimed"]);
}

// ---------------------------------------------------------------------------
// Scenario: a transform that always fails ends in the dead-letter directory
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_transform_is_retried_then_dead_lettered() {
    let h = Harness::new();
    h.store().enqueue(&h.drop_file("a.jpg")).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let worker = h.worker(failing_transform(Arc::clone(&calls)));

    let first = worker.tick().await.unwrap();
    let second = worker.tick().await.unwrap();
    let third = worker.tick().await.unwrap();
    let fourth = worker.tick().await.unwrap();

    assert_eq!(first.retried, 1);
    assert_eq!(second.retried, 1);
    assert_eq!(third.dead_lettered, 1);
    assert!(fourth.is_idle());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let desc = h.descriptor(&h.layout.dead_letter, "a");
    assert_eq!(desc.status, Status::Failed);
    assert_eq!(desc.attempts, 3);
    assert!(desc.output_name.is_none());
    assert_eq!(names(&h.layout.dead_letter), vec!["a.jpg", "a.task"]);
    assert!(names(&h.layout.archive).is_empty());
    assert!(names(&h.layout.output).is_empty());
}

// ---------------------------------------------------------------------------
// Sweep and rescan
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sweep_twice_queues_each_file_once() {
    let h = Harness::new();
    h.drop_file("a.jpg");
    h.drop_file("b.png");
    h.drop_file("c.txt");
    let ingestor = h.ingestor();

    let first = ingestor.sweep().unwrap();
    let second = ingestor.sweep().unwrap();

    assert_eq!(
        first,
        vec![
            IngestOutcome::Queued(TaskId::new("a")),
            IngestOutcome::Queued(TaskId::new("b")),
        ]
    );
    assert!(second.is_empty());
    assert_eq!(names(&h.layout.queue), vec!["a.jpg", "a.task", "b.png", "b.task"]);
    assert_eq!(names(&h.layout.source), vec!["c.txt"]);
}

#[tokio::test]
async fn rescan_skips_files_still_settling() {
    let h = Harness::new();
    h.drop_file("a.jpg");
    let ingestor = h.ingestor();

    assert!(ingestor.rescan().unwrap().is_empty());

    h.clock.advance(Duration::from_secs(5));
    assert_eq!(
        ingestor.rescan().unwrap(),
        vec![IngestOutcome::Queued(TaskId::new("a"))]
    );
}

#[tokio::test]
async fn same_id_waits_in_source_until_first_task_finishes() {
    let h = Harness::new();
    let ingestor = h.ingestor();
    h.drop_file("a.jpg");
    ingestor.sweep().unwrap();

    let second = h.drop_file("a.png");
    assert_eq!(
        ingestor.sweep().unwrap(),
        vec![IngestOutcome::AlreadyQueued(TaskId::new("a"))]
    );
    assert!(second.exists());

    let worker = h.worker(copy_transform(h.layout.output.clone()));
    assert_eq!(worker.tick().await.unwrap().completed, 1);

    h.clock.advance(Duration::from_secs(5));
    assert_eq!(
        ingestor.rescan().unwrap(),
        vec![IngestOutcome::Queued(TaskId::new("a"))]
    );
    assert_eq!(worker.tick().await.unwrap().completed, 1);
    assert_eq!(
        names(&h.layout.archive),
        vec!["a-1.png", "a-1.task", "a.jpg", "a.task"]
    );
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn worker_recovers_stale_claim_and_stranded_descriptor() {
    let h = Harness::new();
    let store = h.store();
    let a = store.enqueue(&h.drop_file("a.jpg")).unwrap();
    let _abandoned = store.claim(&a).unwrap();

    fs::write(h.layout.queue.join("s.jpg"), b"payload").unwrap();
    fs::write(
        h.layout.queue.join("s.task"),
        "image_file=s.jpg\ntimestamp=1700000000.0\nstatus=queued\n\
         processed_at=1700000001.0\nstatus=completed\noutput_file=inverted_s.jpg\n",
    )
    .unwrap();

    let worker = h.worker(copy_transform(h.layout.output.clone()));
    assert_eq!(worker.recover().unwrap(), 1);
    let report = worker.tick().await.unwrap();

    assert_eq!(report.relocated, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(
        names(&h.layout.archive),
        vec!["a.jpg", "a.task", "s.jpg", "s.task"]
    );
}

#[tokio::test]
async fn unreadable_descriptor_does_not_block_other_tasks() {
    let h = Harness::new();
    h.store().enqueue(&h.drop_file("good.jpg")).unwrap();
    fs::create_dir(h.layout.queue.join("weird.task")).unwrap();

    let worker = h.worker(copy_transform(h.layout.output.clone()));
    let report = worker.tick().await.unwrap();

    assert_eq!(report.completed, 1);
    assert_eq!(names(&h.layout.archive), vec!["good.jpg", "good.task"]);
    assert_eq!(names(&h.layout.queue), vec!["weird.task"]);
    assert!(worker.tick().await.unwrap().is_idle());
}

/// Replace a layout directory with a plain file so every move into it fails.
fn block_dir(dir: &Path) {
    fs::remove_dir(dir).unwrap();
    fs::write(dir, b"in the way").unwrap();
}

fn unblock_dir(dir: &Path) {
    fs::remove_file(dir).unwrap();
    fs::create_dir(dir).unwrap();
}

#[tokio::test]
async fn failed_archive_move_returns_claim_and_finishes_next_tick() {
    let h = Harness::new();
    h.store().enqueue(&h.drop_file("a.jpg")).unwrap();
    let worker = h.worker(copy_transform(h.layout.output.clone()));

    block_dir(&h.layout.archive);
    let first = worker.tick().await.unwrap();
    assert_eq!(first.skipped, 1);
    assert_eq!(first.completed, 0);
    assert_eq!(names(&h.layout.queue), vec!["a.jpg", "a.task"]);
    assert_eq!(h.descriptor(&h.layout.queue, "a").status, Status::Completed);

    unblock_dir(&h.layout.archive);
    let second = worker.tick().await.unwrap();
    assert_eq!(second.relocated, 1);
    assert!(names(&h.layout.queue).is_empty());
    assert_eq!(names(&h.layout.archive), vec!["a.jpg", "a.task"]);
    assert_eq!(h.descriptor(&h.layout.archive, "a").status, Status::Completed);
}

#[tokio::test]
async fn failed_quarantine_of_payloadless_task_returns_claim() {
    let h = Harness::new();
    fs::write(
        h.layout.queue.join("lost.task"),
        "image_file=lost.jpg\ntimestamp=1700000000.0\nstatus=queued\n",
    )
    .unwrap();
    let worker = h.worker(copy_transform(h.layout.output.clone()));

    block_dir(&h.layout.quarantine);
    let first = worker.tick().await.unwrap();
    assert_eq!(first.skipped, 1);
    assert_eq!(names(&h.layout.queue), vec!["lost.task"]);

    unblock_dir(&h.layout.quarantine);
    let second = worker.tick().await.unwrap();
    assert_eq!(second.quarantined, 1);
    assert!(names(&h.layout.queue).is_empty());
    assert_eq!(names(&h.layout.quarantine), vec!["lost.task.claimed"]);
}

// ---------------------------------------------------------------------------
// Run loops
// ---------------------------------------------------------------------------

/// Poll `done` in real time, then stop the loop under test either way.
async fn wait_until(shutdown: &Shutdown, done: impl Fn() -> bool) -> bool {
    for _ in 0..2_000 {
        if done() {
            shutdown.trigger();
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    shutdown.trigger();
    false
}

#[tokio::test]
async fn worker_run_processes_until_shutdown() {
    let h = Harness::new();
    h.store().enqueue(&h.drop_file("a.jpg")).unwrap();
    let worker = h.worker(copy_transform(h.layout.output.clone()));
    let archived = h.layout.archive.join("a.task");

    let (result, finished) = tokio::join!(
        worker.run(),
        wait_until(&h.shutdown, || archived.exists()),
    );

    result.unwrap();
    assert!(finished);
    assert!(h.shutdown.is_triggered());
}

#[tokio::test]
async fn ingestor_run_sweeps_then_serves_events() {
    let h = Harness::new();
    h.drop_file("early.jpg");
    let ingestor = h.ingestor();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    let late = h.drop_file("late.png");
    tx.send(FsEvent::created(&late)).unwrap();

    let queue = h.layout.queue.clone();
    let (result, finished) = tokio::join!(
        ingestor.run(rx),
        wait_until(&h.shutdown, || queue.join("early.task").exists()
            && queue.join("late.task").exists()),
    );

    result.unwrap();
    assert!(finished);
    assert_eq!(
        names(&h.layout.queue),
        vec!["early.jpg", "early.task", "late.png", "late.task"]
    );
}

#[tokio::test]
async fn ingestor_run_fails_without_source_dir() {
    let h = Harness::new();
    fs::remove_dir(&h.layout.source).unwrap();
    let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();

    assert!(h.ingestor().run(rx).await.is_err());
}
