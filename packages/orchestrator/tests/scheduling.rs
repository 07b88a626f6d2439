#![cfg(unix)]

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use orchestrator_core::layout::RunLayout;
use orchestrator_core::supervisor::{RunnerCommand, SuccessPolicy, SupervisorConfig};
use orchestrator_core::{
    ControlSurface, FleetEvent, JobFailure, JobId, JobStatus, OrchestratorError, OutputFolderState,
    StartOutcome,
};

const SUCCEED_AFTER_1S: &str = r#"echo "PROGRESS: 50%"; sleep 1; mkdir -p "$RUN/$1_COMPLETED"; exit 0"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_twenty_jobs_run_four_at_a_time() {
    let fx = fleet(ids(20), 4, SUCCEED_AFTER_1S);
    let control = fx.control.clone();

    let outcome = tokio_test::assert_ok!(control.start(None).await);
    let StartOutcome::Started { epoch, admitted, queued } = outcome else {
        panic!("unexpected conflict");
    };
    assert_eq!(admitted.len(), 4);
    assert_eq!(queued.len(), 16);
    assert_eq!(count(&control, JobStatus::Running), 4);
    assert_eq!(count(&control, JobStatus::Pending), 16);

    // Sample the running count until the batch is done.
    let done = Arc::new(AtomicBool::new(false));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let sampler = {
        let control = control.clone();
        let done = done.clone();
        let max_seen = max_seen.clone();
        tokio::spawn(async move {
            while !done.load(Ordering::SeqCst) {
                let running = count(&control, JobStatus::Running);
                max_seen.fetch_max(running, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    tokio::time::timeout(Duration::from_secs(60), control.wait_for_batch(epoch))
        .await
        .expect("batch did not finish")
        .unwrap();
    done.store(true, Ordering::SeqCst);
    sampler.await.unwrap();

    assert!(max_seen.load(Ordering::SeqCst) <= 4);
    assert_eq!(count(&control, JobStatus::Success), 20);
    for record in control.status() {
        assert_eq!(record.progress_percent, 100);
        assert_eq!(record.output_folder, OutputFolderState::Completed);
        assert!(record.log_path.exists());
    }
    let log = std::fs::read_to_string(fx.layout.log_path(&JobId::from("01_Job"))).unwrap();
    assert!(log.contains("PROGRESS: 50%"));
}

#[tokio::test]
async fn test_start_from_job_queues_the_suffix() {
    let fx = fleet(ids(5), 1, "sleep 30");

    let outcome = fx.control.start(Some(JobId::from("03_Job"))).await.unwrap();
    assert_eq!(
        outcome,
        StartOutcome::Started {
            epoch: 1,
            admitted: vec![JobId::from("03_Job")],
            queued: vec![JobId::from("04_Job"), JobId::from("05_Job")],
        }
    );
    assert_eq!(
        fx.control.backlog().await.unwrap(),
        vec![JobId::from("04_Job"), JobId::from("05_Job")]
    );
    assert_eq!(fx.control.job(&JobId::from("01_Job")).unwrap().status, JobStatus::Pending);

    // A start for the running job is a conflict, not an error.
    let again = fx.control.start(Some(JobId::from("03_Job"))).await.unwrap();
    assert_eq!(again, StartOutcome::Conflict(JobId::from("03_Job")));
    assert_eq!(fx.control.backlog().await.unwrap().len(), 2);

    fx.control.stop(None).await.unwrap();
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let fx = fleet(ids(2), 1, "exit 0");
    let err = fx.control.start(Some(JobId::from("nope"))).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::JobNotFound(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failures_do_not_abort_the_batch() {
    let script = r#"
        case "$1" in
            02_Job) exit 3 ;;
            03_Job) mkdir -p "$RUN/$1_COMPLETED"; exit 1 ;;
        esac
        mkdir -p "$RUN/$1_COMPLETED"
    "#;
    let fx = fleet(ids(4), 2, script);
    let mut feed = fx.control.subscribe();

    let StartOutcome::Started { epoch, .. } = fx.control.start(None).await.unwrap() else {
        panic!("unexpected conflict");
    };
    tokio::time::timeout(Duration::from_secs(30), fx.control.wait_for_batch(epoch))
        .await
        .expect("batch did not finish")
        .unwrap();

    let failed = fx.control.job(&JobId::from("02_Job")).unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.failure, Some(JobFailure::NonZeroExit { code: Some(3) }));
    assert_eq!(failed.output_folder, OutputFolderState::None);

    // Non-zero exit with a _COMPLETED folder counts as success by default.
    let marked = fx.control.job(&JobId::from("03_Job")).unwrap();
    assert_eq!(marked.status, JobStatus::Success);

    assert_eq!(count(&fx.control, JobStatus::Success), 3);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let completed: Vec<_> = drain(&mut feed)
        .into_iter()
        .filter_map(|e| match e {
            FleetEvent::BatchCompleted { summary } => Some(summary),
            _ => None,
        })
        .collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].failed(), 1);
    assert_eq!(completed[0].succeeded(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_completed_folder_from_an_earlier_run_is_not_success() {
    let script = r#"
        case "$1" in
            01_Job) exit 1 ;;
            02_Job) echo row > "$RUN/$1_COMPLETED/fresh.csv"; exit 1 ;;
        esac
        exit 0
    "#;
    let fx = fleet(ids(3), 3, script);
    for id in ids(3) {
        let kept = fx.layout.completed_dir(&id);
        std::fs::create_dir_all(&kept).unwrap();
        std::fs::write(kept.join("old.csv"), "stale").unwrap();
    }

    fx.control.start(None).await.unwrap();
    let control = fx.control.clone();
    assert!(
        eventually(Duration::from_secs(10), || {
            control.status().iter().all(|r| r.status.is_terminal())
        })
        .await
    );

    let stale = fx.control.job(&JobId::from("01_Job")).unwrap();
    assert_eq!(stale.status, JobStatus::Failed);
    assert_eq!(stale.failure, Some(JobFailure::NonZeroExit { code: Some(1) }));
    assert_eq!(stale.output_folder, OutputFolderState::None);

    // Writing into the kept folder is this run's output.
    let rewritten = fx.control.job(&JobId::from("02_Job")).unwrap();
    assert_eq!(rewritten.status, JobStatus::Success);
    assert_eq!(rewritten.output_folder, OutputFolderState::Completed);

    // Exit 0 is still success, but the old folder is not handed on.
    let untouched = fx.control.job(&JobId::from("03_Job")).unwrap();
    assert_eq!(untouched.status, JobStatus::Success);
    assert_eq!(untouched.output_folder, OutputFolderState::None);
}

#[tokio::test]
async fn test_spawn_error_is_a_job_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let supervisor = SupervisorConfig {
        runner: RunnerCommand {
            program: "/nonexistent/crawler".to_string(),
            args: Vec::new(),
            lookback_days: 2,
        },
        grace: Duration::from_millis(200),
        success_policy: SuccessPolicy::ExitCodeOrMarker,
    };
    let control = ControlSurface::builder(RunLayout::new(tmp.path(), RUN_DATE), ids(3), supervisor)
        .max_concurrency(2)
        .build();

    let StartOutcome::Started { epoch, .. } = control.start(None).await.unwrap() else {
        panic!("unexpected conflict");
    };
    tokio::time::timeout(Duration::from_secs(10), control.wait_for_batch(epoch))
        .await
        .expect("batch did not finish")
        .unwrap();

    for record in control.status() {
        assert_eq!(record.status, JobStatus::Failed);
        assert!(matches!(record.failure, Some(JobFailure::SpawnError { .. })));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_kills_the_process_tree() {
    // The job ignores SIGTERM (and so does its child), forcing the kill phase.
    let script = r#"trap '' TERM; sleep 30 & echo $! > "$RUN/$1.child"; wait"#;
    let fx = fleet(ids(1), 1, script);
    let id = JobId::from("01_Job");
    let child_file = fx.layout.run_dir().join("01_Job.child");

    fx.control.start(None).await.unwrap();
    let read_child = || {
        std::fs::read_to_string(&child_file)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
    };
    assert!(eventually(Duration::from_secs(5), || read_child().is_some()).await);
    let grandchild = read_child().unwrap();

    let began = std::time::Instant::now();
    let stopped = fx.control.stop(Some(id.clone())).await.unwrap();
    let elapsed = began.elapsed();

    assert_eq!(stopped, vec![id.clone()]);
    // grace (500ms) + kill wait, with slack
    assert!(elapsed < Duration::from_secs(5), "stop took {elapsed:?}");

    let record = fx.control.job(&id).unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.failure, Some(JobFailure::Terminated));
    assert!(record.pid.is_none());

    #[cfg(target_os = "linux")]
    assert!(
        eventually(Duration::from_secs(2), || !process_running(grandchild)).await,
        "descendant {grandchild} survived"
    );
    #[cfg(not(target_os = "linux"))]
    let _ = grandchild;
}

#[tokio::test]
async fn test_stop_of_idle_job_is_a_no_op() {
    let fx = fleet(ids(2), 1, "sleep 30");
    let stopped = fx.control.stop(Some(JobId::from("02_Job"))).await.unwrap();
    assert!(stopped.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_global_stop_blocks_admission_until_next_start() {
    let fx = fleet(ids(3), 1, "sleep 30");
    let mut feed = fx.control.subscribe();

    fx.control.start(None).await.unwrap();
    let stopped = fx.control.stop(None).await.unwrap();
    assert_eq!(stopped, vec![JobId::from("01_Job")]);
    assert!(fx.control.is_terminating());

    // The stopped job's exit must not admit the next one.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(count(&fx.control, JobStatus::Running), 0);
    assert_eq!(count(&fx.control, JobStatus::Pending), 2);
    assert!(!drain(&mut feed)
        .iter()
        .any(|e| matches!(e, FleetEvent::BatchCompleted { .. })));

    // Start resumes the same batch; the terminated job stays failed.
    let outcome = fx.control.start(None).await.unwrap();
    assert!(!fx.control.is_terminating());
    assert_eq!(
        outcome,
        StartOutcome::Started {
            epoch: 1,
            admitted: vec![JobId::from("02_Job")],
            queued: vec![JobId::from("03_Job")],
        }
    );
    assert_eq!(
        fx.control.job(&JobId::from("01_Job")).unwrap().failure,
        Some(JobFailure::Terminated)
    );

    fx.control.stop(None).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_job_can_be_restarted() {
    // First run fails, second run succeeds.
    let script = r#"
        if [ "$1" = 01_Job ]; then
            if [ -f "$RUN/retried" ]; then mkdir -p "$RUN/$1_COMPLETED"; exit 0; fi
            touch "$RUN/retried"; exit 1
        fi
        sleep 30
    "#;
    let fx = fleet(ids(2), 2, script);
    let first = JobId::from("01_Job");

    fx.control.start(None).await.unwrap();
    assert!(
        eventually(Duration::from_secs(5), || {
            fx.control.job(&first).map(|r| r.status == JobStatus::Failed).unwrap_or(false)
        })
        .await
    );

    let outcome = fx.control.start(Some(first.clone())).await.unwrap();
    assert!(matches!(outcome, StartOutcome::Started { epoch: 1, .. }));
    assert!(
        eventually(Duration::from_secs(5), || {
            fx.control.job(&first).map(|r| r.status == JobStatus::Success).unwrap_or(false)
        })
        .await
    );

    fx.control.stop(None).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_completed_batch_is_post_processed_once() {
    let tmp = tempfile::tempdir().unwrap();
    let uploader = CountingUploader::new(0);
    let script = r#"mkdir -p "$RUN/$1_COMPLETED/attachments"; echo row > "$RUN/$1_COMPLETED/bids.csv""#;
    let control = builder(&tmp, ids(6), script, Duration::from_millis(200))
        .max_concurrency(3)
        .uploader(uploader.clone())
        .build();
    let layout = control.layout().clone();
    let mut feed = control.subscribe();

    let StartOutcome::Started { epoch, .. } = control.start(None).await.unwrap() else {
        panic!("unexpected conflict");
    };
    tokio::time::timeout(Duration::from_secs(30), control.wait_for_batch(epoch))
        .await
        .expect("batch did not finish")
        .unwrap();

    assert_eq!(uploader.calls(), 6);
    for id in ids(6) {
        assert!(!layout.completed_dir(&id).exists(), "{id} folder not cleaned up");
    }

    let events = drain(&mut feed);
    let post_processing_runs = events
        .iter()
        .filter(|e| matches!(e, FleetEvent::PostProcessingStarted { .. }))
        .count();
    assert_eq!(post_processing_runs, 1);

    // A second batch re-arms the trigger.
    let StartOutcome::Started { epoch: next, .. } = control.start(None).await.unwrap() else {
        panic!("unexpected conflict");
    };
    assert_eq!(next, epoch + 1);
    tokio::time::timeout(Duration::from_secs(30), control.wait_for_batch(next))
        .await
        .expect("second batch did not finish")
        .unwrap();
    assert_eq!(uploader.calls(), 12);
}
