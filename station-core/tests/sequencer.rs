mod common;

use common::{is_write, Fixture, Reply, ScriptedRunner};
use flash_station_lib::{
    CommLink, CounterStore, EventSink, FlashError, FlashSequencer, FlashStage, JobOutcome,
    StationEvent, ToolOperation,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn link() -> CommLink {
    CommLink::confirmed("/dev/ttyUSB0", 460_800)
}

fn sequencer(fixture: &Fixture, runner: Arc<ScriptedRunner>) -> FlashSequencer {
    FlashSequencer::new(
        runner,
        CounterStore::open(fixture.path("count.txt")),
        EventSink::disabled(),
    )
}

#[tokio::test]
async fn failed_erase_never_writes() {
    let fixture = Fixture::new();
    let runner = ScriptedRunner::new(|req| match req.operation {
        ToolOperation::Erase => Reply::fail(1, "A fatal error occurred: Timed out"),
        _ => Reply::ok(),
    });
    let seq = sequencer(&fixture, runner.clone());

    let err = seq
        .run_flash(&link(), &fixture.path("fw.bin"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        FlashError::Stage {
            stage: FlashStage::Erasing,
            exit_code: Some(1),
            ..
        }
    ));
    assert_eq!(err.diagnostics(), Some("A fatal error occurred: Timed out\n"));
    assert_eq!(runner.operations(), vec!["erase"]);
    let job = seq.snapshot().unwrap();
    assert_eq!(job.stage, FlashStage::Failed);
    assert!(job.error.unwrap().contains("retry required"));
    assert_eq!(seq.flash_count(), 0);
}

#[tokio::test]
async fn counter_counts_only_successful_jobs() {
    let fixture = Fixture::new();
    std::fs::write(fixture.path("count.txt"), "7").unwrap();
    let fail_write = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = fail_write.clone();
    let runner = ScriptedRunner::new(move |req| {
        if is_write(req) && flag.load(std::sync::atomic::Ordering::SeqCst) {
            Reply::fail(2, "Failed to write to target RAM")
        } else {
            Reply::ok()
        }
    });
    let seq = sequencer(&fixture, runner.clone());
    let firmware = fixture.path("fw.bin");

    for expected in 8..=10 {
        let summary = seq.run_flash(&link(), &firmware).await.unwrap();
        assert_eq!(summary.flash_count, expected);
        assert!(summary.counter_warning.is_none());
    }
    assert_eq!(fixture.counter(), "10");
    assert_eq!(
        runner.operations(),
        ["erase", "write", "reset"].repeat(3)
    );

    fail_write.store(true, std::sync::atomic::Ordering::SeqCst);
    let err = seq.run_flash(&link(), &firmware).await.unwrap_err();
    assert!(matches!(
        err,
        FlashError::Stage {
            stage: FlashStage::Writing,
            ..
        }
    ));
    assert_eq!(fixture.counter(), "10");
    assert_eq!(seq.flash_count(), 10);
    assert_eq!(runner.count("reset"), 3);
}

#[tokio::test]
async fn job_ids_increase() {
    let fixture = Fixture::new();
    let seq = sequencer(&fixture, ScriptedRunner::succeeding());
    let firmware = fixture.path("fw.bin");
    let first = seq.run_flash(&link(), &firmware).await.unwrap();
    let second = seq.run_flash(&link(), &firmware).await.unwrap();
    assert!(second.job_id > first.job_id);
    assert_eq!(seq.snapshot().unwrap().id, second.job_id);
    assert_eq!(seq.snapshot().unwrap().stage, FlashStage::Succeeded);
}

#[tokio::test]
async fn write_stage_reports_progress_and_log_lines() {
    let fixture = Fixture::new();
    let runner = ScriptedRunner::new(|req| {
        if is_write(req) {
            Reply::ok_with(&[
                "Writing at 0x00001000... (0 %)",
                "Writing at 0x00008000...(57%)...",
                "no percent here",
                "(100%)",
            ])
        } else {
            Reply::ok_with(&["Chip erase completed successfully"])
        }
    });
    let (events, mut rx) = EventSink::channel();
    let seq = FlashSequencer::new(
        runner.clone(),
        CounterStore::open(fixture.path("count.txt")),
        events,
    )
    .with_flash_address(0x1000);

    let summary = seq
        .run_flash(&link(), &fixture.path("fw.bin"))
        .await
        .unwrap();
    let events = common::drain(&mut rx);

    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            StationEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![0, 57, 100]);

    let logs: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            StationEvent::LogLine { line } => Some(line.as_str()),
            _ => None,
        })
        .collect();
    assert!(logs.contains(&"no percent here"));
    assert!(!logs.iter().any(|l| l.contains("57%")));

    let stages: Vec<FlashStage> = events
        .iter()
        .filter_map(|e| match e {
            StationEvent::StageChanged { stage, .. } => Some(*stage),
            _ => None,
        })
        .collect();
    assert_eq!(
        stages,
        vec![
            FlashStage::Erasing,
            FlashStage::Writing,
            FlashStage::Resetting,
            FlashStage::Succeeded
        ]
    );
    assert!(matches!(
        events.last(),
        Some(StationEvent::JobResult {
            outcome: JobOutcome::Success { flash_count: 1 },
            ..
        })
    ));
    assert_eq!(summary.link, link());

    let write = runner.calls().into_iter().find(is_write).unwrap();
    assert_eq!(
        write.operation,
        ToolOperation::WriteImage {
            address: 0x1000,
            image: fixture.path("fw.bin"),
        }
    );
    assert_eq!(write.timeout, None);
}

#[tokio::test]
async fn silent_write_still_finishes_at_100() {
    let fixture = Fixture::new();
    let (events, mut rx) = EventSink::channel();
    let seq = FlashSequencer::new(
        ScriptedRunner::succeeding(),
        CounterStore::open(fixture.path("count.txt")),
        events,
    );
    seq.run_flash(&link(), &fixture.path("fw.bin")).await.unwrap();
    assert_eq!(seq.snapshot().unwrap().progress, 100);
    assert!(common::drain(&mut rx)
        .iter()
        .any(|e| matches!(e, StationEvent::Progress { percent: 100, .. })));
}

#[tokio::test]
async fn second_job_is_rejected_while_one_runs() {
    let fixture = Fixture::new();
    let runner = ScriptedRunner::succeeding();
    let (started, release) = runner.hold("erase");
    let seq = Arc::new(sequencer(&fixture, runner.clone()));
    let firmware = fixture.path("fw.bin");

    let first = tokio::spawn({
        let seq = seq.clone();
        let firmware = firmware.clone();
        async move { seq.run_flash(&link(), &firmware).await }
    });
    started.notified().await;

    let before = seq.snapshot();
    assert!(seq.is_busy());
    let err = seq.run_flash(&link(), &firmware).await.unwrap_err();
    assert!(matches!(err, FlashError::Busy));
    assert_eq!(seq.snapshot(), before);
    assert_eq!(before.unwrap().stage, FlashStage::Erasing);
    assert_eq!(runner.calls().len(), 1);

    release.notify_one();
    let summary = first.await.unwrap().unwrap();
    assert_eq!(summary.flash_count, 1);
    assert!(!seq.is_busy());
    assert_eq!(runner.count("erase"), 1);
}

#[tokio::test]
async fn missing_image_fails_before_erasing() {
    let fixture = Fixture::new();
    let runner = ScriptedRunner::succeeding();
    let seq = sequencer(&fixture, runner.clone());

    let err = seq
        .run_flash(&link(), &fixture.path("missing.bin"))
        .await
        .unwrap_err();

    assert!(matches!(err, FlashError::FirmwareMissing(_)));
    assert!(runner.calls().is_empty());
    assert_eq!(seq.snapshot().unwrap().stage, FlashStage::Failed);
}

#[tokio::test]
async fn tool_that_will_not_start_fails_the_job() {
    let fixture = Fixture::new();
    let runner = ScriptedRunner::new(|_| Reply::LaunchFailure);
    let seq = sequencer(&fixture, runner.clone());

    let err = seq
        .run_flash(&link(), &fixture.path("fw.bin"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        FlashError::Tool {
            stage: FlashStage::Erasing,
            ..
        }
    ));
    assert_eq!(runner.calls().len(), 1);
    assert!(!seq.is_busy());
}

#[tokio::test]
async fn counter_write_failure_does_not_fail_the_job() {
    let fixture = Fixture::new();
    let (events, mut rx) = EventSink::channel();
    let seq = FlashSequencer::new(
        ScriptedRunner::succeeding(),
        CounterStore::open(fixture.path("gone").join("count.txt")),
        events,
    );

    let summary = seq
        .run_flash(&link(), &fixture.path("fw.bin"))
        .await
        .unwrap();

    assert_eq!(summary.flash_count, 1);
    assert!(summary.counter_warning.is_some());
    let events = common::drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, StationEvent::Warning { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, StationEvent::CounterUpdated { count: 1 })));
}

#[tokio::test]
async fn cleared_after_a_job_but_not_during_one() {
    let fixture = Fixture::new();
    let runner = ScriptedRunner::succeeding();
    let (started, release) = runner.hold("write");
    let seq = Arc::new(sequencer(&fixture, runner));
    let firmware = fixture.path("fw.bin");

    let job = tokio::spawn({
        let seq = seq.clone();
        async move { seq.run_flash(&link(), &firmware).await }
    });
    started.notified().await;
    assert!(!seq.clear());
    assert_eq!(seq.snapshot().unwrap().stage, FlashStage::Writing);

    release.notify_one();
    job.await.unwrap().unwrap();
    assert!(seq.clear());
    assert!(seq.snapshot().is_none());
}
