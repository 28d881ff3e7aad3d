use crate::common::helpers::{RecordingDownstream, feed_all, payload, sh_cmd, video};
use ffladder::engine::{
    Channel, ExitFailure, OutputMode, OutputSinks, StageError, StageInput, StagePhase,
    StageSettings, TranscodeStage,
};
use std::thread;
use std::time::Duration;

/// Send `bytes`, then hold end of input back long enough for every output to
/// reach EOF first
fn feed_then_close_late(input: StageInput, bytes: &'static [u8]) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        input.send_chunk(bytes).unwrap();
        thread::sleep(Duration::from_millis(800));
        input.end_of_input().unwrap();
    })
}

fn stage(mode: OutputMode) -> TranscodeStage {
    let mut stage = TranscodeStage::new(StageSettings::new(mode));
    stage.register(0x100, video(1280, 720)).unwrap();
    stage
}

#[test]
fn test_nonzero_exit_fails_with_stderr_tail() {
    let mut stage = stage(OutputMode::Combined);
    let input = stage
        .activate_with(|_, _, _| {
            sh_cmd(
                "cat > /dev/null; echo \"Unrecognized option 'foo'\" >&2; exit 1",
                &[],
            )
        })
        .unwrap();
    feed_all(&input, b"data", 2);

    let err = stage.run(&mut RecordingDownstream::default()).unwrap_err();
    match &err {
        StageError::AbnormalExit { failure, stderr } => {
            assert_eq!(*failure, ExitFailure::Code(1));
            assert!(stderr.contains("Unrecognized option 'foo'"), "{stderr}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(
        err.to_string(),
        "encoder exited with code 1: Unrecognized option 'foo'"
    );
    assert_eq!(stage.phase(), StagePhase::Finished);
}

#[test]
fn test_missing_encoder_fails_activation() {
    let mut settings = StageSettings::new(OutputMode::Combined);
    settings.encoder.ffmpeg_path = "/nonexistent/ffmpeg-ladder".to_string();
    let mut stage = TranscodeStage::new(settings);
    stage.register(0x100, video(640, 360)).unwrap();

    let err = stage.activate().err().unwrap();
    match err {
        StageError::ProcessStart { program, .. } => {
            assert_eq!(program, "/nonexistent/ffmpeg-ladder");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(stage.phase(), StagePhase::Finished);
}

#[test]
fn test_encoder_exiting_early_fails_the_write() {
    let mut stage = stage(OutputMode::Combined);
    let input = stage
        .activate_with(|_, _, _| sh_cmd("exit 0", &[]))
        .unwrap();

    // Far more than a pipe buffer, so a write must hit the closed pipe
    feed_all(&input, &payload(1 << 20), 64 * 1024);

    let err = stage.run(&mut RecordingDownstream::default()).unwrap_err();
    assert!(matches!(err, StageError::PipeWrite(_)), "{err:?}");
}

#[test]
fn test_upstream_dropped_before_end_of_input() {
    let mut stage = stage(OutputMode::Combined);
    let input = stage
        .activate_with(|_, _, _| sh_cmd("exec cat", &[]))
        .unwrap();
    input.send_chunk(b"partial".to_vec()).unwrap();
    drop(input);

    let mut downstream = RecordingDownstream::default();
    let err = stage.run(&mut downstream).unwrap_err();
    assert!(matches!(err, StageError::UpstreamClosed), "{err:?}");
    assert!(downstream.eos.is_empty());
}

#[test]
fn test_register_after_activation_is_rejected() {
    let mut stage = stage(OutputMode::Combined);
    let _input = stage
        .activate_with(|_, _, _| sh_cmd("exec cat", &[]))
        .unwrap();

    let err = stage.register(0x101, video(640, 360)).unwrap_err();
    assert!(
        matches!(
            err,
            StageError::InvalidState {
                phase: StagePhase::Active,
                ..
            }
        ),
        "{err:?}"
    );
    assert_eq!(stage.specs().len(), 1);

    let again = stage.activate_with(|_, _, _| sh_cmd("exec cat", &[]));
    assert!(matches!(again, Err(StageError::InvalidState { .. })));
}

#[test]
fn test_hung_encoder_is_killed_at_the_exit_bound() {
    let mut settings = StageSettings::new(OutputMode::Combined);
    settings.exit_timeout = Some(Duration::from_millis(300));
    let mut stage = TranscodeStage::new(settings);
    stage.register(0x100, video(640, 360)).unwrap();

    // Ignores end of input and never exits on its own
    let input = stage
        .activate_with(|_, _, _| sh_cmd("exec sleep 30", &[]))
        .unwrap();
    input.end_of_input().unwrap();

    let err = stage.run(&mut RecordingDownstream::default()).unwrap_err();
    match err {
        StageError::AbnormalExit { failure, .. } => {
            assert_eq!(failure, ExitFailure::TimedOut(Duration::from_millis(300)));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_downstream_failure_is_attributed_to_its_channel() {
    struct Refusing;

    impl ffladder::engine::Downstream for Refusing {
        fn write_chunk(&mut self, _: Channel, _: &[u8]) -> std::io::Result<()> {
            Err(std::io::Error::other("queue closed"))
        }

        fn end_of_stream(&mut self, _: Channel) -> std::io::Result<()> {
            Ok(())
        }
    }

    let mut stage = stage(OutputMode::Combined);
    let input = stage
        .activate_with(|_, _, _| sh_cmd("exec cat", &[]))
        .unwrap();
    feed_all(&input, b"bytes", 5);

    let err = stage.run(&mut Refusing).unwrap_err();
    assert_eq!(err.channel(), Some(Channel::Combined));
    assert!(matches!(err, StageError::Downstream { .. }));
}

#[test]
fn test_no_end_of_stream_when_encoder_fails_after_closing_stdout() {
    let mut stage = stage(OutputMode::Combined);
    let input = stage
        .activate_with(|_, _, _| sh_cmd("head -c 4; exec >&-; sleep 0.2; exit 3", &[]))
        .unwrap();
    let feeder = feed_then_close_late(input, b"abcd");

    let mut downstream = RecordingDownstream::default();
    let err = stage.run(&mut downstream).unwrap_err();
    feeder.join().unwrap();

    assert!(
        matches!(
            err,
            StageError::AbnormalExit {
                failure: ExitFailure::Code(3),
                ..
            }
        ),
        "{err:?}"
    );
    assert_eq!(downstream.bytes(Channel::Combined), b"abcd");
    assert!(downstream.eos.is_empty(), "truncated output must not end cleanly");
}

#[test]
fn test_no_end_of_stream_on_any_pipe_when_encoder_fails() {
    let mut stage = TranscodeStage::new(StageSettings::new(OutputMode::MultiSink));
    stage.register(1, video(640, 360)).unwrap();
    stage.register(2, video(320, 180)).unwrap();

    // Both pipes are written and closed before the encoder exits nonzero
    let input = stage
        .activate_with(|_, _, sinks| {
            let OutputSinks::Pipes(paths) = sinks else {
                panic!("multi-sink stage must hand out pipes");
            };
            let args: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
            sh_cmd("head -c 4 > \"$1\"; : > \"$2\"; sleep 0.2; exit 2", &args)
        })
        .unwrap();
    let feeder = feed_then_close_late(input, b"abcd");

    let mut downstream = RecordingDownstream::default();
    let err = stage.run(&mut downstream).unwrap_err();
    feeder.join().unwrap();

    assert!(
        matches!(
            err,
            StageError::AbnormalExit {
                failure: ExitFailure::Code(2),
                ..
            }
        ),
        "{err:?}"
    );
    assert!(downstream.eos.is_empty(), "{:?}", downstream.eos);
}

#[test]
fn test_encoder_dying_at_startup_reports_its_exit_and_stderr() {
    let mut stage = TranscodeStage::new(StageSettings::new(OutputMode::MultiSink));
    stage.register(1, video(640, 360)).unwrap();

    // Exits before opening any pipe, the way a rejected argument does
    let input = stage
        .activate_with(|_, _, _| sh_cmd("echo \"Option not found\" >&2; exit 1", &[]))
        .unwrap();
    feed_all(&input, &payload(1 << 20), 64 * 1024);

    let err = stage.run(&mut RecordingDownstream::default()).unwrap_err();
    match err {
        StageError::AbnormalExit { failure, stderr } => {
            assert_eq!(failure, ExitFailure::Code(1));
            assert_eq!(stderr, "Option not found");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
