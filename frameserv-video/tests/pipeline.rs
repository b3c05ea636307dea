//! End-to-end pipeline tests against real media.
//!
//! These need sample files under `testdata/` (not shipped with the repo),
//! so they are all `#[ignore]`d; run them locally with
//! `cargo test -p frameserv-video -- --ignored` after dropping in a 30fps
//! 10s clip and a directory of 100 numbered PNGs.

use std::time::Duration;

use frameserv_video::{
    ColorFormat, ImageSequenceReader, InterpMode, MatDataType, SnapshotGenerator, SnapshotQuality,
    VideoReader,
};

const VIDEO_PATH_SAMPLE: &str = "./testdata/sample_30fps_10s.mp4";
const IMGSEQ_DIR_SAMPLE: &str = "./testdata/imgseq_100";

fn open_started_reader() -> VideoReader {
    frameserv_util::log::init();
    frameserv_video::init();
    frameserv_util::poll::set_poll_interval(Duration::from_millis(1));
    let mut reader = VideoReader::open(VIDEO_PATH_SAMPLE).unwrap();
    reader
        .configure_video(0, 0, ColorFormat::Rgba, MatDataType::U8, InterpMode::Bilinear, None)
        .unwrap();
    reader.set_cache_frames(true, 8, 2);
    reader.set_cache_frames(false, 2, 8);
    reader.start().unwrap();
    reader
}

#[ignore]
#[test]
fn test_forward_sequential() {
    let mut reader = open_started_reader();
    reader.seek_to(0, false).unwrap();

    let mut prev_pts = i64::MIN;
    let mut eof_seen = false;
    let mut count = 0;
    for _ in 0..300 {
        let outcome = reader.read_next_video_frame(true).unwrap();
        match outcome.frame {
            Some(frame) => {
                assert!(frame.pts > prev_pts, "pts must be strictly increasing");
                prev_pts = frame.pts;
                count += 1;
                if outcome.eof {
                    eof_seen = true;
                    break;
                }
            }
            None => {
                assert!(outcome.eof, "a null frame before eof is a read failure");
                eof_seen = true;
                break;
            }
        }
    }
    assert_eq!(count, 300);
    assert!(eof_seen, "a 10s 30fps clip ends after 300 frames");
    reader.close();
}

#[ignore]
#[test]
fn test_mid_clip_random_access() {
    let mut reader = open_started_reader();
    reader.seek_to(5500, true).unwrap();
    let outcome = reader.read_video_frame(5500, true).unwrap();
    let frame = outcome.frame.expect("a frame at 5.5s");
    let frame_duration_ms = 1000 / 30 + 1;
    assert!(
        (frame.pos_ms - 5500).abs() < frame_duration_ms,
        "landed at {}ms instead of 5500ms",
        frame.pos_ms
    );
    let mat = reader.frame_mat(&frame).unwrap();
    assert!(mat.width() > 0 && mat.height() > 0);
    reader.close();
}

#[ignore]
#[test]
fn test_backward_scrub() {
    let mut reader = open_started_reader();
    reader.seek_to(9000, false).unwrap();
    assert!(reader.read_video_frame(9000, true).unwrap().frame.is_some());

    reader.set_direction(false);
    let mut prev_pts = i64::MAX;
    for _ in 0..10 {
        let outcome = reader.read_next_video_frame(true).unwrap();
        let frame = outcome.frame.expect("backward frames before the start");
        assert!(frame.pts < prev_pts, "pts must be strictly decreasing");
        prev_pts = frame.pts;
    }
    reader.close();
}

#[ignore]
#[test]
fn test_repeated_read_is_memoized() {
    let mut reader = open_started_reader();
    reader.seek_to(1000, false).unwrap();
    let first = reader.read_video_frame(1000, true).unwrap().frame.unwrap();
    let second = reader.read_video_frame(1000, true).unwrap().frame.unwrap();
    assert_eq!(first.pts, second.pts);
    reader.close();
}

#[ignore]
#[test]
fn test_snapshot_window_shift() {
    frameserv_util::log::init();
    frameserv_video::init();
    frameserv_util::poll::set_poll_interval(Duration::from_millis(1));
    let mut generator = SnapshotGenerator::open(VIDEO_PATH_SAMPLE).unwrap();
    generator.set_snapshot_window(10.0, 20).unwrap();
    generator
        .configure_snapshots(160, 90, ColorFormat::Rgba, MatDataType::U8, InterpMode::Area, None)
        .unwrap();
    generator.start().unwrap();
    let viewer = generator.create_viewer().unwrap();

    let snapshots = viewer.get_snapshots_wait(0.0).unwrap();
    assert!(snapshots.len() >= 20);
    for snapshot in &snapshots {
        assert_eq!(snapshot.quality, SnapshotQuality::Decoded);
        // each snapshot sits within half a source frame of its ideal time
        let ideal = snapshot.index as i64 * 500;
        assert!((snapshot.timestamp_ms - ideal).abs() <= 1000 / 30 / 2 + 1);
    }

    // shift: previously decoded snapshots inside the new window come back
    // from cache immediately
    let shifted = viewer.get_snapshots(2.0).unwrap();
    for snapshot in shifted.iter().filter(|s| s.index <= 20) {
        assert_eq!(snapshot.quality, SnapshotQuality::Decoded);
    }
    generator.close();
}

#[ignore]
#[test]
fn test_image_sequence_read() {
    frameserv_util::log::init();
    frameserv_video::init();
    frameserv_util::poll::set_poll_interval(Duration::from_millis(1));
    let mut reader = ImageSequenceReader::open_dir(IMGSEQ_DIR_SAMPLE, 25.0).unwrap();
    reader
        .configure_video(0, 0, ColorFormat::Rgb, MatDataType::U8, InterpMode::Bilinear)
        .unwrap();
    reader.start().unwrap();

    // frame 42 at 25fps starts at 1680ms
    let outcome = reader.read_video_frame(1680, true).unwrap();
    let frame = outcome.frame.expect("decoded image frame");
    assert_eq!(frame.pts, 42);
    assert!(frame.peek_mat().is_some(), "image frames arrive converted");
    reader.close();
}

#[ignore]
#[test]
fn test_close_returns_quickly() {
    let mut reader = open_started_reader();
    reader.seek_to(3000, false).unwrap();
    let _ = reader.read_video_frame(3000, true).unwrap();
    let begin = std::time::Instant::now();
    reader.close();
    assert!(
        begin.elapsed() < Duration::from_millis(500),
        "close must return within a few polling intervals"
    );
}
