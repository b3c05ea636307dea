//! Stream metadata probe and lazy seek-point discovery.
//!
//! `MediaParser` answers two questions before any pipeline spins up: what
//! is in the container (`MediaInfo`), and where can decoding start
//! (`SeekPointTable`). The seek-point scan walks every packet of the video
//! stream, so it runs on a background thread and the table fills in while
//! readers are already working; the demuxer extends it on the fly either
//! way.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
};

use anyhow::{bail, Context, Result};
use ffmpeg::{codec, ffi, format, media::Type, Rational};
use tracing::{debug, error, instrument};

use crate::{rotate::normalize_rotation, seek_points::SeekPointTable, timebase::TimeBase};

#[derive(Debug, Clone)]
pub struct VideoStreamInfo {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
    pub time_base: TimeBase,
    pub start_pts: i64,
    pub duration_pts: i64,
    pub duration_ms: i64,
    pub nb_frames: i64,
    /// Display rotation in degrees, normalized to {0, 90, 180, 270}.
    pub rotation: i32,
    /// Single-picture input (cover art, still image).
    pub is_image: bool,
}

#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub url: PathBuf,
    pub duration_ms: i64,
    pub video: Option<VideoStreamInfo>,
}

pub struct MediaParser {
    info: MediaInfo,
    seek_points: SeekPointTable,
    seek_points_ready: Arc<AtomicBool>,
    scan_quit: Arc<AtomicBool>,
    scan_thread: Mutex<Option<JoinHandle<()>>>,
}

impl MediaParser {
    #[instrument(err)]
    pub fn open<P: AsRef<Path> + std::fmt::Debug>(path: P) -> Result<Arc<MediaParser>> {
        let path = path.as_ref().to_owned();
        let input = format::input(&path)
            .with_context(|| format!("failed to open '{}'", path.display()))?;
        let container_duration_ms = if input.duration() == i64::MIN {
            0
        } else {
            // container duration is in AV_TIME_BASE units
            input.duration() * 1000 / ffi::AV_TIME_BASE as i64
        };

        let video = match input.streams().best(Type::Video) {
            Some(stream) => {
                let params = stream.parameters();
                let decoder_ctx = codec::Context::from_parameters(params)
                    .context("failed to read video stream parameters")?;
                let decoder = decoder_ctx.decoder().video()?;
                let start_pts = if stream.start_time() == i64::MIN {
                    0
                } else {
                    stream.start_time()
                };
                let time_base = TimeBase::new(stream.time_base(), start_pts);
                let duration_pts = stream.duration().max(0);
                let duration_ms = if duration_pts > 0 {
                    time_base.pts_to_millis(start_pts + duration_pts)
                } else {
                    container_duration_ms
                };
                let nb_frames = stream.frames();
                Some(VideoStreamInfo {
                    index: stream.index(),
                    width: decoder.width(),
                    height: decoder.height(),
                    frame_rate: stream.avg_frame_rate(),
                    time_base,
                    start_pts,
                    duration_pts,
                    duration_ms,
                    nb_frames,
                    rotation: stream_rotation(&stream),
                    is_image: nb_frames == 1 && duration_ms <= 0,
                })
            }
            None => None,
        };

        Ok(Arc::new(MediaParser {
            info: MediaInfo {
                url: path,
                duration_ms: container_duration_ms,
                video,
            },
            seek_points: SeekPointTable::new(),
            seek_points_ready: Arc::new(AtomicBool::new(false)),
            scan_quit: Arc::new(AtomicBool::new(false)),
            scan_thread: Mutex::new(None),
        }))
    }

    pub fn info(&self) -> &MediaInfo {
        &self.info
    }

    pub fn video_info(&self) -> Result<&VideoStreamInfo> {
        match &self.info.video {
            Some(video) => Ok(video),
            None => bail!("'{}' has no video stream", self.info.url.display()),
        }
    }

    /// Shared table; the scan thread and the demuxer both write into it.
    pub fn seek_points(&self) -> SeekPointTable {
        self.seek_points.clone()
    }

    pub fn seek_points_ready(&self) -> bool {
        self.seek_points_ready.load(Ordering::Acquire)
    }

    /// Kick off the background keyframe scan. Idempotent.
    pub fn enable_parse_info(&self) -> Result<()> {
        let mut guard = self.scan_thread.lock().unwrap();
        if guard.is_some() || self.seek_points_ready() {
            return Ok(());
        }
        let video = self.video_info()?;
        let path = self.info.url.clone();
        let stream_index = video.index;
        let table = self.seek_points.clone();
        let ready = self.seek_points_ready.clone();
        let quit = self.scan_quit.clone();
        let handle = std::thread::Builder::new()
            .name("seek-point-scan".into())
            .spawn(move || {
                if let Err(e) = scan_seek_points(&path, stream_index, &table, &quit) {
                    error!(%e, "seek point scan failed");
                    return;
                }
                ready.store(true, Ordering::Release);
                debug!(points = table.len(), "seek point scan finished");
            })
            .context("failed to spawn seek point scan thread")?;
        *guard = Some(handle);
        Ok(())
    }
}

impl Drop for MediaParser {
    fn drop(&mut self) {
        self.scan_quit.store(true, Ordering::Release);
        if let Some(handle) = self.scan_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn scan_seek_points(
    path: &Path,
    stream_index: usize,
    table: &SeekPointTable,
    quit: &AtomicBool,
) -> Result<()> {
    let mut input = format::input(&path)?;
    loop {
        if quit.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut packet = ffmpeg::codec::packet::Packet::empty();
        match packet.read(&mut input) {
            Ok(()) => {
                if packet.stream() != stream_index {
                    continue;
                }
                if packet.is_key() {
                    if let Some(pts) = packet.pts() {
                        table.insert_observed(pts);
                    }
                }
            }
            Err(ffmpeg::Error::Eof) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

fn stream_rotation(stream: &format::stream::Stream) -> i32 {
    for side_data in stream.side_data() {
        if side_data.kind() == codec::packet::side_data::Type::DisplayMatrix {
            let data = side_data.data();
            if data.len() >= 36 {
                let degrees =
                    unsafe { ffi::av_display_rotation_get(data.as_ptr() as *const i32) };
                if !degrees.is_nan() {
                    // the display matrix encodes the counter-clockwise
                    // correction; normalize to clockwise quarter turns
                    return normalize_rotation(-degrees);
                }
            }
        }
    }
    0
}

/// Cloneable positional iterator over the numbered image files of one
/// directory, sorted by file name.
#[derive(Debug, Clone)]
pub struct ImageSequenceIterator {
    files: Arc<Vec<PathBuf>>,
    pos: usize,
}

impl ImageSequenceIterator {
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<ImageSequenceIterator> {
        const IMAGE_EXTS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];
        let dir = dir.as_ref();
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("failed to list '{}'", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| IMAGE_EXTS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        if files.is_empty() {
            bail!("no image files found in '{}'", dir.display());
        }
        files.sort();
        Ok(ImageSequenceIterator {
            files: Arc::new(files),
            pos: 0,
        })
    }

    pub fn from_files(files: Vec<PathBuf>) -> ImageSequenceIterator {
        ImageSequenceIterator {
            files: Arc::new(files),
            pos: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn seek_index(&mut self, index: usize) {
        self.pos = index.min(self.files.len());
    }

    pub fn file_at(&self, index: usize) -> Option<&Path> {
        self.files.get(index).map(|p| p.as_path())
    }
}

impl Iterator for ImageSequenceIterator {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        let file = self.files.get(self.pos)?.clone();
        self.pos += 1;
        Some(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_sequence_iterator_positional() {
        let files: Vec<PathBuf> = (0..5).map(|i| PathBuf::from(format!("{i:03}.png"))).collect();
        let mut iter = ImageSequenceIterator::from_files(files);
        assert_eq!(iter.len(), 5);
        assert_eq!(iter.next(), Some(PathBuf::from("000.png")));
        assert_eq!(iter.position(), 1);

        let mut fork = iter.clone();
        fork.seek_index(3);
        assert_eq!(fork.next(), Some(PathBuf::from("003.png")));
        // the fork did not disturb the original
        assert_eq!(iter.next(), Some(PathBuf::from("001.png")));
    }

    #[test]
    fn test_image_sequence_iterator_exhausts() {
        let mut iter = ImageSequenceIterator::from_files(vec![PathBuf::from("a.png")]);
        assert!(iter.next().is_some());
        assert!(iter.next().is_none());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_file_at() {
        let iter = ImageSequenceIterator::from_files(vec![
            PathBuf::from("a.png"),
            PathBuf::from("b.png"),
        ]);
        assert_eq!(iter.file_at(1), Some(Path::new("b.png")));
        assert_eq!(iter.file_at(2), None);
    }
}
