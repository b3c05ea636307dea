//! Reader over a sequence of single-image files.
//!
//! Every file is an independent one-frame decode unit, so instead of one
//! demuxer feeding one decoder, a pool of workers opens and decodes files
//! in parallel. Each worker keeps its own decoder and re-opens it when the
//! codec or the frame geometry changes between adjacent files. Cache-range
//! arithmetic runs in frame-index units rather than PTS.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam::channel::{bounded, Receiver, Sender};
use ffmpeg::{codec, format, media::Type, util::frame::video::Video};
use frameserv_util::poll;
use tracing::{debug, instrument, warn};

use crate::{
    convert::FrameConverter,
    frame::VideoFrame,
    mat::{ColorFormat, InterpMode, MatDataType},
    parser::ImageSequenceIterator,
    sched::{TaskList, WorkerClass},
    task::{GopDecodeTask, TaskHandle},
    window::CacheRange,
};

const RESULT_CHANNEL_CAP: usize = 16;

/// One decoder bound to whatever codec the current file uses. Re-opened on
/// codec or geometry change; mixed-format directories are legitimate, so a
/// change is a warning, not an error.
pub(crate) struct FileDecoder {
    codec_id: Option<codec::Id>,
    dims: (u32, u32),
    decoder: Option<codec::decoder::Video>,
}

impl FileDecoder {
    pub(crate) fn new() -> FileDecoder {
        FileDecoder {
            codec_id: None,
            dims: (0, 0),
            decoder: None,
        }
    }

    #[instrument(skip(self), err)]
    pub(crate) fn decode_file(&mut self, path: &Path) -> Result<Video> {
        let mut input = format::input(&path)
            .with_context(|| format!("failed to open '{}'", path.display()))?;
        let (stream_index, parameters) = {
            let stream = input
                .streams()
                .best(Type::Video)
                .ok_or_else(|| anyhow!("no image stream in '{}'", path.display()))?;
            (stream.index(), stream.parameters())
        };
        let codec_id = parameters.id();

        let ctx = codec::Context::from_parameters(parameters.clone())?;
        let probe = ctx.decoder().video()?;
        let dims = (probe.width(), probe.height());
        if self.decoder.is_none() || self.codec_id != Some(codec_id) || self.dims != dims {
            if let Some(prev) = self.codec_id {
                if prev != codec_id {
                    warn!(
                        ?prev,
                        ?codec_id,
                        file = %path.display(),
                        "codec changed inside image sequence, reopening decoder"
                    );
                }
            }
            let ctx = codec::Context::from_parameters(parameters)?;
            self.decoder = Some(ctx.decoder().video()?);
            self.codec_id = Some(codec_id);
            self.dims = dims;
        }
        let decoder = self.decoder.as_mut().unwrap();

        let mut frame = Video::empty();
        loop {
            let mut packet = codec::packet::Packet::empty();
            match packet.read(&mut input) {
                Ok(()) => {
                    if packet.stream() != stream_index {
                        continue;
                    }
                    decoder.send_packet(&packet)?;
                }
                Err(ffmpeg::Error::Eof) => {
                    decoder.send_eof().ok();
                }
                Err(e) => return Err(e).context("packet read failed"),
            }
            match decoder.receive_frame(&mut frame) {
                Ok(()) => {
                    decoder.flush();
                    return Ok(frame);
                }
                Err(ffmpeg::Error::Other { errno })
                    if errno == ffmpeg::util::error::EAGAIN =>
                {
                    continue;
                }
                Err(ffmpeg::Error::Eof) => {
                    decoder.flush();
                    bail!("no frame decoded from '{}'", path.display());
                }
                Err(e) => return Err(e).context("receive_frame failed"),
            }
        }
    }
}

struct ConvertSettings {
    out_size: Option<(u32, u32)>,
    color_format: ColorFormat,
    data_type: MatDataType,
    interp: InterpMode,
}

struct ImgShared {
    files: ImageSequenceIterator,
    /// Frames per second the sequence plays at.
    frame_rate: f64,
    task_list: TaskList,
    quit: AtomicBool,
    err_msg: Mutex<Option<String>>,

    read_index: AtomicI64,
    cache_range: Mutex<CacheRange>,
    dirty: AtomicBool,
    forward: AtomicBool,
    fwd_cache: (AtomicU32, AtomicU32),
    bwd_cache: (AtomicU32, AtomicU32),

    convert: Mutex<ConvertSettings>,
    convert_generation: AtomicU64,
}

impl ImgShared {
    fn frame_count(&self) -> i64 {
        self.files.len() as i64
    }

    fn index_for_millis(&self, pos_ms: i64) -> i64 {
        (pos_ms as f64 * self.frame_rate / 1000.0).floor() as i64
    }

    fn millis_for_index(&self, index: i64) -> i64 {
        (index as f64 * 1000.0 / self.frame_rate).round() as i64
    }

    fn update_read_index(&self, index: i64) {
        let forward = self.forward.load(Ordering::Acquire);
        let (back, fwd) = if forward {
            (
                self.fwd_cache.0.load(Ordering::Acquire),
                self.fwd_cache.1.load(Ordering::Acquire),
            )
        } else {
            (
                self.bwd_cache.1.load(Ordering::Acquire),
                self.bwd_cache.0.load(Ordering::Acquire),
            )
        };
        let range = CacheRange::around(index, back, fwd, 1);
        let mut guard = self.cache_range.lock().unwrap();
        self.read_index.store(index, Ordering::Release);
        if *guard != range {
            *guard = range;
            self.dirty.store(true, Ordering::Release);
        }
    }

    fn cache_range(&self) -> CacheRange {
        *self.cache_range.lock().unwrap()
    }

    fn configure_converter(&self, converter: &mut FrameConverter) {
        let settings = self.convert.lock().unwrap();
        match settings.out_size {
            Some((w, h)) => converter.set_out_size(w, h),
            None => converter.set_scale_factors(1.0, 1.0),
        }
        converter.set_out_color_format(settings.color_format);
        converter.set_out_data_type(settings.data_type);
        converter.set_resize_interpolate_mode(settings.interp);
    }
}

pub struct ImageSequenceReader {
    shared: Option<Arc<ImgShared>>,
    files: ImageSequenceIterator,
    frame_rate: f64,
    num_workers: usize,
    threads: Vec<JoinHandle<()>>,
    started: bool,

    out_size: Option<(u32, u32)>,
    color_format: ColorFormat,
    data_type: MatDataType,
    interp: InterpMode,
    fwd_cache: (u32, u32),
    bwd_cache: (u32, u32),

    /// Last `(index, frame, eof)` served, so repeated identical reads are
    /// O(1) and report the same eof flag.
    prev_read: Mutex<Option<(i64, Arc<VideoFrame>, bool)>>,
}

impl ImageSequenceReader {
    pub fn open_dir<P: AsRef<Path>>(dir: P, frame_rate: f64) -> Result<ImageSequenceReader> {
        let files = ImageSequenceIterator::from_dir(dir)?;
        ImageSequenceReader::open(files, frame_rate)
    }

    pub fn open(files: ImageSequenceIterator, frame_rate: f64) -> Result<ImageSequenceReader> {
        if files.is_empty() {
            bail!("image sequence is empty");
        }
        if frame_rate <= 0.0 {
            bail!("frame rate must be positive");
        }
        Ok(ImageSequenceReader {
            shared: None,
            files,
            frame_rate,
            num_workers: 4,
            threads: Vec::new(),
            started: false,
            out_size: None,
            color_format: ColorFormat::default(),
            data_type: MatDataType::default(),
            interp: InterpMode::default(),
            fwd_cache: (1, 4),
            bwd_cache: (4, 1),
            prev_read: Mutex::new(None),
        })
    }

    pub fn configure_video(
        &mut self,
        out_width: u32,
        out_height: u32,
        color_format: ColorFormat,
        data_type: MatDataType,
        interp: InterpMode,
    ) -> Result<()> {
        if self.started {
            bail!("cannot configure an already started reader");
        }
        self.out_size = (out_width != 0 || out_height != 0).then_some((out_width, out_height));
        self.color_format = color_format;
        self.data_type = data_type;
        self.interp = interp;
        Ok(())
    }

    pub fn set_decode_workers(&mut self, workers: usize) -> Result<()> {
        if self.started {
            bail!("cannot configure an already started reader");
        }
        if workers == 0 {
            bail!("at least one decode worker is required");
        }
        self.num_workers = workers;
        Ok(())
    }

    pub fn set_cache_frames(&mut self, read_forward: bool, forward_frames: u32, backward_frames: u32) {
        if read_forward {
            self.fwd_cache = (backward_frames, forward_frames);
        } else {
            self.bwd_cache = (forward_frames, backward_frames);
        }
        if let Some(shared) = &self.shared {
            if read_forward {
                shared.fwd_cache.0.store(backward_frames, Ordering::Release);
                shared.fwd_cache.1.store(forward_frames, Ordering::Release);
            } else {
                shared.bwd_cache.0.store(forward_frames, Ordering::Release);
                shared.bwd_cache.1.store(backward_frames, Ordering::Release);
            }
            shared.update_read_index(shared.read_index.load(Ordering::Acquire));
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.files.len() as f64 * 1000.0 / self.frame_rate).round() as i64
    }

    #[instrument(skip(self), err)]
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        let shared = Arc::new(ImgShared {
            files: self.files.clone(),
            frame_rate: self.frame_rate,
            task_list: TaskList::new(),
            quit: AtomicBool::new(false),
            err_msg: Mutex::new(None),
            read_index: AtomicI64::new(0),
            cache_range: Mutex::new(CacheRange { first: i64::MIN, second: i64::MIN }),
            dirty: AtomicBool::new(true),
            forward: AtomicBool::new(true),
            fwd_cache: (
                AtomicU32::new(self.fwd_cache.0),
                AtomicU32::new(self.fwd_cache.1),
            ),
            bwd_cache: (
                AtomicU32::new(self.bwd_cache.0),
                AtomicU32::new(self.bwd_cache.1),
            ),
            convert: Mutex::new(ConvertSettings {
                out_size: self.out_size,
                color_format: self.color_format,
                data_type: self.data_type,
                interp: self.interp,
            }),
            convert_generation: AtomicU64::new(0),
        });
        shared.update_read_index(0);

        let (result_tx, result_rx) = bounded::<(TaskHandle, Arc<VideoFrame>)>(RESULT_CHANNEL_CAP);

        let sched_shared = shared.clone();
        self.threads.push(
            std::thread::Builder::new()
                .name("imgseq-sched".into())
                .spawn(move || scheduler_worker(sched_shared))?,
        );
        for worker_id in 0..self.num_workers {
            let worker_shared = shared.clone();
            let tx = result_tx.clone();
            self.threads.push(
                std::thread::Builder::new()
                    .name(format!("imgseq-decode-{worker_id}"))
                    .spawn(move || file_decode_worker(worker_shared, tx))?,
            );
        }
        drop(result_tx);
        let post_shared = shared.clone();
        self.threads.push(
            std::thread::Builder::new()
                .name("imgseq-postproc".into())
                .spawn(move || postprocess_worker(post_shared, result_rx))?,
        );

        self.shared = Some(shared);
        self.started = true;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if let Some(shared) = &self.shared {
            shared.quit.store(true, Ordering::Release);
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.started = false;
        Ok(())
    }

    pub fn close(&mut self) {
        let _ = self.stop();
        self.shared = None;
        self.prev_read.lock().unwrap().take();
    }

    fn shared(&self) -> Result<&Arc<ImgShared>> {
        self.shared
            .as_ref()
            .filter(|_| self.started)
            .ok_or_else(|| anyhow!("reader is not started"))
    }

    pub fn get_error(&self) -> Option<String> {
        self.shared
            .as_ref()
            .and_then(|s| s.err_msg.lock().unwrap().clone())
    }

    pub fn seek_to(&self, pos_ms: i64) -> Result<()> {
        let shared = self.shared()?;
        if pos_ms < 0 || pos_ms > self.duration_ms() {
            bail!("seek position {pos_ms}ms is outside the sequence duration");
        }
        let index = shared
            .index_for_millis(pos_ms)
            .min(shared.frame_count() - 1);
        shared.update_read_index(index);
        Ok(())
    }

    pub fn set_direction(&self, forward: bool) {
        if let Some(shared) = &self.shared {
            if shared.forward.swap(forward, Ordering::AcqRel) != forward {
                shared.update_read_index(shared.read_index.load(Ordering::Acquire));
            }
        }
    }

    pub fn change_video_output_size(&self, width: u32, height: u32, interp: InterpMode) -> Result<()> {
        let shared = self.shared()?;
        {
            let mut settings = shared.convert.lock().unwrap();
            settings.out_size = (width != 0 || height != 0).then_some((width, height));
            settings.interp = interp;
        }
        shared.convert_generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Frame covering `pos_ms` at the configured frame rate.
    pub fn read_video_frame(&self, pos_ms: i64, wait: bool) -> Result<crate::reader::ReadOutcome> {
        use crate::reader::ReadOutcome;
        let shared = self.shared()?;
        if pos_ms < 0 {
            return Ok(ReadOutcome { frame: None, eof: true });
        }
        let index = shared.index_for_millis(pos_ms);
        if index >= shared.frame_count() {
            return Ok(ReadOutcome { frame: None, eof: true });
        }
        if let Some((prev_index, frame, eof)) = self.prev_read.lock().unwrap().clone() {
            if prev_index == index {
                return Ok(ReadOutcome { frame: Some(frame), eof });
            }
        }
        shared.update_read_index(index);
        loop {
            if shared.quit.load(Ordering::Acquire) {
                bail!("reader is shutting down");
            }
            let tasks = shared.task_list.snapshot(WorkerClass::PostProcess);
            let hit = tasks
                .iter()
                .filter(|t| !t.is_cancelled() && t.seek_pts().0 == index)
                .flat_map(|t| t.finished_frames())
                .next();
            if let Some(frame) = hit {
                let eof = index == shared.frame_count() - 1
                    && shared.forward.load(Ordering::Acquire);
                *self.prev_read.lock().unwrap() = Some((index, frame.clone(), eof));
                return Ok(ReadOutcome { frame: Some(frame), eof });
            }
            if !wait {
                return Ok(ReadOutcome::default());
            }
            poll::idle_wait();
        }
    }

    pub fn read_next_video_frame(&self, wait: bool) -> Result<crate::reader::ReadOutcome> {
        let shared = self.shared()?;
        let current = match self.prev_read.lock().unwrap().clone() {
            Some((index, _, _)) => index,
            None => shared.read_index.load(Ordering::Acquire),
        };
        let next = if shared.forward.load(Ordering::Acquire) {
            current + 1
        } else {
            current - 1
        };
        if next < 0 || next >= shared.frame_count() {
            return Ok(crate::reader::ReadOutcome { frame: None, eof: true });
        }
        self.read_video_frame(shared.millis_for_index(next), wait)
    }
}

impl Drop for ImageSequenceReader {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

// ---------------------------------------------------------------------------
// workers

/// Maintains one single-frame task per index inside the cache range.
fn scheduler_worker(shared: Arc<ImgShared>) {
    debug!("imgseq scheduler enter");
    while !shared.quit.load(Ordering::Acquire) {
        if shared.dirty.swap(false, Ordering::AcqRel) {
            let range = shared.cache_range();
            let first = range.first.max(0);
            let second = range.second.min(shared.frame_count() - 1);
            let existing = shared.task_list.snapshot(WorkerClass::Demux);
            let mut rebuilt = Vec::new();
            for index in first..=second {
                match existing.iter().find(|t| t.seek_pts().0 == index) {
                    Some(task) => rebuilt.push(task.clone()),
                    None => rebuilt.push(Arc::new(GopDecodeTask::new((index, index + 1)))),
                }
            }
            for task in existing.iter() {
                if !rebuilt.iter().any(|t| Arc::ptr_eq(t, task)) {
                    task.cancel();
                }
            }
            shared.task_list.publish(rebuilt);
        }
        poll::idle_wait();
    }
    debug!("imgseq scheduler leave");
}

/// Priority of a pending index for the pool: distance from the read
/// pointer, weighted toward the current direction.
fn claim_next_task(shared: &ImgShared) -> Option<TaskHandle> {
    let tasks = shared.task_list.snapshot(WorkerClass::Demux);
    let read_index = shared.read_index.load(Ordering::Acquire);
    let forward = shared.forward.load(Ordering::Acquire);
    let mut ordered: Vec<&TaskHandle> = tasks
        .iter()
        .filter(|t| !t.is_cancelled() && !t.is_demuxing())
        .collect();
    ordered.sort_by_key(|t| {
        let index = t.seek_pts().0;
        let ahead = if forward { index >= read_index } else { index <= read_index };
        ((!ahead) as i64, (index - read_index).abs())
    });
    for task in ordered {
        if task.try_claim_demux() {
            return Some(task.clone());
        }
    }
    None
}

fn file_decode_worker(shared: Arc<ImgShared>, results: Sender<(TaskHandle, Arc<VideoFrame>)>) {
    debug!("imgseq decode worker enter");
    let mut decoder = FileDecoder::new();
    while !shared.quit.load(Ordering::Acquire) {
        let Some(task) = claim_next_task(&shared) else {
            poll::idle_wait();
            continue;
        };
        let index = task.seek_pts().0;
        let Some(path) = shared.files.file_at(index as usize).map(|p| p.to_owned()) else {
            task.cancel();
            continue;
        };
        if !task.begin_decoding() {
            continue;
        }
        match decoder.decode_file(&path) {
            Ok(mut frame) => {
                frame.set_pts(Some(index));
                let pos_ms = shared.millis_for_index(index);
                let vframe =
                    Arc::new(VideoFrame::from_software(frame, index, pos_ms, 1));
                vframe.mark_decode_started();
                if index == 0 {
                    vframe.set_start_frame(true);
                    task.set_media_begin();
                }
                if index == shared.frame_count() - 1 {
                    vframe.set_eof_frame(true);
                    task.set_media_end();
                }
                task.push_decoded_frame(vframe.clone());
                task.set_demuxer_eof();
                task.set_decoder_eof();
                if results.send((task, vframe)).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(file = %path.display(), %e, "image decode failed");
                task.set_demuxer_eof();
                task.set_decoder_eof();
                task.cancel();
            }
        }
    }
    debug!("imgseq decode worker leave");
}

fn postprocess_worker(shared: Arc<ImgShared>, results: Receiver<(TaskHandle, Arc<VideoFrame>)>) {
    debug!("imgseq postprocess enter");
    let mut converter = FrameConverter::new();
    let mut generation = shared.convert_generation.load(Ordering::Acquire);
    shared.configure_converter(&mut converter);
    let dec_lock = crate::hwaccel::CondMutex::new(false);

    while !shared.quit.load(Ordering::Acquire) {
        // eviction: cancelled tasks disappear with the published list, so
        // only frames of live tasks outside the range need dropping
        let range = shared.cache_range();
        let tasks = shared.task_list.snapshot(WorkerClass::PostProcess);
        for task in tasks.iter() {
            let index = task.seek_pts().0;
            if !range.contains(index) && !task.is_cancelled() {
                task.clear_frames();
            }
        }

        let current_generation = shared.convert_generation.load(Ordering::Acquire);
        if current_generation != generation {
            generation = current_generation;
            shared.configure_converter(&mut converter);
        }

        match results.recv_timeout(poll::poll_interval()) {
            Ok((task, frame)) => {
                if task.is_cancelled() {
                    continue;
                }
                match frame.convert(&mut converter, None, &dec_lock, &shared.quit) {
                    Ok(_) => task.finish_frame(frame),
                    Err(e) => {
                        warn!(index = task.seek_pts().0, %e, "conversion failed");
                        task.remove_frame(frame.pts);
                        task.cancel();
                    }
                }
            }
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("imgseq postprocess leave");
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn reader_with(n: usize, fps: f64) -> ImageSequenceReader {
        let files: Vec<PathBuf> = (0..n).map(|i| PathBuf::from(format!("{i:04}.png"))).collect();
        ImageSequenceReader::open(ImageSequenceIterator::from_files(files), fps).unwrap()
    }

    #[test]
    fn test_open_rejects_empty_sequence() {
        let iter = ImageSequenceIterator::from_files(Vec::new());
        assert!(ImageSequenceReader::open(iter, 25.0).is_err());
    }

    #[test]
    fn test_open_rejects_bad_frame_rate() {
        let iter = ImageSequenceIterator::from_files(vec![PathBuf::from("a.png")]);
        assert!(ImageSequenceReader::open(iter, 0.0).is_err());
    }

    #[test]
    fn test_duration() {
        let reader = reader_with(100, 25.0);
        assert_eq!(reader.duration_ms(), 4000);
    }

    #[test]
    fn test_index_mapping() {
        let reader = reader_with(100, 25.0);
        let mut r = reader;
        r.start().unwrap();
        let shared = r.shared().unwrap().clone();
        assert_eq!(shared.index_for_millis(0), 0);
        assert_eq!(shared.index_for_millis(39), 0);
        assert_eq!(shared.index_for_millis(40), 1);
        assert_eq!(shared.index_for_millis(1680), 42);
        assert_eq!(shared.millis_for_index(42), 1680);
        r.close();
    }

    #[test]
    fn test_scheduler_builds_tasks_around_read_index() {
        let mut reader = reader_with(100, 25.0);
        reader.set_cache_frames(true, 3, 1);
        reader.start().unwrap();
        let shared = reader.shared().unwrap().clone();
        shared.update_read_index(50);
        // wait for the scheduler to publish
        for _ in 0..200 {
            let tasks = shared.task_list.snapshot(WorkerClass::Demux);
            let indices: Vec<i64> = tasks.iter().map(|t| t.seek_pts().0).collect();
            if indices == vec![49, 50, 51, 52, 53] {
                reader.close();
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let tasks = shared.task_list.snapshot(WorkerClass::Demux);
        let indices: Vec<i64> = tasks.iter().map(|t| t.seek_pts().0).collect();
        reader.close();
        panic!("task list never converged, got {indices:?}");
    }

    #[test]
    fn test_cache_range_in_index_units() {
        let range = CacheRange::around(50, 3, 1, 1);
        assert_eq!(range.first, 47);
        assert_eq!(range.second, 51);
    }
}
