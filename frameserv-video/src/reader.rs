//! Random-access video reader.
//!
//! Three workers cooperate around a shared task list: the demuxer fills
//! per-GOP packet queues, the decoder turns them into frames addressed by
//! PTS, and the post-processor converts frames inside the cache range into
//! client matrices. The public API reads from the finished-frame lists and
//! never blocks longer than one polling interval without checking the quit
//! flag.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Instant,
};

use anyhow::{anyhow, bail, Context, Result};
use ffmpeg::Rational;
use frameserv_util::poll;
use tracing::{debug, error, instrument, warn};

use crate::{
    convert::FrameConverter,
    decode::{HwFrameEviction, ReceiveOutcome, SendOutcome, VideoDecoder},
    frame::VideoFrame,
    hwaccel::{CondMutex, HwDeviceKind},
    input::MediaInput,
    mat::{ColorFormat, InterpMode, Mat, MatDataType},
    parser::{MediaInfo, MediaParser, VideoStreamInfo},
    rotate::RotationFilter,
    sched::{
        self, cancel_tasks_past_eof, find_next_decode_task, find_next_demux_task,
        find_next_postprocess_task, TaskList, VideoPriority, WorkerClass,
    },
    seek_points::SeekPointTable,
    task::{GopDecodeTask, TaskHandle},
    timebase::TimeBase,
    window::CacheRange,
};

const HUNG_UP_WARN_MS: u128 = 3000;
const PACKET_QUEUE_SOFT_CAP: usize = 512;

/// Result of one read call. `eof` distinguishes "no frame because the
/// stream ended" from a read failure.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub frame: Option<Arc<VideoFrame>>,
    pub eof: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Opened,
    Configured,
    Started,
    Suspended,
    Closed,
}

struct SeekState {
    pending: Option<i64>,
    seeking_mode: bool,
}

/// Everything the three workers and the API share.
struct Shared {
    vinfo: VideoStreamInfo,
    time_base: TimeBase,
    frame_interval_pts: i64,
    seek_points: SeekPointTable,
    task_list: TaskList,

    quit: AtomicBool,
    prepared: AtomicBool,
    in_seeking: AtomicBool,
    err_msg: Mutex<Option<String>>,

    read_pts: AtomicI64,
    cache_range: Mutex<CacheRange>,
    dirty: AtomicBool,
    forward: AtomicBool,
    /// (behind, ahead) frame counts for forward reads.
    fwd_cache: (AtomicU32, AtomicU32),
    /// (ahead, behind) frame counts for backward reads.
    bwd_cache: (AtomicU32, AtomicU32),
    /// Backward-scrub safety: after a seek keep demuxing until this many
    /// packets at or past the read pointer have been seen.
    min_greater_pts_count: AtomicU32,

    seek: Mutex<SeekState>,
    seeking_flash: Mutex<Option<Arc<VideoFrame>>>,
    /// Seeks closer than this (ms) to the current flash keep it.
    seeking_flash_refresh_ms: AtomicI64,

    convert: ConvertCtx,
}

/// Conversion context shared between the post-processor and API reads.
struct ConvertCtx {
    converter: Mutex<FrameConverter>,
    rotation: i32,
    rotate: Mutex<Option<RotationFilter>>,
    dec_ctx_lock: Mutex<Arc<CondMutex>>,
}

impl Shared {
    fn set_error(&self, msg: impl Into<String>) {
        let msg = msg.into();
        error!("{msg}");
        *self.err_msg.lock().unwrap() = Some(msg);
    }

    fn update_read_pts(&self, read_pts: i64) {
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
        let range = CacheRange::around(read_pts, back, fwd, self.frame_interval_pts);
        let mut guard = self.cache_range.lock().unwrap();
        self.read_pts.store(read_pts, Ordering::Release);
        if *guard != range {
            *guard = range;
            self.dirty.store(true, Ordering::Release);
        }
    }

    fn cache_range(&self) -> CacheRange {
        *self.cache_range.lock().unwrap()
    }

    fn priority(&self) -> VideoPriority {
        let read_pts = self.read_pts.load(Ordering::Acquire);
        let show_gop_pts = if self.seek_points.is_empty() {
            read_pts
        } else {
            self.seek_points.bracket(read_pts).0
        };
        VideoPriority {
            show_gop_pts,
            forward: self.forward.load(Ordering::Acquire),
        }
    }

    /// Convert one frame with the shared conversion context.
    fn convert_frame(&self, frame: &VideoFrame) -> Result<Arc<Mat>> {
        let mut converter = self.convert.converter.lock().unwrap();
        let mut rotate = self.convert.rotate.lock().unwrap();
        if self.convert.rotation != 0 && rotate.is_none() {
            *rotate = Some(RotationFilter::new(
                self.convert.rotation,
                Rational::new(self.time_base.num, self.time_base.den),
            )?);
        }
        let dec_lock = self.convert.dec_ctx_lock.lock().unwrap().clone();
        frame.convert(&mut converter, rotate.as_mut(), &dec_lock, &self.quit)
    }

    /// All finished frames of live tasks in PTS order.
    fn finished_frames(&self, class: WorkerClass) -> Vec<(TaskHandle, Arc<VideoFrame>)> {
        let tasks = self.task_list.snapshot(class);
        let mut out = Vec::new();
        for task in tasks.iter() {
            if task.is_cancelled() {
                continue;
            }
            for frame in task.finished_frames() {
                out.push((task.clone(), frame));
            }
        }
        out.sort_by_key(|(_, f)| f.pts);
        out
    }
}

pub struct VideoReader {
    parser: Arc<MediaParser>,
    shared: Option<Arc<Shared>>,
    threads: Vec<JoinHandle<()>>,
    state: Lifecycle,

    // configuration, applied at start
    out_size: Option<(u32, u32)>,
    scale_factors: Option<(f32, f32)>,
    color_format: ColorFormat,
    data_type: MatDataType,
    interp: InterpMode,
    hw_kind: Option<HwDeviceKind>,
    hw_frame_eviction: HwFrameEviction,
    min_greater_pts_count: u32,

    fwd_cache: (u32, u32),
    bwd_cache: (u32, u32),

    /// Last `(pos_ms, frame, eof)` served, so repeated identical reads are
    /// O(1) and report the same eof flag.
    prev_read: Mutex<Option<(i64, Arc<VideoFrame>, bool)>>,
}

impl VideoReader {
    #[instrument(err)]
    pub fn open<P: AsRef<Path> + std::fmt::Debug>(path: P) -> Result<VideoReader> {
        let parser = MediaParser::open(path)?;
        VideoReader::open_with_parser(parser)
    }

    pub fn open_with_parser(parser: Arc<MediaParser>) -> Result<VideoReader> {
        parser.video_info()?;
        if let Err(e) = parser.enable_parse_info() {
            warn!(%e, "seek point parsing unavailable, relying on demuxer discovery");
        }
        Ok(VideoReader {
            parser,
            shared: None,
            threads: Vec::new(),
            state: Lifecycle::Opened,
            out_size: None,
            scale_factors: None,
            color_format: ColorFormat::default(),
            data_type: MatDataType::default(),
            interp: InterpMode::default(),
            hw_kind: Some(HwDeviceKind::Auto),
            hw_frame_eviction: HwFrameEviction::default(),
            min_greater_pts_count: 8,
            fwd_cache: (1, 4),
            bwd_cache: (4, 1),
            prev_read: Mutex::new(None),
        })
    }

    pub fn media_info(&self) -> &MediaInfo {
        self.parser.info()
    }

    pub fn get_error(&self) -> Option<String> {
        self.shared
            .as_ref()
            .and_then(|s| s.err_msg.lock().unwrap().clone())
    }

    pub fn is_started(&self) -> bool {
        self.state == Lifecycle::Started
    }

    pub fn is_suspended(&self) -> bool {
        self.state == Lifecycle::Suspended
    }

    pub fn is_direction_forward(&self) -> bool {
        self.shared
            .as_ref()
            .map(|s| s.forward.load(Ordering::Acquire))
            .unwrap_or(true)
    }

    pub fn configure_video(
        &mut self,
        out_width: u32,
        out_height: u32,
        color_format: ColorFormat,
        data_type: MatDataType,
        interp: InterpMode,
        hw_kind: Option<HwDeviceKind>,
    ) -> Result<()> {
        self.check_configurable()?;
        self.out_size = Some((out_width, out_height));
        self.scale_factors = None;
        self.color_format = color_format;
        self.data_type = data_type;
        self.interp = interp;
        self.hw_kind = hw_kind;
        self.state = Lifecycle::Configured;
        Ok(())
    }

    pub fn configure_video_scaled(
        &mut self,
        width_factor: f32,
        height_factor: f32,
        color_format: ColorFormat,
        data_type: MatDataType,
        interp: InterpMode,
        hw_kind: Option<HwDeviceKind>,
    ) -> Result<()> {
        self.check_configurable()?;
        self.scale_factors = Some((width_factor, height_factor));
        self.out_size = None;
        self.color_format = color_format;
        self.data_type = data_type;
        self.interp = interp;
        self.hw_kind = hw_kind;
        self.state = Lifecycle::Configured;
        Ok(())
    }

    fn check_configurable(&self) -> Result<()> {
        match self.state {
            Lifecycle::Opened | Lifecycle::Configured => Ok(()),
            Lifecycle::Started | Lifecycle::Suspended => {
                bail!("cannot configure an already started reader")
            }
            Lifecycle::Closed => bail!("reader is closed"),
        }
    }

    pub fn enable_hwaccel(&mut self, enable: bool) -> Result<()> {
        self.check_configurable()?;
        self.hw_kind = if enable { Some(HwDeviceKind::Auto) } else { None };
        Ok(())
    }

    /// Keep hardware frames referenced until conversion (`Deferred`) or
    /// transfer them right out of the decoder (`Inline`).
    pub fn set_hw_frame_eviction(&mut self, policy: HwFrameEviction) -> Result<()> {
        self.check_configurable()?;
        self.hw_frame_eviction = policy;
        Ok(())
    }

    /// Backward-scrub demux safety count, see module docs.
    pub fn set_min_greater_pts_count(&mut self, count: u32) {
        self.min_greater_pts_count = count;
        if let Some(shared) = &self.shared {
            shared
                .min_greater_pts_count
                .store(count, Ordering::Release);
        }
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
            shared.update_read_pts(shared.read_pts.load(Ordering::Acquire));
        }
    }

    /// Enter the started lifecycle without spawning the pipeline; the
    /// first `wakeup()` brings the workers up. Lets callers front-load
    /// configuration for inputs they may never actually read.
    pub fn start_suspended(&mut self) -> Result<()> {
        match self.state {
            Lifecycle::Configured => {
                self.state = Lifecycle::Suspended;
                Ok(())
            }
            Lifecycle::Suspended | Lifecycle::Started => Ok(()),
            Lifecycle::Opened => bail!("configure the reader before starting it"),
            Lifecycle::Closed => bail!("reader is closed"),
        }
    }

    #[instrument(skip(self), err)]
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            Lifecycle::Configured | Lifecycle::Suspended => {}
            Lifecycle::Opened => bail!("configure the reader before starting it"),
            Lifecycle::Started => return Ok(()),
            Lifecycle::Closed => bail!("reader is closed"),
        }
        let vinfo = self.parser.video_info()?.clone();
        let time_base = vinfo.time_base;
        let frame_interval_pts = time_base.frame_interval_pts(vinfo.frame_rate);

        let seek_points = self.parser.seek_points();
        if seek_points.is_empty() {
            // at minimum the stream start is decodable
            seek_points.insert_observed(vinfo.start_pts);
        }

        let mut converter = FrameConverter::new();
        match (self.out_size, self.scale_factors) {
            (Some((w, h)), _) => converter.set_out_size(w, h),
            (None, Some((fw, fh))) => converter.set_scale_factors(fw, fh),
            (None, None) => {}
        }
        converter.set_out_color_format(self.color_format);
        converter.set_out_data_type(self.data_type);
        converter.set_resize_interpolate_mode(self.interp);

        let mut decoder = VideoDecoder::open(
            MediaInput::open(&self.parser.info().url)?.parameters(),
            self.hw_kind,
        )?;
        decoder.hw_frame_eviction = self.hw_frame_eviction;
        let dec_ctx_lock = decoder.ctx_lock();

        let read_pts = self
            .shared
            .as_ref()
            .map(|s| s.read_pts.load(Ordering::Acquire))
            .unwrap_or(vinfo.start_pts);
        let forward = self.is_direction_forward();

        let shared = Arc::new(Shared {
            vinfo: vinfo.clone(),
            time_base,
            frame_interval_pts,
            seek_points,
            task_list: TaskList::new(),
            quit: AtomicBool::new(false),
            prepared: AtomicBool::new(false),
            in_seeking: AtomicBool::new(false),
            err_msg: Mutex::new(None),
            read_pts: AtomicI64::new(read_pts),
            cache_range: Mutex::new(CacheRange { first: i64::MIN, second: i64::MIN }),
            dirty: AtomicBool::new(true),
            forward: AtomicBool::new(forward),
            fwd_cache: (
                AtomicU32::new(self.fwd_cache.0),
                AtomicU32::new(self.fwd_cache.1),
            ),
            bwd_cache: (
                AtomicU32::new(self.bwd_cache.0),
                AtomicU32::new(self.bwd_cache.1),
            ),
            min_greater_pts_count: AtomicU32::new(self.min_greater_pts_count),
            seek: Mutex::new(SeekState {
                pending: None,
                seeking_mode: false,
            }),
            seeking_flash: Mutex::new(None),
            seeking_flash_refresh_ms: AtomicI64::new(500),
            convert: ConvertCtx {
                converter: Mutex::new(converter),
                rotation: vinfo.rotation,
                rotate: Mutex::new(None),
                dec_ctx_lock: Mutex::new(dec_ctx_lock),
            },
        });
        shared.update_read_pts(read_pts);

        let input = MediaInput::open(&self.parser.info().url)?;
        let demux_shared = shared.clone();
        let decode_shared = shared.clone();
        let post_shared = shared.clone();
        self.threads = vec![
            std::thread::Builder::new()
                .name("video-demux".into())
                .spawn(move || demux_worker(demux_shared, input))?,
            std::thread::Builder::new()
                .name("video-decode".into())
                .spawn(move || decode_worker(decode_shared, decoder))?,
            std::thread::Builder::new()
                .name("video-postproc".into())
                .spawn(move || postprocess_worker(post_shared))?,
        ];
        self.shared = Some(shared);
        self.state = Lifecycle::Started;
        Ok(())
    }

    fn join_workers(&mut self) {
        if let Some(shared) = &self.shared {
            shared.quit.store(true, Ordering::Release);
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }

    /// Release the demuxer, decoder and all cached frames while remembering
    /// the read position. `wakeup` rebuilds the pipeline.
    pub fn suspend(&mut self) -> Result<()> {
        if self.state != Lifecycle::Started {
            bail!("reader is not started");
        }
        self.join_workers();
        if let Some(shared) = &self.shared {
            for task in shared.task_list.snapshot(WorkerClass::Demux).iter() {
                task.cancel();
                task.clear_frames();
            }
        }
        self.state = Lifecycle::Suspended;
        Ok(())
    }

    pub fn wakeup(&mut self) -> Result<()> {
        if self.state != Lifecycle::Suspended {
            bail!("reader is not suspended");
        }
        self.start()
    }

    pub fn stop(&mut self) -> Result<()> {
        if self.state == Lifecycle::Started || self.state == Lifecycle::Suspended {
            self.join_workers();
            self.state = Lifecycle::Configured;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.join_workers();
        self.shared = None;
        self.prev_read.lock().unwrap().take();
        self.state = Lifecycle::Closed;
    }

    fn shared(&self) -> Result<&Arc<Shared>> {
        match self.state {
            Lifecycle::Started | Lifecycle::Suspended => {}
            _ => bail!("reader is not started"),
        }
        self.shared
            .as_ref()
            .ok_or_else(|| anyhow!("reader is not started"))
    }

    #[instrument(skip(self), err)]
    pub fn seek_to(&self, pos_ms: i64, seeking_mode: bool) -> Result<()> {
        let shared = self.shared()?;
        if pos_ms < 0 || pos_ms > shared.vinfo.duration_ms {
            bail!("seek position {pos_ms}ms is outside the stream duration");
        }
        let pts = shared.time_base.millis_to_pts(pos_ms);
        {
            let mut seek = shared.seek.lock().unwrap();
            seek.seeking_mode = seeking_mode;
            if !seeking_mode {
                shared.seeking_flash.lock().unwrap().take();
            }
            seek.pending = Some(pts);
        }
        shared.in_seeking.store(true, Ordering::Release);
        if shared.prepared.load(Ordering::Acquire) {
            shared.update_read_pts(pts);
        }
        Ok(())
    }

    pub fn set_direction(&self, forward: bool) {
        if let Some(shared) = &self.shared {
            if shared.forward.swap(forward, Ordering::AcqRel) != forward {
                debug!(forward, "read direction changed");
                shared.update_read_pts(shared.read_pts.load(Ordering::Acquire));
                shared.dirty.store(true, Ordering::Release);
            }
        }
    }

    pub fn get_seeking_flash(&self) -> Option<Arc<VideoFrame>> {
        self.shared
            .as_ref()
            .and_then(|s| s.seeking_flash.lock().unwrap().clone())
    }

    pub fn get_read_pos(&self) -> i64 {
        self.shared
            .as_ref()
            .map(|s| s.time_base.pts_to_millis(s.read_pts.load(Ordering::Acquire)))
            .unwrap_or(0)
    }

    pub fn change_video_output_size(&self, width: u32, height: u32, interp: InterpMode) -> Result<()> {
        let shared = self.shared()?;
        let mut converter = shared.convert.converter.lock().unwrap();
        converter.set_out_size(width, height);
        converter.set_resize_interpolate_mode(interp);
        Ok(())
    }

    /// Frame whose display interval contains `pos_ms`.
    #[instrument(skip(self))]
    pub fn read_video_frame(&self, pos_ms: i64, wait: bool) -> Result<ReadOutcome> {
        let shared = self.shared()?;
        if self.state == Lifecycle::Suspended {
            bail!("reader is suspended");
        }
        if !wait_prepared(shared, wait)? {
            return Ok(ReadOutcome::default());
        }
        if pos_ms < 0 || pos_ms >= shared.vinfo.duration_ms.max(1) {
            return Ok(ReadOutcome { frame: None, eof: true });
        }
        if let Some((prev_pos, frame, eof)) = self.prev_read.lock().unwrap().clone() {
            if prev_pos == pos_ms {
                return Ok(ReadOutcome { frame: Some(frame), eof });
            }
        }

        let pts = shared.time_base.millis_to_pts(pos_ms);
        let forward = shared.forward.load(Ordering::Acquire);
        let read_pts = shared.read_pts.load(Ordering::Acquire);
        if (forward && pts > read_pts) || (!forward && pts < read_pts) {
            shared.update_read_pts(pts);
        }

        let outcome = self.scan_for_frame(shared, pts, wait)?;
        if let Some(frame) = &outcome.frame {
            *self.prev_read.lock().unwrap() = Some((pos_ms, frame.clone(), outcome.eof));
        }
        Ok(outcome)
    }

    fn scan_for_frame(&self, shared: &Arc<Shared>, pts: i64, wait: bool) -> Result<ReadOutcome> {
        let start = Instant::now();
        let mut last_warn = Instant::now();
        loop {
            if shared.quit.load(Ordering::Acquire) {
                bail!("reader is shutting down");
            }
            if !shared.in_seeking.load(Ordering::Acquire) {
                let frames = shared.finished_frames(WorkerClass::PostProcess);
                if let Some(hit) = select_frame(&frames, pts) {
                    let eof = hit.is_eof_frame()
                        && shared.forward.load(Ordering::Acquire)
                        && pts >= hit.pts;
                    return Ok(ReadOutcome { frame: Some(hit), eof });
                }
            }
            if !wait {
                return Ok(ReadOutcome::default());
            }
            poll::idle_wait();
            if last_warn.elapsed().as_millis() > HUNG_UP_WARN_MS {
                last_warn = Instant::now();
                warn!(
                    elapsed_s = start.elapsed().as_secs(),
                    pts, "read_video_frame hung up"
                );
            }
        }
    }

    /// Next frame after the previous read in the current direction.
    pub fn read_next_video_frame(&self, wait: bool) -> Result<ReadOutcome> {
        let shared = self.shared()?;
        if self.state == Lifecycle::Suspended {
            bail!("reader is suspended");
        }
        if !wait_prepared(shared, wait)? {
            return Ok(ReadOutcome::default());
        }
        let current_pts = match self.prev_read.lock().unwrap().clone() {
            Some((_, frame, _)) => frame.pts,
            None => shared.read_pts.load(Ordering::Acquire),
        };
        let forward = shared.forward.load(Ordering::Acquire);
        loop {
            if shared.quit.load(Ordering::Acquire) {
                bail!("reader is shutting down");
            }
            let frames = shared.finished_frames(WorkerClass::PostProcess);
            if !frames.is_empty() {
                if forward {
                    if let Some((_, next)) = frames.iter().find(|(_, f)| f.pts > current_pts) {
                        return self.finish_next_read(shared, next.clone());
                    }
                    if frames.last().map(|(_, f)| f.is_eof_frame()).unwrap_or(false) {
                        return Ok(ReadOutcome { frame: None, eof: true });
                    }
                } else {
                    if let Some((_, next)) = frames.iter().rev().find(|(_, f)| f.pts < current_pts)
                    {
                        return self.finish_next_read(shared, next.clone());
                    }
                    if frames.first().map(|(_, f)| f.is_start_frame()).unwrap_or(false) {
                        return Ok(ReadOutcome { frame: None, eof: true });
                    }
                }
            }
            if !wait {
                return Ok(ReadOutcome::default());
            }
            poll::idle_wait();
        }
    }

    fn finish_next_read(&self, shared: &Arc<Shared>, frame: Arc<VideoFrame>) -> Result<ReadOutcome> {
        shared.update_read_pts(frame.pts);
        let eof = frame.is_eof_frame() && shared.forward.load(Ordering::Acquire);
        *self.prev_read.lock().unwrap() = Some((frame.pos_ms, frame.clone(), eof));
        Ok(ReadOutcome { frame: Some(frame), eof })
    }

    /// Convert (if still needed) and return the matrix of a frame obtained
    /// from one of the read calls.
    pub fn frame_mat(&self, frame: &VideoFrame) -> Result<Arc<Mat>> {
        let shared = self.shared()?;
        shared.convert_frame(frame)
    }
}

impl Drop for VideoReader {
    fn drop(&mut self) {
        self.join_workers();
    }
}

fn wait_prepared(shared: &Arc<Shared>, wait: bool) -> Result<bool> {
    if shared.prepared.load(Ordering::Acquire) {
        return Ok(true);
    }
    if !wait {
        return Ok(false);
    }
    while !shared.prepared.load(Ordering::Acquire) {
        if shared.quit.load(Ordering::Acquire) {
            bail!("reader is shutting down");
        }
        if let Some(msg) = shared.err_msg.lock().unwrap().clone() {
            bail!("reader failed to prepare: {msg}");
        }
        poll::idle_wait();
    }
    Ok(true)
}

/// Frame selection rule: the frame whose `[pts, pts+dur)` interval contains
/// the target; else the last frame at or before the target when the stream
/// end was decoded; else the start frame when the target precedes it.
fn select_frame(frames: &[(TaskHandle, Arc<VideoFrame>)], pts: i64) -> Option<Arc<VideoFrame>> {
    if frames.is_empty() {
        return None;
    }
    match frames.iter().position(|(_, f)| f.pts > pts) {
        Some(0) => {
            let first = &frames[0].1;
            first.is_start_frame().then(|| first.clone())
        }
        Some(idx) => Some(frames[idx - 1].1.clone()),
        None => {
            let (_, last) = frames.last().unwrap();
            (pts < last.pts + last.dur.max(1) || last.is_eof_frame()).then(|| last.clone())
        }
    }
}

// ---------------------------------------------------------------------------
// demux worker

fn demux_worker(shared: Arc<Shared>, mut input: MediaInput) {
    debug!("demux worker enter");
    shared.prepared.store(true, Ordering::Release);

    let mut current: Option<TaskHandle> = None;
    // end of the previous task's bracket, for seekless contiguous reads
    let mut last_task_end = i64::MIN;
    // packet read but not yet assigned to a task
    let mut pending_pkt: Option<ffmpeg::codec::packet::Packet> = None;
    let mut demux_eof = false;
    // whether the current task ever received a packet; EOF before the
    // first one makes the task invalid
    let mut pushed_any = false;
    // pts seen since the last seek, for the backward safety check
    let mut pts_after_seek: Vec<i64> = Vec::new();
    let mut need_pts_safety = false;

    while !shared.quit.load(Ordering::Acquire) {
        let mut idle = true;

        // apply a pending client seek
        let seek_target = shared.seek.lock().unwrap().pending.take();
        if let Some(target) = seek_target {
            let (first, _) = shared.seek_points.bracket(target);
            let covered = shared
                .task_list
                .snapshot(WorkerClass::Demux)
                .iter()
                .any(|t| !t.is_cancelled() && t.seek_pts().0 == first && t.is_demuxing());
            if covered {
                debug!(target, "seek discarded, target already demuxed");
            } else {
                shared.update_read_pts(target);
                shared.dirty.store(true, Ordering::Release);
                pts_after_seek.clear();
                need_pts_safety = !shared.forward.load(Ordering::Acquire);
            }
            shared.in_seeking.store(false, Ordering::Release);
        }

        // rebuild the task list when the cache window moved
        if shared.dirty.swap(false, Ordering::AcqRel) {
            let range = shared.cache_range();
            let begin = range.first.max(shared.vinfo.start_pts);
            let end = range.second;
            let existing = shared.task_list.snapshot(WorkerClass::Demux);
            let rebuilt =
                sched::rebuild_video_tasks(&existing, &shared.seek_points, begin, end);
            shared.task_list.publish(rebuilt);
            if current.as_ref().map(|t| t.is_cancelled()).unwrap_or(false) {
                current = None;
            }
            idle = false;
        }

        // pick the next task
        if current
            .as_ref()
            .map(|t| t.is_cancelled() || t.is_demuxer_eof())
            .unwrap_or(true)
        {
            if let Some(task) = &current {
                last_task_end = task.seek_pts().1;
            }
            let tasks = shared.task_list.snapshot(WorkerClass::Demux);
            let next = if need_pts_safety {
                backward_safety_task(&shared, &tasks, &pts_after_seek, &mut need_pts_safety)
                    .or_else(|| find_next_demux_task(&tasks, &shared.priority(), None))
            } else {
                find_next_demux_task(&tasks, &shared.priority(), None)
            };
            if let Some(task) = next {
                task.begin_demuxing();
                debug!(seek_pts = ?task.seek_pts(), "demux task changed");
                let start = task.seek_pts().0;
                let contiguous = !demux_eof
                    && last_task_end == start
                    && pending_pkt
                        .as_ref()
                        .map(|p| p.pts().unwrap_or(i64::MIN) >= start)
                        .unwrap_or(true);
                pushed_any = false;
                if !contiguous {
                    pending_pkt = None;
                    demux_eof = false;
                    match seek_for_task(&shared, &mut input, &task) {
                        Ok(pushed) => pushed_any = pushed,
                        Err(e) => {
                            shared.set_error(format!("demux seek failed: {e:#}"));
                            break;
                        }
                    }
                    pts_after_seek.clear();
                }
                if start <= shared.vinfo.start_pts {
                    task.set_media_begin();
                }
                current = Some(task);
                idle = false;
            }
        }

        // feed the current task
        if let Some(task) = &current {
            if task.packet_queue_len() < PACKET_QUEUE_SOFT_CAP && !task.is_demuxer_eof() {
                let pkt = match pending_pkt.take() {
                    Some(pkt) => Some(pkt),
                    None => match input.read_packet() {
                        Ok(pkt) => pkt,
                        Err(e) => {
                            warn!(%e, "packet read failed");
                            poll::idle_wait();
                            continue;
                        }
                    },
                };
                match pkt {
                    Some(pkt) => {
                        let pts = pkt.pts().unwrap_or(i64::MIN);
                        let (_, end) = task.seek_pts();
                        if pts >= end {
                            // first packet of the next GOP, keep it around
                            task.set_demuxer_eof();
                            pending_pkt = Some(pkt);
                        } else {
                            if pkt.is_key() && pts != i64::MIN {
                                shared.seek_points.insert_observed(pts);
                            }
                            if pts != i64::MIN {
                                if pts < task.seek_pts().0 {
                                    task.extend_seek_range(pts);
                                }
                                if pts >= shared.read_pts.load(Ordering::Acquire) {
                                    pts_after_seek.push(pts);
                                }
                            }
                            task.push_packet(pkt);
                            pushed_any = true;
                            // the decoder may have everything it needs already
                            if task.all_candidates_decoded() {
                                task.set_demuxer_eof();
                            }
                        }
                        idle = false;
                    }
                    None => {
                        debug!(seek_pts = ?task.seek_pts(), "container eof");
                        demux_eof = true;
                        task.set_media_end();
                        task.set_demuxer_eof();
                        let tasks = shared.task_list.snapshot(WorkerClass::Demux);
                        if !pushed_any {
                            task.cancel();
                        }
                        cancel_tasks_past_eof(&tasks, task);
                        idle = false;
                    }
                }
            }
        }

        if idle {
            poll::idle_wait();
        }
    }
    debug!("demux worker leave");
}

/// Seek the input to a task's first seek point, retrying with an earlier
/// target when the seek-point table turns out to be optimistic, and
/// recording the truth back into the table. Returns whether a packet made
/// it into the task.
fn seek_for_task(shared: &Arc<Shared>, input: &mut MediaInput, task: &TaskHandle) -> Result<bool> {
    let mut target = task.seek_pts().0.max(shared.vinfo.start_pts);
    for attempt in 0..2 {
        input.seek_to_pts(target)?;
        let pkt = input
            .read_packet()
            .context("read after seek failed")?;
        match pkt {
            None => {
                // seeking to this GOP hits EOF straight away
                task.set_media_end();
                task.set_demuxer_eof();
                task.cancel();
                return Ok(false);
            }
            Some(pkt) => {
                let pts = pkt.pts().unwrap_or(i64::MIN);
                if pts > target && target > shared.vinfo.start_pts && attempt == 0 {
                    // the table promised a keyframe that isn't where the
                    // container puts it; remember the real one and retry
                    // from farther back
                    warn!(target, landed = pts, "imprecise seek point");
                    shared.seek_points.insert_observed(pts);
                    target = (target - shared.frame_interval_pts * 4)
                        .max(shared.vinfo.start_pts);
                    continue;
                }
                if pts != i64::MIN && pts < task.seek_pts().0 {
                    task.extend_seek_range(pts);
                }
                if pkt.is_key() && pts != i64::MIN {
                    shared.seek_points.insert_observed(pts);
                }
                task.push_packet(pkt);
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Backward playback starves unless enough packets at or past the read
/// pointer were demuxed after a seek. Returns the task that fills the gap,
/// clearing the flag once satisfied.
fn backward_safety_task(
    shared: &Arc<Shared>,
    tasks: &[TaskHandle],
    pts_after_seek: &[i64],
    need_pts_safety: &mut bool,
) -> Option<TaskHandle> {
    let read_pts = shared.read_pts.load(Ordering::Acquire);
    let needed = shared.min_greater_pts_count.load(Ordering::Acquire) as usize;
    let have = pts_after_seek.iter().filter(|&&p| p >= read_pts).count();
    if have >= needed {
        *need_pts_safety = false;
        return None;
    }
    // demux forward from the read pointer until the count is satisfied
    tasks
        .iter()
        .filter(|t| !t.is_cancelled() && !t.is_demuxing() && t.seek_pts().1 > read_pts)
        .min_by_key(|t| t.seek_pts().0)
        .cloned()
}

// ---------------------------------------------------------------------------
// decode worker

fn decode_worker(shared: Arc<Shared>, mut decoder: VideoDecoder) {
    debug!("decode worker enter");
    while !shared.prepared.load(Ordering::Acquire) && !shared.quit.load(Ordering::Acquire) {
        poll::idle_wait();
    }

    let mut current: Option<TaskHandle> = None;
    let mut need_reset = false;
    // the task whose buffered frames a null packet is draining out
    let mut draining_for: Option<TaskHandle> = None;

    'outer: while !shared.quit.load(Ordering::Acquire) {
        let mut idle = true;

        let input_done = current
            .as_ref()
            .map(|t| {
                t.is_cancelled()
                    || t.is_decoder_eof()
                    || (t.packet_queue_len() == 0
                        && t.is_demuxer_eof()
                        && !draining_for.as_ref().map(|d| Arc::ptr_eq(d, t)).unwrap_or(false))
            })
            .unwrap_or(true);
        if input_done {
            let old = current.take();
            let tasks = shared.task_list.snapshot(WorkerClass::Decode);
            let next = find_next_decode_task(&tasks, &shared.priority());
            if let Some(task) = &next {
                if task.redo_requested() {
                    task.prepare_redo();
                    need_reset = true;
                }
                if !task.begin_decoding() {
                    poll::idle_wait();
                    continue;
                }
                debug!(seek_pts = ?task.seek_pts(), "decode task changed");
                idle = false;
            }
            if let Some(old_task) = &old {
                let contiguous = next
                    .as_ref()
                    .map(|t| old_task.seek_pts().1 == t.seek_pts().0)
                    .unwrap_or(false);
                if old_task.is_cancelled() || !contiguous {
                    need_reset = true;
                } else if draining_for.is_none() && !old_task.is_decoder_eof() {
                    // GOP boundary: drain the codec's reordering buffer
                    if let Err(e) = decoder.send_eof() {
                        shared.set_error(format!("decoder drain failed: {e:#}"));
                        break 'outer;
                    }
                    draining_for = Some(old_task.clone());
                }
            }
            current = next;
        }

        if need_reset {
            decoder.flush();
            need_reset = false;
            draining_for = None;
        }

        // pull decoded frames
        if !decoder.hw_backlog_full() {
            match decoder.receive_frame() {
                Ok(ReceiveOutcome::Frame(frame)) => {
                    idle = false;
                    if let Err(e) = dispatch_frame(&shared, &decoder, frame) {
                        warn!(%e, "frame dispatch failed");
                    }
                }
                Ok(ReceiveOutcome::Again) => {}
                Ok(ReceiveOutcome::Eof) => {
                    idle = false;
                    need_reset = true;
                    let drained = draining_for.take().or_else(|| current.clone());
                    if let Some(task) = drained {
                        task.set_decoder_eof();
                        if task.is_media_end() {
                            mark_eof_frame(&task);
                        }
                    }
                }
                Err(e) => {
                    shared.set_error(format!("decoder failed: {e:#}"));
                    break 'outer;
                }
            }
        }

        // push packets
        if let Some(task) = &current {
            if !task.is_cancelled() && draining_for.is_none() {
                if let Some(pkt) = task.front_packet() {
                    match decoder.send_packet(&pkt) {
                        Ok(SendOutcome::Consumed) => {
                            task.pop_front_to_backup();
                            idle = false;
                        }
                        Ok(SendOutcome::Invalid) => {
                            task.pop_front_discard();
                            idle = false;
                        }
                        Ok(SendOutcome::Again) => {}
                        Err(e) => {
                            shared.set_error(format!("decoder failed: {e:#}"));
                            break 'outer;
                        }
                    }
                } else if task.is_demuxer_eof()
                    && (task.seek_pts().1 == i64::MAX || task.is_media_end())
                {
                    // last GOP of the stream: drain now, nothing follows
                    if let Err(e) = decoder.send_eof() {
                        shared.set_error(format!("decoder drain failed: {e:#}"));
                        break 'outer;
                    }
                    draining_for = Some(task.clone());
                    idle = false;
                }
            } else if task.is_cancelled() {
                need_reset = true;
            }
        }

        if idle {
            poll::idle_wait();
        }
    }
    debug!("decode worker leave");
}

/// Address a decoded frame into the task whose bracket contains its PTS.
fn dispatch_frame(
    shared: &Arc<Shared>,
    decoder: &VideoDecoder,
    frame: ffmpeg::util::frame::video::Video,
) -> Result<()> {
    let pts = frame.pts().unwrap_or(i64::MIN);
    let stream_end = shared.vinfo.start_pts + shared.vinfo.duration_pts;
    if pts < shared.vinfo.start_pts || (shared.vinfo.duration_pts > 0 && pts > stream_end) {
        warn!(pts, "frame outside the stream time range, discarded");
        return Ok(());
    }
    let tasks = shared.task_list.snapshot(WorkerClass::Decode);
    let target = tasks.iter().find(|t| {
        !t.is_cancelled() && {
            let (first, second) = t.seek_pts();
            pts >= first && pts < second
        }
    });
    let Some(task) = target else {
        // seek preroll or an evicted GOP
        return Ok(());
    };
    let vframe = decoder.wrap_frame(frame, &shared.time_base, shared.frame_interval_pts)?;
    vframe.mark_decode_started();
    if task.is_media_begin() && pts <= shared.vinfo.start_pts {
        vframe.set_start_frame(true);
    }
    task.push_decoded_frame(vframe);
    Ok(())
}

fn mark_eof_frame(task: &GopDecodeTask) {
    let finished = task.finished_frames();
    let decoded = task.decoded_frames();
    if let Some(last) = decoded.last().or_else(|| finished.last()) {
        last.set_eof_frame(true);
    }
}

// ---------------------------------------------------------------------------
// post-process worker

fn postprocess_worker(shared: Arc<Shared>) {
    debug!("postprocess worker enter");
    while !shared.prepared.load(Ordering::Acquire) && !shared.quit.load(Ordering::Acquire) {
        poll::idle_wait();
    }

    while !shared.quit.load(Ordering::Acquire) {
        let mut idle = true;
        let seeking_mode = shared.seek.lock().unwrap().seeking_mode;

        if !seeking_mode {
            evict_frames(&shared);
        }

        // evicting hardware references early keeps the decoder running
        // even when conversion lags behind
        if transfer_pass(&shared) {
            idle = false;
        }

        // convert the highest-priority pending frame
        let tasks = shared.task_list.snapshot(WorkerClass::PostProcess);
        if let Some(task) = find_next_postprocess_task(&tasks, &shared.priority()) {
            if let Some(frame) = task.decoded_frames().into_iter().next() {
                idle = false;
                match shared.convert_frame(&frame) {
                    Ok(_) => {
                        task.finish_frame(frame.clone());
                        if seeking_mode {
                            refresh_seeking_flash(&shared, &frame);
                        }
                    }
                    Err(e) => {
                        warn!(pts = frame.pts, %e, "conversion failed");
                        task.remove_frame(frame.pts);
                        if decoder_was_hw(&shared) {
                            // the source data is gone with the hardware
                            // frame; replay the whole GOP
                            task.request_redo();
                        }
                    }
                }
            }
        }

        if idle {
            poll::idle_wait();
        }
    }
    debug!("postprocess worker leave");
}

fn decoder_was_hw(shared: &Arc<Shared>) -> bool {
    shared.convert.dec_ctx_lock.lock().unwrap().is_engaged()
}

/// Move one hardware frame into host memory, releasing its device slot.
/// A failed transfer loses the frame data for good, so the whole GOP goes
/// back to the demuxer.
fn transfer_pass(shared: &Arc<Shared>) -> bool {
    let tasks = shared.task_list.snapshot(WorkerClass::PostProcess);
    for task in tasks.iter() {
        if task.is_cancelled() || task.redo_requested() {
            continue;
        }
        for frame in task.decoded_frames() {
            if !frame.is_hw() {
                continue;
            }
            let dec_lock = shared.convert.dec_ctx_lock.lock().unwrap().clone();
            if frame.transfer_to_software(&dec_lock, &shared.quit).is_err() {
                task.remove_frame(frame.pts);
                task.request_redo();
            }
            return true;
        }
    }
    false
}

/// Drop frames outside the cache range, keeping the boundary frame on the
/// far side of the read direction so a scrubbing client always has
/// something to show, and carry the start/eof markers over to the new
/// boundary frames.
fn evict_frames(shared: &Arc<Shared>) {
    let range = shared.cache_range();
    let forward = shared.forward.load(Ordering::Acquire);
    let frames = shared.finished_frames(WorkerClass::PostProcess);
    if frames.is_empty() {
        return;
    }

    let had_start = frames.first().map(|(_, f)| f.is_start_frame()).unwrap_or(false);
    let had_eof = frames.last().map(|(_, f)| f.is_eof_frame()).unwrap_or(false);

    let mut kept_low_boundary = false;
    let mut kept_high_boundary = false;
    let mut removed_any = false;
    for (task, frame) in &frames {
        let end = frame.pts + frame.dur.max(1);
        let mut remove = false;
        if end <= range.first {
            if forward {
                remove = true;
            } else if kept_low_boundary {
                remove = true;
            } else {
                kept_low_boundary = true;
            }
        } else if frame.pts > range.second {
            if !forward {
                remove = true;
            } else if kept_high_boundary {
                remove = true;
            } else {
                kept_high_boundary = true;
            }
        }
        if remove {
            task.remove_frame(frame.pts);
            removed_any = true;
        }
    }

    if removed_any {
        let frames = shared.finished_frames(WorkerClass::PostProcess);
        if had_start {
            if let Some((_, first)) = frames.first() {
                first.set_start_frame(true);
            }
        }
        if had_eof {
            if let Some((_, last)) = frames.last() {
                last.set_eof_frame(true);
            }
        }
    }
}

/// In seeking mode keep the most recent converted frame as the flash shown
/// during scrubs, with a tolerance so nearby seeks do not churn it.
fn refresh_seeking_flash(shared: &Arc<Shared>, frame: &Arc<VideoFrame>) {
    let mut flash = shared.seeking_flash.lock().unwrap();
    let refresh = match &*flash {
        None => true,
        Some(current) => {
            (frame.pos_ms - current.pos_ms).abs()
                >= shared.seeking_flash_refresh_ms.load(Ordering::Acquire)
        }
    };
    if refresh {
        debug!(pts = frame.pts, pos_ms = frame.pos_ms, "seeking flash updated");
        *flash = Some(frame.clone());
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use crate::mat::{ColorFormat, Mat, MatData};

    use super::*;

    fn frame(pts: i64, dur: i64) -> Arc<VideoFrame> {
        let mat = Mat {
            data: MatData::U8(Array3::zeros((2, 2, 3))),
            color_format: ColorFormat::Rgb,
            timestamp_ms: pts,
        };
        Arc::new(VideoFrame::from_mat(mat, pts, pts, dur))
    }

    fn entry(pts: i64, dur: i64) -> (TaskHandle, Arc<VideoFrame>) {
        let task = Arc::new(GopDecodeTask::new((pts, pts + dur)));
        (task, frame(pts, dur))
    }

    #[test]
    fn test_select_frame_containment() {
        let frames = vec![entry(0, 10), entry(10, 10), entry(20, 10)];
        assert_eq!(select_frame(&frames, 0).unwrap().pts, 0);
        assert_eq!(select_frame(&frames, 9).unwrap().pts, 0);
        assert_eq!(select_frame(&frames, 10).unwrap().pts, 10);
        assert_eq!(select_frame(&frames, 25).unwrap().pts, 20);
        assert_eq!(select_frame(&frames, 29).unwrap().pts, 20);
    }

    #[test]
    fn test_select_frame_past_end_requires_eof() {
        let frames = vec![entry(0, 10), entry(10, 10)];
        assert!(select_frame(&frames, 30).is_none());
        frames[1].1.set_eof_frame(true);
        assert_eq!(select_frame(&frames, 30).unwrap().pts, 10);
    }

    #[test]
    fn test_select_frame_before_start_requires_start_flag() {
        let frames = vec![entry(10, 10), entry(20, 10)];
        assert!(select_frame(&frames, 5).is_none());
        frames[0].1.set_start_frame(true);
        assert_eq!(select_frame(&frames, 5).unwrap().pts, 10);
    }

    #[test]
    fn test_select_frame_empty() {
        assert!(select_frame(&[], 0).is_none());
    }
}
