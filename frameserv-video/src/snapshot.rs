//! Fixed-cadence snapshot cache over a sliding view window.
//!
//! Viewers scrub a timeline; each one wants a uniformly-spaced row of
//! thumbnails ("snapshots") at a cadence independent of the source frame
//! rate. The generator aggregates every viewer's desired ranges into one
//! GOP-task list, decodes toward the best frame per snapshot index, and
//! serves progressively better results: overview preview, nearest decoded
//! neighbor, then the exact decoded snapshot.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
};

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use ffmpeg::Rational;
use frameserv_util::poll;
use image::{codecs::jpeg::JpegEncoder, ColorType};
use rayon::prelude::*;
use thread_local::ThreadLocal;
use tracing::{debug, instrument, warn};

use crate::{
    convert::FrameConverter,
    decode::{snapshot_index_for, ReceiveOutcome, SendOutcome, VideoDecoder},
    hwaccel::{CondMutex, HwDeviceKind},
    imgseq::FileDecoder,
    input::MediaInput,
    mat::{ColorFormat, InterpMode, Mat, MatData, MatDataType},
    parser::{ImageSequenceIterator, MediaParser, VideoStreamInfo},
    rotate::RotationFilter,
    sched::{
        find_next_decode_task, find_next_demux_task, SnapshotPriority, TaskList, WorkerClass,
    },
    seek_points::SeekPointTable,
    task::{GopDecodeTask, TaskHandle},
    timebase::TimeBase,
    window::{dedupe_ranges, aggregate_index_ranges, dist_to_nearest_in_view, SnapWindow, TaskRange},
};

const MAX_PENDING_DECODE_TASKS: usize = 8;

/// Source of coarser, already-available previews (e.g. a whole-file
/// overview pass) used before the exact snapshot is decoded.
pub trait OverviewProvider: Send + Sync {
    fn preview_at(&self, pos_ms: i64) -> Option<Arc<Mat>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotQuality {
    /// The best-bias decoded frame for this index.
    Decoded,
    /// Borrowed from the overview provider.
    Overview,
    /// Nearest decoded snapshot of the same task.
    Neighbor,
    Missing,
}

#[derive(Clone)]
pub struct Snapshot {
    pub index: i32,
    pub timestamp_ms: i64,
    pub mat: Option<Arc<Mat>>,
    pub quality: SnapshotQuality,
}

/// JPEG/base64 transport encoding for UI layers.
pub fn mat_to_jpeg_base64(mat: &Mat, quality: u8) -> Result<String> {
    let data = match &mat.data {
        MatData::U8(a) => a,
        MatData::F32(_) => bail!("jpeg preview needs a u8 matrix"),
    };
    let (h, w, c) = data.dim();
    let slice = data
        .as_slice()
        .ok_or_else(|| anyhow!("matrix is not contiguous"))?;
    let rgb: Vec<u8> = match c {
        3 => slice.to_vec(),
        4 => slice
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect(),
        1 => slice.iter().flat_map(|&v| [v, v, v]).collect(),
        _ => bail!("unsupported channel count {c}"),
    };
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode(&rgb, w as u32, h as u32, ColorType::Rgb8)
        .context("jpeg encode failed")?;
    Ok(base64::engine::general_purpose::STANDARD.encode(buf))
}

#[derive(Debug, Clone, Copy)]
struct WindowVars {
    wnd_size_secs: f64,
    ss_interval_ms: f64,
    ss_interval_pts: f64,
    max_index: i32,
    prev_wnd_cache: i32,
    max_cache: i32,
}

impl WindowVars {
    fn compute(
        wnd_size_secs: f64,
        wnd_frame_count: u32,
        cache_factor: f64,
        duration_ms: i64,
        time_base: &TimeBase,
    ) -> WindowVars {
        let wnd_frame_count = wnd_frame_count.max(1);
        let ss_interval_ms = (wnd_size_secs * 1000.0 / wnd_frame_count as f64).max(1.0);
        let pts_per_ms =
            time_base.den as f64 / (time_base.num as f64 * 1000.0);
        let ss_interval_pts = ss_interval_ms * pts_per_ms;
        let max_index = ((duration_ms as f64 / ss_interval_ms).floor() as i32).max(0);
        let max_cache = (wnd_frame_count as f64 * cache_factor).ceil() as i32;
        let prev_wnd_cache = (max_cache - wnd_frame_count as i32) / 2;
        WindowVars {
            wnd_size_secs,
            ss_interval_ms,
            ss_interval_pts,
            max_index,
            prev_wnd_cache,
            max_cache,
        }
    }

    fn index_for_secs(&self, secs: f64) -> i32 {
        (secs * 1000.0 / self.ss_interval_ms).floor() as i32
    }

    fn ideal_rel_pts(&self, index: i32) -> i64 {
        (index as f64 * self.ss_interval_pts).floor() as i64
    }
}

struct SnapPicture {
    mat: Arc<Mat>,
    bias: i64,
}

struct ViewerState {
    id: u64,
    wnd: Mutex<Option<SnapWindow>>,
    range_changed: AtomicBool,
}

struct ConvertCtx {
    converter: Mutex<FrameConverter>,
    rotation: i32,
    rotate: Mutex<Option<RotationFilter>>,
    dec_ctx_lock: Mutex<Arc<CondMutex>>,
}

struct SnapShared {
    vinfo: VideoStreamInfo,
    time_base: TimeBase,
    frame_interval_pts: i64,
    seek_points: SeekPointTable,
    task_list: TaskList,

    quit: AtomicBool,
    prepared: AtomicBool,
    err_msg: Mutex<Option<String>>,

    vars: Mutex<WindowVars>,
    refresh: AtomicBool,
    viewers: Mutex<Vec<Arc<ViewerState>>>,
    next_viewer_id: AtomicU64,

    /// Best decoded matrix per snapshot index.
    store: Mutex<BTreeMap<i32, SnapPicture>>,
    overview: Mutex<Option<Arc<dyn OverviewProvider>>>,

    convert: ConvertCtx,
}

impl SnapShared {
    fn set_error(&self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::error!("{msg}");
        *self.err_msg.lock().unwrap() = Some(msg);
    }

    fn vars(&self) -> WindowVars {
        *self.vars.lock().unwrap()
    }

    /// Seek-point bracket for the GOP that should contain snapshot `index`,
    /// snapping forward onto a keyframe within half a frame interval.
    fn seek_pos_for_index(&self, index: i32, vars: &WindowVars) -> (i64, i64) {
        let target = vars.ideal_rel_pts(index.max(0)) + self.vinfo.start_pts;
        self.seek_points
            .bracket_with_tolerance(target, self.frame_interval_pts / 2)
    }

    fn create_snap_window(&self, wnd_pos: f64) -> SnapWindow {
        let vars = self.vars();
        let index0 = vars.index_for_secs(wnd_pos);
        let index1 = vars.index_for_secs(wnd_pos + vars.wnd_size_secs);
        let cache_idx0 = index0 - vars.prev_wnd_cache;
        let cache_idx1 = cache_idx0 + vars.max_cache - 1;
        let seek_pos00 = self.seek_pos_for_index(cache_idx0.max(0), &vars).0;
        let seek_pos10 = self
            .seek_pos_for_index(cache_idx1.min(vars.max_index), &vars)
            .0;
        SnapWindow {
            wnd_pos,
            view_idx: (index0, index1),
            cache_idx: (cache_idx0, cache_idx1),
            seek_pos00,
            seek_pos10,
        }
    }

    /// Half-open snapshot index pair covered by a GOP bracket.
    fn ss_index_pair(&self, bracket: (i64, i64), start_idx: i32, vars: &WindowVars) -> (i32, i32) {
        let half = self.frame_interval_pts as f64 / 2.0;
        let rel0 = (bracket.0 - self.vinfo.start_pts) as f64 - half;
        let mut idx0 = (rel0 / vars.ss_interval_pts).ceil() as i32;
        if idx0 > start_idx {
            idx0 = start_idx;
        }
        let idx1 = if bracket.1 == i64::MAX {
            vars.max_index + 1
        } else {
            let rel1 = (bracket.1 - self.vinfo.start_pts) as f64 - half;
            (rel1 / vars.ss_interval_pts).ceil() as i32
        };
        let idx1 = if idx1 == idx0 { idx0 + 1 } else { idx1 };
        (idx0, idx1)
    }

    /// GOP-aligned desired ranges for one viewer window.
    fn viewer_task_ranges(&self, wnd: &SnapWindow, vars: &WindowVars) -> Vec<TaskRange> {
        let mut ranges = Vec::new();
        let mut idx = wnd.cache_idx.0.clamp(0, vars.max_index);
        let (mut first, mut second) = self.seek_pos_for_index(idx, vars);
        loop {
            let ss_pair = self.ss_index_pair((first, second), idx, vars);
            let in_view = ss_pair.0 <= wnd.view_idx.1 && ss_pair.1 > wnd.view_idx.0;
            ranges.push(TaskRange::new((first, second), ss_pair, in_view));
            if second == i64::MAX || ss_pair.1 > wnd.cache_idx.1 || ss_pair.1 > vars.max_index {
                break;
            }
            idx = ss_pair.1;
            let next = self.seek_points.bracket(second);
            first = next.0;
            second = next.1;
        }
        ranges
    }

    fn convert_frame(&self, frame: &crate::frame::VideoFrame) -> Result<Arc<Mat>> {
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

    fn snapshot_timestamp_ms(&self, index: i32, vars: &WindowVars) -> i64 {
        self.time_base
            .pts_to_millis(vars.ideal_rel_pts(index) + self.vinfo.start_pts)
    }
}

pub struct SnapshotGenerator {
    parser: Arc<MediaParser>,
    shared: Option<Arc<SnapShared>>,
    threads: Vec<JoinHandle<()>>,
    started: bool,

    wnd_size_secs: f64,
    wnd_frame_count: u32,
    cache_factor: f64,
    out_size: Option<(u32, u32)>,
    color_format: ColorFormat,
    data_type: MatDataType,
    interp: InterpMode,
    hw_kind: Option<HwDeviceKind>,
}

impl SnapshotGenerator {
    #[instrument(err)]
    pub fn open<P: AsRef<std::path::Path> + std::fmt::Debug>(path: P) -> Result<SnapshotGenerator> {
        let parser = MediaParser::open(path)?;
        SnapshotGenerator::open_with_parser(parser)
    }

    pub fn open_with_parser(parser: Arc<MediaParser>) -> Result<SnapshotGenerator> {
        parser.video_info()?;
        if let Err(e) = parser.enable_parse_info() {
            warn!(%e, "seek point parsing unavailable");
        }
        Ok(SnapshotGenerator {
            parser,
            shared: None,
            threads: Vec::new(),
            started: false,
            wnd_size_secs: 10.0,
            wnd_frame_count: 20,
            cache_factor: 2.0,
            out_size: Some((160, 90)),
            color_format: ColorFormat::default(),
            data_type: MatDataType::U8,
            interp: InterpMode::Area,
            hw_kind: Some(HwDeviceKind::Auto),
        })
    }

    pub fn configure_snapshots(
        &mut self,
        out_width: u32,
        out_height: u32,
        color_format: ColorFormat,
        data_type: MatDataType,
        interp: InterpMode,
        hw_kind: Option<HwDeviceKind>,
    ) -> Result<()> {
        if self.started {
            bail!("cannot configure an already started generator");
        }
        self.out_size = Some((out_width, out_height));
        self.color_format = color_format;
        self.data_type = data_type;
        self.interp = interp;
        self.hw_kind = hw_kind;
        Ok(())
    }

    /// Window size (seconds) and snapshot count inside it. Triggers a full
    /// task rebuild on the next pipeline pass when running.
    pub fn set_snapshot_window(&mut self, wnd_size_secs: f64, frame_count: u32) -> Result<()> {
        if wnd_size_secs <= 0.0 || frame_count == 0 {
            bail!("invalid snapshot window");
        }
        self.wnd_size_secs = wnd_size_secs;
        self.wnd_frame_count = frame_count;
        self.apply_window_config();
        Ok(())
    }

    pub fn set_cache_factor(&mut self, cache_factor: f64) -> Result<()> {
        if cache_factor < 1.0 {
            bail!("cache factor must be at least 1");
        }
        self.cache_factor = cache_factor;
        self.apply_window_config();
        Ok(())
    }

    fn apply_window_config(&self) {
        if let Some(shared) = &self.shared {
            let vars = WindowVars::compute(
                self.wnd_size_secs,
                self.wnd_frame_count,
                self.cache_factor,
                shared.vinfo.duration_ms,
                &shared.time_base,
            );
            *shared.vars.lock().unwrap() = vars;
            shared.refresh.store(true, Ordering::Release);
        }
    }

    pub fn set_overview_provider(&self, provider: Arc<dyn OverviewProvider>) {
        if let Some(shared) = &self.shared {
            *shared.overview.lock().unwrap() = Some(provider);
        }
    }

    pub fn get_error(&self) -> Option<String> {
        self.shared
            .as_ref()
            .and_then(|s| s.err_msg.lock().unwrap().clone())
    }

    #[instrument(skip(self), err)]
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        let vinfo = self.parser.video_info()?.clone();
        let time_base = vinfo.time_base;
        let frame_interval_pts = time_base.frame_interval_pts(vinfo.frame_rate);
        let seek_points = self.parser.seek_points();
        if seek_points.is_empty() {
            seek_points.insert_observed(vinfo.start_pts);
        }

        let mut converter = FrameConverter::new();
        if let Some((w, h)) = self.out_size {
            converter.set_out_size(w, h);
        }
        converter.set_out_color_format(self.color_format);
        converter.set_out_data_type(self.data_type);
        converter.set_resize_interpolate_mode(self.interp);

        let input = MediaInput::open(&self.parser.info().url)?;
        let mut decoder = VideoDecoder::open(input.parameters(), self.hw_kind)?;
        decoder.hw_frame_eviction = crate::decode::HwFrameEviction::Deferred;
        let dec_ctx_lock = decoder.ctx_lock();

        let vars = WindowVars::compute(
            self.wnd_size_secs,
            self.wnd_frame_count,
            self.cache_factor,
            vinfo.duration_ms,
            &time_base,
        );

        let shared = Arc::new(SnapShared {
            vinfo,
            time_base,
            frame_interval_pts,
            seek_points,
            task_list: TaskList::new(),
            quit: AtomicBool::new(false),
            prepared: AtomicBool::new(false),
            err_msg: Mutex::new(None),
            vars: Mutex::new(vars),
            refresh: AtomicBool::new(false),
            viewers: Mutex::new(Vec::new()),
            next_viewer_id: AtomicU64::new(0),
            store: Mutex::new(BTreeMap::new()),
            overview: Mutex::new(None),
            convert: ConvertCtx {
                converter: Mutex::new(converter),
                rotation: self.parser.video_info()?.rotation,
                rotate: Mutex::new(None),
                dec_ctx_lock: Mutex::new(dec_ctx_lock),
            },
        });

        let demux_shared = shared.clone();
        let decode_shared = shared.clone();
        let update_shared = shared.clone();
        self.threads = vec![
            std::thread::Builder::new()
                .name("snap-demux".into())
                .spawn(move || demux_worker(demux_shared, input))?,
            std::thread::Builder::new()
                .name("snap-decode".into())
                .spawn(move || decode_worker(decode_shared, decoder))?,
            std::thread::Builder::new()
                .name("snap-update".into())
                .spawn(move || mat_update_worker(update_shared))?,
        ];
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
    }

    pub fn create_viewer(&self) -> Result<SnapshotViewer> {
        let shared = self
            .shared
            .clone()
            .filter(|_| self.started)
            .ok_or_else(|| anyhow!("generator is not started"))?;
        let state = Arc::new(ViewerState {
            id: shared.next_viewer_id.fetch_add(1, Ordering::AcqRel),
            wnd: Mutex::new(None),
            range_changed: AtomicBool::new(false),
        });
        shared.viewers.lock().unwrap().push(state.clone());
        shared.refresh.store(true, Ordering::Release);
        Ok(SnapshotViewer { shared, state })
    }
}

impl Drop for SnapshotGenerator {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

pub struct SnapshotViewer {
    shared: Arc<SnapShared>,
    state: Arc<ViewerState>,
}

impl SnapshotViewer {
    /// Move the view window and return the best snapshot currently
    /// available for each visible index.
    pub fn get_snapshots(&self, wnd_pos: f64) -> Result<Vec<Snapshot>> {
        let wnd = self.update_window(wnd_pos);
        let vars = self.shared.vars();
        let lo = wnd.view_idx.0.clamp(0, vars.max_index);
        let hi = wnd.view_idx.1.clamp(0, vars.max_index);
        let store = self.shared.store.lock().unwrap();
        let overview = self.shared.overview.lock().unwrap().clone();
        let tasks = self.shared.task_list.snapshot(WorkerClass::PostProcess);
        let mut out = Vec::with_capacity((hi - lo + 1).max(0) as usize);
        for index in lo..=hi {
            let timestamp_ms = self.shared.snapshot_timestamp_ms(index, &vars);
            let snapshot = if let Some(pic) = store.get(&index) {
                Snapshot {
                    index,
                    timestamp_ms,
                    mat: Some(pic.mat.clone()),
                    quality: SnapshotQuality::Decoded,
                }
            } else if let Some(mat) =
                overview.as_ref().and_then(|p| p.preview_at(timestamp_ms))
            {
                Snapshot {
                    index,
                    timestamp_ms,
                    mat: Some(mat),
                    quality: SnapshotQuality::Overview,
                }
            } else if let Some(mat) = nearest_in_task(&tasks, &store, index) {
                Snapshot {
                    index,
                    timestamp_ms,
                    mat: Some(mat),
                    quality: SnapshotQuality::Neighbor,
                }
            } else {
                Snapshot {
                    index,
                    timestamp_ms,
                    mat: None,
                    quality: SnapshotQuality::Missing,
                }
            };
            out.push(snapshot);
        }
        Ok(out)
    }

    /// Like `get_snapshots` but blocks until every visible index has its
    /// decoded snapshot.
    pub fn get_snapshots_wait(&self, wnd_pos: f64) -> Result<Vec<Snapshot>> {
        loop {
            let snapshots = self.get_snapshots(wnd_pos)?;
            if snapshots
                .iter()
                .all(|s| s.quality == SnapshotQuality::Decoded)
            {
                return Ok(snapshots);
            }
            if self.shared.quit.load(Ordering::Acquire) {
                bail!("generator is shutting down");
            }
            if let Some(msg) = self.shared.err_msg.lock().unwrap().clone() {
                bail!("snapshot pipeline failed: {msg}");
            }
            poll::idle_wait();
        }
    }

    /// The view state derived from the last `get_snapshots` position.
    pub fn current_window(&self) -> Option<SnapWindow> {
        *self.state.wnd.lock().unwrap()
    }

    fn update_window(&self, wnd_pos: f64) -> SnapWindow {
        let wnd = self.shared.create_snap_window(wnd_pos);
        let mut guard = self.state.wnd.lock().unwrap();
        let changed = guard
            .map(|old| old.task_range_changed(&wnd))
            .unwrap_or(true);
        *guard = Some(wnd);
        if changed {
            self.state.range_changed.store(true, Ordering::Release);
        }
        wnd
    }
}

impl Drop for SnapshotViewer {
    fn drop(&mut self) {
        let mut viewers = self.shared.viewers.lock().unwrap();
        viewers.retain(|v| v.id != self.state.id);
        self.shared.refresh.store(true, Ordering::Release);
    }
}

fn nearest_in_task(
    tasks: &[TaskHandle],
    store: &BTreeMap<i32, SnapPicture>,
    index: i32,
) -> Option<Arc<Mat>> {
    let task = tasks
        .iter()
        .find(|t| !t.is_cancelled() && t.contains_candidate(index))?;
    let (lo, hi) = task.ss_idx;
    store
        .range(lo..hi)
        .min_by_key(|(i, _)| (**i - index).abs())
        .map(|(_, pic)| pic.mat.clone())
}

// ---------------------------------------------------------------------------
// task-list maintenance

fn update_task_list(shared: &Arc<SnapShared>) {
    let refresh = shared.refresh.swap(false, Ordering::AcqRel);
    let viewers: Vec<Arc<ViewerState>> = shared.viewers.lock().unwrap().clone();
    if refresh {
        for task in shared.task_list.snapshot(WorkerClass::Demux).iter() {
            task.cancel();
        }
        shared.task_list.publish(Vec::new());
        for viewer in &viewers {
            viewer.range_changed.store(true, Ordering::Release);
        }
    }
    let any_changed = viewers
        .iter()
        .any(|v| v.range_changed.load(Ordering::Acquire));
    if !any_changed {
        return;
    }

    let vars = shared.vars();
    let mut ranges = Vec::new();
    for viewer in &viewers {
        viewer.range_changed.store(false, Ordering::Release);
        if let Some(wnd) = *viewer.wnd.lock().unwrap() {
            ranges.extend(shared.viewer_task_ranges(&wnd, &vars));
        }
    }
    let mut total = dedupe_ranges(ranges);
    let dist_source = total.clone();
    for range in &mut total {
        if !range.in_view {
            range.dist_to_view = dist_to_nearest_in_view(range.ss_idx.0, &dist_source);
        }
    }
    debug!(ranges = ?total.iter().map(|r| r.ss_idx).collect::<Vec<_>>(), "aggregated task ranges");

    let existing = shared.task_list.snapshot(WorkerClass::Demux);
    let mut new_list: Vec<TaskHandle> = Vec::with_capacity(total.len());
    for range in &total {
        match existing
            .iter()
            .find(|t| !t.is_cancelled() && t.seek_pts().0 == range.seek_pts.0)
        {
            Some(task) => {
                task.set_in_view(range.in_view);
                task.set_dist_to_view(range.dist_to_view);
                new_list.push(task.clone());
            }
            None => new_list.push(Arc::new(GopDecodeTask::new_snapshot(
                range.seek_pts,
                range.ss_idx,
                range.in_view,
                range.dist_to_view,
                vars.max_index,
            ))),
        }
    }
    for task in existing.iter() {
        if !new_list.iter().any(|t| Arc::ptr_eq(t, task)) {
            task.cancel();
        }
    }
    shared.task_list.publish(new_list);

    // forget pictures no index still wants
    let keep_lo = total.iter().map(|r| r.ss_idx.0).min().unwrap_or(0);
    let keep_hi = total.iter().map(|r| r.ss_idx.1).max().unwrap_or(0);
    shared
        .store
        .lock()
        .unwrap()
        .retain(|&i, _| i >= keep_lo && i < keep_hi);
}

// ---------------------------------------------------------------------------
// workers

fn demux_worker(shared: Arc<SnapShared>, mut input: MediaInput) {
    debug!("snapshot demux enter");
    shared.prepared.store(true, Ordering::Release);
    let mut current: Option<TaskHandle> = None;
    let mut last_task_end = i64::MIN;
    // EOF before the first packet makes a task invalid
    let mut pushed_any = false;

    while !shared.quit.load(Ordering::Acquire) {
        let mut idle = true;
        update_task_list(&shared);

        if current
            .as_ref()
            .map(|t| t.is_cancelled() || t.is_demuxer_eof())
            .unwrap_or(true)
        {
            if let Some(task) = &current {
                last_task_end = task.seek_pts().1;
            }
            let tasks = shared.task_list.snapshot(WorkerClass::Demux);
            if let Some(task) = find_next_demux_task(
                &tasks,
                &SnapshotPriority,
                Some(MAX_PENDING_DECODE_TASKS),
            ) {
                task.begin_demuxing();
                pushed_any = false;
                let start = task.seek_pts().0;
                if start != last_task_end {
                    if let Err(e) = input.seek_to_pts(start.max(shared.vinfo.start_pts)) {
                        shared.set_error(format!("snapshot demux seek failed: {e:#}"));
                        break;
                    }
                }
                if start <= shared.vinfo.start_pts {
                    task.set_media_begin();
                }
                debug!(seek_pts = ?task.seek_pts(), ss_idx = ?task.ss_idx, "snapshot demux task changed");
                current = Some(task);
                idle = false;
            }
        }

        if let Some(task) = &current {
            if !task.is_demuxer_eof() {
                if task.all_candidates_decoded() {
                    // the decoder got everything it wanted already
                    task.set_demuxer_eof();
                } else {
                    match input.read_packet() {
                        Ok(Some(pkt)) => {
                            let pts = pkt.pts().unwrap_or(i64::MIN);
                            if pkt.is_key() && pts != i64::MIN {
                                shared.seek_points.insert_observed(pts);
                            }
                            if pts >= task.seek_pts().1 {
                                task.set_demuxer_eof();
                            } else {
                                task.push_packet(pkt);
                                pushed_any = true;
                            }
                            idle = false;
                        }
                        Ok(None) => {
                            task.set_media_end();
                            task.set_demuxer_eof();
                            if !pushed_any {
                                task.cancel();
                            }
                            let tasks = shared.task_list.snapshot(WorkerClass::Demux);
                            crate::sched::cancel_tasks_past_eof(&tasks, task);
                            last_task_end = i64::MIN;
                            idle = false;
                        }
                        Err(e) => {
                            warn!(%e, "snapshot packet read failed");
                        }
                    }
                }
            }
        }

        if idle {
            poll::idle_wait();
        }
    }
    debug!("snapshot demux leave");
}

fn decode_worker(shared: Arc<SnapShared>, mut decoder: VideoDecoder) {
    debug!("snapshot decode enter");
    while !shared.prepared.load(Ordering::Acquire) && !shared.quit.load(Ordering::Acquire) {
        poll::idle_wait();
    }
    let mut current: Option<TaskHandle> = None;
    let mut need_reset = false;
    let mut draining_for: Option<TaskHandle> = None;

    'outer: while !shared.quit.load(Ordering::Acquire) {
        let mut idle = true;

        let input_done = current
            .as_ref()
            .map(|t| {
                t.is_cancelled()
                    || t.is_decoder_eof()
                    || t.all_candidates_decoded()
                    || (t.packet_queue_len() == 0
                        && t.is_demuxer_eof()
                        && !draining_for.as_ref().map(|d| Arc::ptr_eq(d, t)).unwrap_or(false))
            })
            .unwrap_or(true);
        if input_done {
            let old = current.take();
            let tasks = shared.task_list.snapshot(WorkerClass::Decode);
            let next = find_next_decode_task(&tasks, &SnapshotPriority);
            if let Some(task) = &next {
                if task.redo_requested() {
                    task.prepare_redo();
                    need_reset = true;
                }
                if !task.begin_decoding() {
                    poll::idle_wait();
                    continue;
                }
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
                    if let Err(e) = decoder.send_eof() {
                        shared.set_error(format!("snapshot decoder drain failed: {e:#}"));
                        break 'outer;
                    }
                    draining_for = Some(old_task.clone());
                }
                if old_task.is_decoder_eof() && !old_task.all_candidates_decoded() {
                    // those candidates will never arrive
                    old_task.resolve_missing_candidates();
                }
            }
            current = next;
        }

        if need_reset {
            decoder.flush();
            need_reset = false;
            draining_for = None;
        }

        if !decoder.hw_backlog_full() {
            match decoder.receive_frame() {
                Ok(ReceiveOutcome::Frame(frame)) => {
                    idle = false;
                    if let Err(e) = dispatch_snapshot_frame(&shared, &decoder, frame) {
                        warn!(%e, "snapshot dispatch failed");
                    }
                }
                Ok(ReceiveOutcome::Again) => {}
                Ok(ReceiveOutcome::Eof) => {
                    idle = false;
                    need_reset = true;
                    let drained = draining_for.take().or_else(|| current.clone());
                    if let Some(task) = drained {
                        task.set_decoder_eof();
                        if !task.all_candidates_decoded() {
                            task.resolve_missing_candidates();
                        }
                    }
                }
                Err(e) => {
                    shared.set_error(format!("snapshot decoder failed: {e:#}"));
                    break 'outer;
                }
            }
        }

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
                            shared.set_error(format!("snapshot decoder failed: {e:#}"));
                            break 'outer;
                        }
                    }
                } else if task.is_demuxer_eof() && task.is_media_end() {
                    if let Err(e) = decoder.send_eof() {
                        shared.set_error(format!("snapshot decoder drain failed: {e:#}"));
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
    debug!("snapshot decode leave");
}

/// Route a decoded frame to the snapshot index it approximates best.
fn dispatch_snapshot_frame(
    shared: &Arc<SnapShared>,
    decoder: &VideoDecoder,
    frame: ffmpeg::util::frame::video::Video,
) -> Result<()> {
    let pts = frame.pts().unwrap_or(i64::MIN);
    if pts == i64::MIN {
        return Ok(());
    }
    let vars = shared.vars();
    let rel = pts - shared.vinfo.start_pts;
    let (ss_idx, bias) = snapshot_index_for(rel, vars.ss_interval_pts.max(1.0));

    let tasks = shared.task_list.snapshot(WorkerClass::Decode);
    let mut adopted = false;
    for task in tasks.iter() {
        if task.is_cancelled() || !task.contains_candidate(ss_idx) {
            continue;
        }
        if task.offer_candidate(ss_idx, pts, bias) {
            let vframe =
                decoder.wrap_frame(frame.clone(), &shared.time_base, shared.frame_interval_pts)?;
            vframe.mark_decode_started();
            if task.push_decoded_frame(vframe) {
                task.mark_candidate_enqueued(ss_idx);
                adopted = true;
            }
        }
    }
    if !adopted {
        // either no task wants this index or a better-biased frame exists
        debug!(pts, ss_idx, bias, "snapshot frame not adopted");
    }
    Ok(())
}

/// The "mat-updater": converts decoded candidate frames and publishes them
/// into the per-index picture store.
fn mat_update_worker(shared: Arc<SnapShared>) {
    debug!("snapshot update enter");
    while !shared.prepared.load(Ordering::Acquire) && !shared.quit.load(Ordering::Acquire) {
        poll::idle_wait();
    }
    while !shared.quit.load(Ordering::Acquire) {
        let mut idle = true;
        let tasks = shared.task_list.snapshot(WorkerClass::PostProcess);
        let next = tasks.iter().find(|t| {
            !t.is_cancelled() && !t.redo_requested() && t.decoded_frame_count() > 0
        });
        if let Some(task) = next {
            for frame in task.decoded_frames() {
                idle = false;
                // the candidate entry recorded at decode time knows which
                // index this frame serves and how good the match is
                let adopted = task
                    .candidates()
                    .into_iter()
                    .find(|(_, cand)| cand.pts == frame.pts);
                let (ss_idx, bias) = match adopted {
                    Some((idx, cand)) => (idx, cand.bias),
                    None => {
                        let vars = shared.vars();
                        let rel = frame.pts - shared.vinfo.start_pts;
                        snapshot_index_for(rel, vars.ss_interval_pts.max(1.0))
                    }
                };
                match shared.convert_frame(&frame) {
                    Ok(mat) => {
                        let mut store = shared.store.lock().unwrap();
                        let better = store
                            .get(&ss_idx)
                            .map(|pic| bias < pic.bias)
                            .unwrap_or(true);
                        if better {
                            store.insert(ss_idx, SnapPicture { mat, bias });
                        }
                        drop(store);
                        task.remove_frame(frame.pts);
                    }
                    Err(e) => {
                        warn!(pts = frame.pts, %e, "snapshot conversion failed");
                        task.remove_frame(frame.pts);
                        if shared.convert.dec_ctx_lock.lock().unwrap().is_engaged() {
                            task.request_redo();
                        }
                        break;
                    }
                }
            }
        }
        if idle {
            poll::idle_wait();
        }
    }
    debug!("snapshot update leave");
}

// ---------------------------------------------------------------------------
// image-sequence snapshots

/// Snapshot generator over an image sequence: no demuxing, every snapshot
/// index maps to one file, and a rayon pool with per-thread decoders fills
/// the store, visible ranges first.
pub struct ImageSequenceSnapshotGenerator {
    files: ImageSequenceIterator,
    frame_rate: f64,
    shared: Option<Arc<ImgSnapShared>>,
    worker: Option<JoinHandle<()>>,
    started: bool,

    wnd_size_secs: f64,
    wnd_frame_count: u32,
    cache_factor: f64,
    out_size: Option<(u32, u32)>,
    color_format: ColorFormat,
    data_type: MatDataType,
    interp: InterpMode,
}

struct ImgSnapShared {
    files: ImageSequenceIterator,
    frame_rate: f64,
    quit: AtomicBool,
    vars: Mutex<WindowVars>,
    refresh: AtomicBool,
    viewers: Mutex<Vec<Arc<ViewerState>>>,
    next_viewer_id: AtomicU64,
    store: Mutex<BTreeMap<i32, SnapPicture>>,
    converter_settings: (Option<(u32, u32)>, ColorFormat, MatDataType, InterpMode),
}

impl ImgSnapShared {
    fn file_index_for_snapshot(&self, ss_idx: i32, vars: &WindowVars) -> usize {
        let ms = ss_idx as f64 * vars.ss_interval_ms;
        ((ms * self.frame_rate / 1000.0).round() as usize).min(self.files.len() - 1)
    }

    fn create_snap_window(&self, wnd_pos: f64) -> SnapWindow {
        let vars = *self.vars.lock().unwrap();
        let index0 = vars.index_for_secs(wnd_pos);
        let index1 = vars.index_for_secs(wnd_pos + vars.wnd_size_secs);
        let cache_idx0 = (index0 - vars.prev_wnd_cache).clamp(0, vars.max_index);
        let cache_idx1 = (cache_idx0 + vars.max_cache - 1).clamp(0, vars.max_index);
        SnapWindow {
            wnd_pos,
            view_idx: (index0, index1),
            cache_idx: (cache_idx0, cache_idx1),
            seek_pos00: 0,
            seek_pos10: 0,
        }
    }
}

impl ImageSequenceSnapshotGenerator {
    pub fn open(files: ImageSequenceIterator, frame_rate: f64) -> Result<ImageSequenceSnapshotGenerator> {
        if files.is_empty() {
            bail!("image sequence is empty");
        }
        if frame_rate <= 0.0 {
            bail!("frame rate must be positive");
        }
        Ok(ImageSequenceSnapshotGenerator {
            files,
            frame_rate,
            shared: None,
            worker: None,
            started: false,
            wnd_size_secs: 10.0,
            wnd_frame_count: 20,
            cache_factor: 2.0,
            out_size: Some((160, 90)),
            color_format: ColorFormat::default(),
            data_type: MatDataType::U8,
            interp: InterpMode::Area,
        })
    }

    pub fn set_snapshot_window(&mut self, wnd_size_secs: f64, frame_count: u32) -> Result<()> {
        if wnd_size_secs <= 0.0 || frame_count == 0 {
            bail!("invalid snapshot window");
        }
        self.wnd_size_secs = wnd_size_secs;
        self.wnd_frame_count = frame_count;
        if let Some(shared) = &self.shared {
            let duration_ms = self.duration_ms();
            let tb = TimeBase { num: 1, den: 1000, start_pts: 0 };
            *shared.vars.lock().unwrap() = WindowVars::compute(
                wnd_size_secs,
                frame_count,
                self.cache_factor,
                duration_ms,
                &tb,
            );
            shared.refresh.store(true, Ordering::Release);
        }
        Ok(())
    }

    pub fn duration_ms(&self) -> i64 {
        (self.files.len() as f64 * 1000.0 / self.frame_rate).round() as i64
    }

    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        let tb = TimeBase { num: 1, den: 1000, start_pts: 0 };
        let vars = WindowVars::compute(
            self.wnd_size_secs,
            self.wnd_frame_count,
            self.cache_factor,
            self.duration_ms(),
            &tb,
        );
        let shared = Arc::new(ImgSnapShared {
            files: self.files.clone(),
            frame_rate: self.frame_rate,
            quit: AtomicBool::new(false),
            vars: Mutex::new(vars),
            refresh: AtomicBool::new(true),
            viewers: Mutex::new(Vec::new()),
            next_viewer_id: AtomicU64::new(0),
            store: Mutex::new(BTreeMap::new()),
            converter_settings: (self.out_size, self.color_format, self.data_type, self.interp),
        });
        let worker_shared = shared.clone();
        self.worker = Some(
            std::thread::Builder::new()
                .name("imgseq-snap".into())
                .spawn(move || image_snapshot_worker(worker_shared))?,
        );
        self.shared = Some(shared);
        self.started = true;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if let Some(shared) = &self.shared {
            shared.quit.store(true, Ordering::Release);
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        self.started = false;
        Ok(())
    }

    pub fn create_viewer(&self) -> Result<ImageSequenceSnapshotViewer> {
        let shared = self
            .shared
            .clone()
            .filter(|_| self.started)
            .ok_or_else(|| anyhow!("generator is not started"))?;
        let state = Arc::new(ViewerState {
            id: shared.next_viewer_id.fetch_add(1, Ordering::AcqRel),
            wnd: Mutex::new(None),
            range_changed: AtomicBool::new(false),
        });
        shared.viewers.lock().unwrap().push(state.clone());
        Ok(ImageSequenceSnapshotViewer { shared, state })
    }
}

impl Drop for ImageSequenceSnapshotGenerator {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

pub struct ImageSequenceSnapshotViewer {
    shared: Arc<ImgSnapShared>,
    state: Arc<ViewerState>,
}

impl ImageSequenceSnapshotViewer {
    pub fn get_snapshots(&self, wnd_pos: f64) -> Result<Vec<Snapshot>> {
        let wnd = self.shared.create_snap_window(wnd_pos);
        {
            let mut guard = self.state.wnd.lock().unwrap();
            let changed = guard.map(|old| old.task_range_changed(&wnd)).unwrap_or(true);
            *guard = Some(wnd);
            if changed {
                self.state.range_changed.store(true, Ordering::Release);
            }
        }
        let vars = *self.shared.vars.lock().unwrap();
        let lo = wnd.view_idx.0.clamp(0, vars.max_index);
        let hi = wnd.view_idx.1.clamp(0, vars.max_index);
        let store = self.shared.store.lock().unwrap();
        let mut out = Vec::new();
        for index in lo..=hi {
            let timestamp_ms = (index as f64 * vars.ss_interval_ms).round() as i64;
            out.push(match store.get(&index) {
                Some(pic) => Snapshot {
                    index,
                    timestamp_ms,
                    mat: Some(pic.mat.clone()),
                    quality: SnapshotQuality::Decoded,
                },
                None => Snapshot {
                    index,
                    timestamp_ms,
                    mat: None,
                    quality: SnapshotQuality::Missing,
                },
            });
        }
        Ok(out)
    }
}

impl Drop for ImageSequenceSnapshotViewer {
    fn drop(&mut self) {
        let mut viewers = self.shared.viewers.lock().unwrap();
        viewers.retain(|v| v.id != self.state.id);
        self.shared.refresh.store(true, Ordering::Release);
    }
}

fn image_snapshot_worker(shared: Arc<ImgSnapShared>) {
    debug!("imgseq snapshot worker enter");
    let decoders: ThreadLocal<RefCell<(FileDecoder, FrameConverter)>> = ThreadLocal::new();

    while !shared.quit.load(Ordering::Acquire) {
        let refresh = shared.refresh.swap(false, Ordering::AcqRel);
        let viewers: Vec<Arc<ViewerState>> = shared.viewers.lock().unwrap().clone();
        let changed = refresh
            || viewers
                .iter()
                .any(|v| v.range_changed.swap(false, Ordering::AcqRel));
        if !changed {
            poll::idle_wait();
            continue;
        }

        // aggregate viewer ranges over the snapshot index axis
        let mut ranges: Vec<TaskRange> = Vec::new();
        for viewer in &viewers {
            if let Some(wnd) = *viewer.wnd.lock().unwrap() {
                ranges.push(TaskRange::new(
                    (0, 0),
                    (wnd.view_idx.0, wnd.view_idx.1 + 1),
                    true,
                ));
                if wnd.cache_idx.0 < wnd.view_idx.0 {
                    ranges.push(TaskRange::new(
                        (0, 0),
                        (wnd.cache_idx.0, wnd.view_idx.0),
                        false,
                    ));
                }
                if wnd.cache_idx.1 > wnd.view_idx.1 {
                    ranges.push(TaskRange::new(
                        (0, 0),
                        (wnd.view_idx.1 + 1, wnd.cache_idx.1 + 1),
                        false,
                    ));
                }
            }
        }
        let total = aggregate_index_ranges(&ranges);
        if total.is_empty() {
            poll::idle_wait();
            continue;
        }
        let vars = *shared.vars.lock().unwrap();

        // evict what no range wants anymore
        {
            let mut store = shared.store.lock().unwrap();
            store.retain(|&i, _| {
                total
                    .iter()
                    .any(|r| i >= r.ss_idx.0 && i < r.ss_idx.1)
            });
        }

        // decode in-view ranges first, then prefetch by distance
        let mut ordered: Vec<&TaskRange> = total.iter().collect();
        ordered.sort_by_key(|r| (!r.in_view as i32, r.dist_to_view));
        for range in ordered {
            let wanted: Vec<i32> = {
                let store = shared.store.lock().unwrap();
                (range.ss_idx.0.max(0)..range.ss_idx.1.min(vars.max_index + 1))
                    .filter(|i| !store.contains_key(i))
                    .collect()
            };
            if wanted.is_empty() {
                continue;
            }
            let shared_ref = &shared;
            let decoders_ref = &decoders;
            let vars_ref = &vars;
            wanted.par_iter().for_each(|&ss_idx| {
                if shared_ref.quit.load(Ordering::Acquire) {
                    return;
                }
                let cell = decoders_ref.get_or(|| {
                    let mut converter = FrameConverter::new();
                    let (out_size, fmt, dtype, interp) = shared_ref.converter_settings;
                    if let Some((w, h)) = out_size {
                        converter.set_out_size(w, h);
                    }
                    converter.set_out_color_format(fmt);
                    converter.set_out_data_type(dtype);
                    converter.set_resize_interpolate_mode(interp);
                    RefCell::new((FileDecoder::new(), converter))
                });
                let mut borrow = cell.borrow_mut();
                let (decoder, converter) = &mut *borrow;
                let file_index = shared_ref.file_index_for_snapshot(ss_idx, vars_ref);
                let Some(path) = shared_ref.files.file_at(file_index).map(|p| p.to_owned())
                else {
                    return;
                };
                match decoder
                    .decode_file(&path)
                    .and_then(|frame| {
                        let ts = (ss_idx as f64 * vars_ref.ss_interval_ms).round() as i64;
                        converter.convert_image(&frame, ts)
                    }) {
                    Ok(mat) => {
                        shared_ref.store.lock().unwrap().insert(
                            ss_idx,
                            SnapPicture { mat: Arc::new(mat), bias: 0 },
                        );
                    }
                    Err(e) => {
                        warn!(file = %path.display(), %e, "snapshot decode failed");
                    }
                }
            });
            if shared.quit.load(Ordering::Acquire) || shared.refresh.load(Ordering::Acquire) {
                break;
            }
        }
    }
    debug!("imgseq snapshot worker leave");
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use super::*;

    #[test]
    fn test_window_vars() {
        let tb = TimeBase { num: 1, den: 90000, start_pts: 0 };
        // 10s window, 20 snapshots, over a 60s clip
        let vars = WindowVars::compute(10.0, 20, 2.0, 60_000, &tb);
        approx::assert_relative_eq!(vars.ss_interval_ms, 500.0);
        approx::assert_relative_eq!(vars.ss_interval_pts, 45_000.0);
        assert_eq!(vars.max_index, 120);
        assert_eq!(vars.max_cache, 40);
        assert_eq!(vars.prev_wnd_cache, 10);
        assert_eq!(vars.index_for_secs(0.0), 0);
        assert_eq!(vars.index_for_secs(2.0), 4);
        assert_eq!(vars.ideal_rel_pts(3), 135_000);
    }

    #[test]
    fn test_jpeg_base64_rgb() {
        let mat = Mat {
            data: MatData::U8(Array3::zeros((8, 8, 3))),
            color_format: ColorFormat::Rgb,
            timestamp_ms: 0,
        };
        let encoded = mat_to_jpeg_base64(&mat, 80).unwrap();
        assert!(!encoded.is_empty());
        assert!(base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .is_ok());
    }

    #[test]
    fn test_jpeg_base64_rgba_drops_alpha() {
        let mat = Mat {
            data: MatData::U8(Array3::zeros((4, 4, 4))),
            color_format: ColorFormat::Rgba,
            timestamp_ms: 0,
        };
        assert!(mat_to_jpeg_base64(&mat, 80).is_ok());
    }

    #[test]
    fn test_jpeg_base64_rejects_f32() {
        let mat = Mat {
            data: MatData::F32(Array3::zeros((4, 4, 3))),
            color_format: ColorFormat::Rgb,
            timestamp_ms: 0,
        };
        assert!(mat_to_jpeg_base64(&mat, 80).is_err());
    }
}
