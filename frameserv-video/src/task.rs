//! A decode unit bracketed by two seek points.
//!
//! One task is shared by the demuxer (fills the packet queue), the decoder
//! (drains packets into decoded frames) and the post-processor (converts
//! decoded frames into finished ones). The lifecycle flags are monotonic
//! false→true, with one exception: a redo request rewinds `decoder_eof`
//! and the candidate bookkeeping so the GOP can be replayed from the
//! packet backup.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering},
        Arc, Mutex,
    },
};

use ffmpeg::codec::packet::Packet;
use tracing::debug;

use crate::frame::VideoFrame;

/// Best frame seen so far for one snapshot index.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotCandidate {
    pub pts: i64,
    pub bias: i64,
    pub frame_enqueued: bool,
}

impl Default for SnapshotCandidate {
    fn default() -> Self {
        SnapshotCandidate {
            pts: i64::MIN,
            bias: i64::MAX,
            frame_enqueued: false,
        }
    }
}

#[derive(Default)]
struct PacketQueues {
    /// Fed to the decoder in demux order.
    live: VecDeque<Packet>,
    /// Consumed prefix, kept in original order for redo.
    backup: Vec<Packet>,
}

pub struct GopDecodeTask {
    /// `[first, second)` seek-point bracket; `second` is `i64::MAX` for the
    /// last GOP of the stream. The demuxer widens the bracket when packets
    /// land outside it.
    seek_pts_first: AtomicI64,
    seek_pts_second: AtomicI64,
    /// Snapshot index range covered, `(-1, -1)` outside snapshot mode.
    pub ss_idx: (i32, i32),

    packets: Mutex<PacketQueues>,
    decoded_frames: Mutex<Vec<Arc<VideoFrame>>>,
    finished_frames: Mutex<Vec<Arc<VideoFrame>>>,
    ss_candidates: Mutex<BTreeMap<i32, SnapshotCandidate>>,

    demuxing: AtomicBool,
    demuxer_eof: AtomicBool,
    decoding: AtomicBool,
    decoder_eof: AtomicBool,
    all_candidates_decoded: AtomicBool,
    cancel: AtomicBool,
    media_begin: AtomicBool,
    media_end: AtomicBool,
    redo_decoding: AtomicBool,

    in_view: AtomicBool,
    dist_to_view: AtomicI32,
}

pub type TaskHandle = Arc<GopDecodeTask>;

impl GopDecodeTask {
    pub fn new(seek_pts: (i64, i64)) -> GopDecodeTask {
        GopDecodeTask {
            seek_pts_first: AtomicI64::new(seek_pts.0),
            seek_pts_second: AtomicI64::new(seek_pts.1),
            ss_idx: (-1, -1),
            packets: Mutex::default(),
            decoded_frames: Mutex::default(),
            finished_frames: Mutex::default(),
            ss_candidates: Mutex::default(),
            demuxing: AtomicBool::new(false),
            demuxer_eof: AtomicBool::new(false),
            decoding: AtomicBool::new(false),
            decoder_eof: AtomicBool::new(false),
            all_candidates_decoded: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            media_begin: AtomicBool::new(false),
            media_end: AtomicBool::new(false),
            redo_decoding: AtomicBool::new(false),
            in_view: AtomicBool::new(true),
            dist_to_view: AtomicI32::new(0),
        }
    }

    /// Snapshot-mode task covering `ss_idx` (half-open), with one candidate
    /// slot per index clamped to `[0, max_index]`.
    pub fn new_snapshot(
        seek_pts: (i64, i64),
        ss_idx: (i32, i32),
        in_view: bool,
        dist_to_view: i32,
        max_index: i32,
    ) -> GopDecodeTask {
        let task = GopDecodeTask {
            ss_idx,
            in_view: AtomicBool::new(in_view),
            dist_to_view: AtomicI32::new(dist_to_view),
            ..GopDecodeTask::new(seek_pts)
        };
        {
            let mut candidates = task.ss_candidates.lock().unwrap();
            let begin = ss_idx.0.max(0);
            let end = ss_idx.1.min(max_index + 1);
            for idx in begin..end {
                candidates.insert(idx, SnapshotCandidate::default());
            }
        }
        task
    }

    // ---- packet queues ----

    pub fn push_packet(&self, packet: Packet) {
        self.packets.lock().unwrap().live.push_back(packet);
    }

    pub fn packet_queue_len(&self) -> usize {
        self.packets.lock().unwrap().live.len()
    }

    /// Reference-clone of the packet the decoder should send next.
    pub fn front_packet(&self) -> Option<Packet> {
        self.packets.lock().unwrap().live.front().cloned()
    }

    /// Move the consumed front packet into the backup queue.
    pub fn pop_front_to_backup(&self) {
        let mut q = self.packets.lock().unwrap();
        if let Some(pkt) = q.live.pop_front() {
            q.backup.push(pkt);
        }
    }

    /// Drop the front packet without keeping it for redo (invalid data).
    pub fn pop_front_discard(&self) {
        self.packets.lock().unwrap().live.pop_front();
    }

    /// Rebuild the live queue in original order: consumed prefix first,
    /// unconsumed remainder after.
    pub fn restore_backup(&self) {
        let mut q = self.packets.lock().unwrap();
        let mut restored: VecDeque<Packet> = q.backup.drain(..).collect();
        restored.extend(q.live.drain(..));
        q.live = restored;
    }

    // ---- frame lists ----

    /// PTS-sorted insert into the decoded list. Duplicate PTS is dropped.
    pub fn push_decoded_frame(&self, frame: Arc<VideoFrame>) -> bool {
        let mut frames = self.decoded_frames.lock().unwrap();
        match frames.binary_search_by_key(&frame.pts, |f| f.pts) {
            Ok(_) => {
                debug!(pts = frame.pts, pos_ms = frame.pos_ms, "discard duplicated frame");
                false
            }
            Err(idx) => {
                frames.insert(idx, frame);
                true
            }
        }
    }

    pub fn decoded_frames(&self) -> Vec<Arc<VideoFrame>> {
        self.decoded_frames.lock().unwrap().clone()
    }

    pub fn decoded_frame_count(&self) -> usize {
        self.decoded_frames.lock().unwrap().len()
    }

    /// Move a frame that finished post-processing into the finished list.
    pub fn finish_frame(&self, frame: Arc<VideoFrame>) {
        {
            let mut decoded = self.decoded_frames.lock().unwrap();
            if let Ok(idx) = decoded.binary_search_by_key(&frame.pts, |f| f.pts) {
                decoded.remove(idx);
            }
        }
        let mut finished = self.finished_frames.lock().unwrap();
        if let Err(idx) = finished.binary_search_by_key(&frame.pts, |f| f.pts) {
            finished.insert(idx, frame);
        }
    }

    /// Remove a frame from both lists (failed conversion or eviction).
    pub fn remove_frame(&self, pts: i64) {
        let mut decoded = self.decoded_frames.lock().unwrap();
        if let Ok(idx) = decoded.binary_search_by_key(&pts, |f| f.pts) {
            decoded.remove(idx).discard();
        }
        drop(decoded);
        let mut finished = self.finished_frames.lock().unwrap();
        if let Ok(idx) = finished.binary_search_by_key(&pts, |f| f.pts) {
            finished.remove(idx).discard();
        }
    }

    pub fn finished_frames(&self) -> Vec<Arc<VideoFrame>> {
        self.finished_frames.lock().unwrap().clone()
    }

    pub fn finished_frame_count(&self) -> usize {
        self.finished_frames.lock().unwrap().len()
    }

    pub fn frame_count(&self) -> usize {
        self.decoded_frame_count() + self.finished_frame_count()
    }

    pub fn clear_frames(&self) {
        for frame in self.decoded_frames.lock().unwrap().drain(..) {
            frame.discard();
        }
        for frame in self.finished_frames.lock().unwrap().drain(..) {
            frame.discard();
        }
    }

    // ---- snapshot candidates ----

    pub fn candidates(&self) -> BTreeMap<i32, SnapshotCandidate> {
        self.ss_candidates.lock().unwrap().clone()
    }

    pub fn contains_candidate(&self, ss_idx: i32) -> bool {
        self.ss_candidates.lock().unwrap().contains_key(&ss_idx)
    }

    /// Adopt `(pts, bias)` for `ss_idx` when it beats the current entry.
    /// Returns true when adopted.
    pub fn offer_candidate(&self, ss_idx: i32, pts: i64, bias: i64) -> bool {
        let mut candidates = self.ss_candidates.lock().unwrap();
        match candidates.get_mut(&ss_idx) {
            Some(cand) if bias < cand.bias => {
                cand.pts = pts;
                cand.bias = bias;
                true
            }
            _ => false,
        }
    }

    pub fn mark_candidate_enqueued(&self, ss_idx: i32) {
        let mut candidates = self.ss_candidates.lock().unwrap();
        if let Some(cand) = candidates.get_mut(&ss_idx) {
            cand.frame_enqueued = true;
        }
        if candidates.values().all(|c| c.frame_enqueued) {
            self.all_candidates_decoded.store(true, Ordering::Release);
        }
    }

    /// Decoder EOF with candidates never seen: they will never arrive, so
    /// stop waiting for them.
    pub fn resolve_missing_candidates(&self) {
        let mut candidates = self.ss_candidates.lock().unwrap();
        for cand in candidates.values_mut() {
            cand.frame_enqueued = true;
        }
        self.all_candidates_decoded.store(true, Ordering::Release);
    }

    fn rewind_candidates(&self) {
        let mut candidates = self.ss_candidates.lock().unwrap();
        for cand in candidates.values_mut() {
            cand.frame_enqueued = false;
        }
    }

    // ---- lifecycle flags ----

    pub fn is_demuxing(&self) -> bool {
        self.demuxing.load(Ordering::Acquire)
    }

    pub fn begin_demuxing(&self) {
        self.demuxing.store(true, Ordering::Release);
    }

    /// Race-free claim for worker pools where several threads compete for
    /// the same task.
    pub fn try_claim_demux(&self) -> bool {
        self.demuxing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_demuxer_eof(&self) -> bool {
        self.demuxer_eof.load(Ordering::Acquire)
    }

    pub fn set_demuxer_eof(&self) {
        self.demuxer_eof.store(true, Ordering::Release);
    }

    pub fn is_decoding(&self) -> bool {
        self.decoding.load(Ordering::Acquire)
    }

    /// `decoder_eof → decoding` is only legal through a redo request.
    pub fn begin_decoding(&self) -> bool {
        if self.is_decoder_eof() && !self.redo_requested() {
            return false;
        }
        self.decoding.store(true, Ordering::Release);
        true
    }

    pub fn is_decoder_eof(&self) -> bool {
        self.decoder_eof.load(Ordering::Acquire)
    }

    pub fn set_decoder_eof(&self) {
        self.decoder_eof.store(true, Ordering::Release);
    }

    pub fn all_candidates_decoded(&self) -> bool {
        self.all_candidates_decoded.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_media_begin(&self) -> bool {
        self.media_begin.load(Ordering::Acquire)
    }

    pub fn set_media_begin(&self) {
        self.media_begin.store(true, Ordering::Release);
    }

    pub fn is_media_end(&self) -> bool {
        self.media_end.load(Ordering::Acquire)
    }

    pub fn set_media_end(&self) {
        self.media_end.store(true, Ordering::Release);
    }

    pub fn redo_requested(&self) -> bool {
        self.redo_decoding.load(Ordering::Acquire)
    }

    /// Ask for the GOP to be replayed from the packet backup. The decoder
    /// applies it via `prepare_redo` when it next picks the task up.
    pub fn request_redo(&self) {
        self.redo_decoding.store(true, Ordering::Release);
    }

    /// Applied by the decoder: restore the packet backup, rewind candidate
    /// state and clear `decoder_eof`.
    pub fn prepare_redo(&self) {
        debug!(
            seek_pts = ?self.seek_pts(),
            ss_idx = ?self.ss_idx,
            "redo decoding from packet backup"
        );
        self.restore_backup();
        self.rewind_candidates();
        self.all_candidates_decoded.store(false, Ordering::Release);
        self.decoder_eof.store(false, Ordering::Release);
        self.redo_decoding.store(false, Ordering::Release);
        self.clear_frames();
    }

    // ---- priority metadata ----

    pub fn is_in_view(&self) -> bool {
        self.in_view.load(Ordering::Acquire)
    }

    pub fn set_in_view(&self, in_view: bool) {
        self.in_view.store(in_view, Ordering::Release);
    }

    pub fn dist_to_view(&self) -> i32 {
        self.dist_to_view.load(Ordering::Acquire)
    }

    pub fn set_dist_to_view(&self, dist: i32) {
        self.dist_to_view.store(dist, Ordering::Release);
    }

    pub fn seek_pts(&self) -> (i64, i64) {
        (
            self.seek_pts_first.load(Ordering::Acquire),
            self.seek_pts_second.load(Ordering::Acquire),
        )
    }

    /// Widen the bracket when the demuxer observes a packet outside it.
    pub fn extend_seek_range(&self, pts: i64) {
        self.seek_pts_first.fetch_min(pts, Ordering::AcqRel);
        if self.seek_pts_second.load(Ordering::Acquire) != i64::MAX {
            self.seek_pts_second.fetch_max(pts, Ordering::AcqRel);
        }
    }
}

impl std::fmt::Debug for GopDecodeTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GopDecodeTask")
            .field("seek_pts", &self.seek_pts())
            .field("ss_idx", &self.ss_idx)
            .field("demuxing", &self.is_demuxing())
            .field("demuxer_eof", &self.is_demuxer_eof())
            .field("decoding", &self.is_decoding())
            .field("decoder_eof", &self.is_decoder_eof())
            .field("cancel", &self.is_cancelled())
            .field("packets", &self.packet_queue_len())
            .field("frames", &self.frame_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::frame::VideoFrame;
    use crate::mat::{ColorFormat, Mat, MatData};
    use ndarray::Array3;

    use super::*;

    fn frame(pts: i64) -> Arc<VideoFrame> {
        let mat = Mat {
            data: MatData::U8(Array3::zeros((2, 2, 3))),
            color_format: ColorFormat::Rgb,
            timestamp_ms: pts,
        };
        Arc::new(VideoFrame::from_mat(mat, pts, pts, 1))
    }

    #[test]
    fn test_decoded_frames_sorted_and_deduped() {
        let task = GopDecodeTask::new((0, 300));
        assert!(task.push_decoded_frame(frame(30)));
        assert!(task.push_decoded_frame(frame(10)));
        assert!(task.push_decoded_frame(frame(20)));
        assert!(!task.push_decoded_frame(frame(20)));
        let pts: Vec<_> = task.decoded_frames().iter().map(|f| f.pts).collect();
        assert_eq!(pts, vec![10, 20, 30]);
    }

    #[test]
    fn test_finish_frame_moves_between_lists() {
        let task = GopDecodeTask::new((0, 300));
        let f = frame(10);
        task.push_decoded_frame(f.clone());
        task.finish_frame(f);
        assert_eq!(task.decoded_frame_count(), 0);
        assert_eq!(task.finished_frame_count(), 1);
        assert_eq!(task.frame_count(), 1);
    }

    #[test]
    fn test_decoder_eof_blocks_decoding_without_redo() {
        let task = GopDecodeTask::new((0, 300));
        assert!(task.begin_decoding());
        task.set_decoder_eof();
        assert!(!task.begin_decoding());
        task.request_redo();
        assert!(task.begin_decoding());
    }

    #[test]
    fn test_redo_restores_original_packet_order() {
        let task = GopDecodeTask::new((0, 300));
        for pts in 0..4 {
            let mut pkt = Packet::empty();
            pkt.set_pts(Some(pts));
            task.push_packet(pkt);
        }
        // consume two packets
        task.pop_front_to_backup();
        task.pop_front_to_backup();
        assert_eq!(task.packet_queue_len(), 2);

        task.request_redo();
        task.prepare_redo();
        assert_eq!(task.packet_queue_len(), 4);
        let first = task.front_packet().unwrap();
        assert_eq!(first.pts(), Some(0));
        assert!(!task.is_decoder_eof());
        assert!(!task.redo_requested());
    }

    #[test]
    fn test_extend_seek_range() {
        let task = GopDecodeTask::new((100, 200));
        task.extend_seek_range(50);
        assert_eq!(task.seek_pts(), (50, 200));
        task.extend_seek_range(250);
        assert_eq!(task.seek_pts(), (50, 250));
        // an open-ended bracket stays open
        let last = GopDecodeTask::new((100, i64::MAX));
        last.extend_seek_range(500);
        assert_eq!(last.seek_pts(), (100, i64::MAX));
    }

    #[test]
    fn test_candidate_bias_adoption() {
        let task = GopDecodeTask::new_snapshot((0, 1000), (0, 3), true, 0, 100);
        assert!(task.offer_candidate(1, 95, 5));
        // worse bias is rejected
        assert!(!task.offer_candidate(1, 110, 10));
        // better bias replaces
        assert!(task.offer_candidate(1, 99, 1));
        let cand = task.candidates()[&1];
        assert_eq!(cand.pts, 99);
        assert_eq!(cand.bias, 1);
    }

    #[test]
    fn test_all_candidates_decoded_flip() {
        let task = GopDecodeTask::new_snapshot((0, 1000), (0, 2), true, 0, 100);
        assert!(!task.all_candidates_decoded());
        task.mark_candidate_enqueued(0);
        assert!(!task.all_candidates_decoded());
        task.mark_candidate_enqueued(1);
        assert!(task.all_candidates_decoded());
    }

    #[test]
    fn test_candidate_range_clamped_to_max_index() {
        let task = GopDecodeTask::new_snapshot((0, 1000), (-2, 5), true, 0, 2);
        let indices: Vec<_> = task.candidates().keys().copied().collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_redo_rewinds_candidates() {
        let task = GopDecodeTask::new_snapshot((0, 1000), (0, 2), true, 0, 100);
        task.mark_candidate_enqueued(0);
        task.mark_candidate_enqueued(1);
        assert!(task.all_candidates_decoded());
        task.request_redo();
        task.prepare_redo();
        assert!(!task.all_candidates_decoded());
        assert!(task.candidates().values().all(|c| !c.frame_enqueued));
    }
}
