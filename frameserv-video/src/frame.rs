//! The post-decode unit delivered to clients.
//!
//! A frame's payload moves monotonically hardware → software → matrix and
//! never backwards. The payload is swapped under a mutex so concurrent
//! readers always observe a consistent stage, and the `in_use` flag keeps
//! the hardware→software transfer from racing a client conversion on the
//! same frame.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use anyhow::{bail, Result};
use ffmpeg::util::frame::video::Video;
use frameserv_util::poll;
use tracing::error;

use crate::{
    convert::FrameConverter,
    hwaccel::{self, CondMutex},
    mat::Mat,
    rotate::RotationFilter,
};

/// Count of decoded frames still referencing device memory. Hardware frame
/// references pin large driver buffers, so the decoder stops pulling output
/// once this exceeds a small cap.
#[derive(Debug, Default)]
pub struct PendingHwFrames {
    count: AtomicUsize,
}

impl PendingHwFrames {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn guard(counter: &Arc<PendingHwFrames>) -> PendingHwGuard {
        counter.count.fetch_add(1, Ordering::AcqRel);
        PendingHwGuard(counter.clone())
    }
}

/// Held by a frame for as long as its payload references device memory.
/// Dropping the guard (payload transferred or frame dropped) releases the
/// slot, so the decode context never needs a back-pointer to the frame.
#[derive(Debug)]
pub struct PendingHwGuard(Arc<PendingHwFrames>);

impl Drop for PendingHwGuard {
    fn drop(&mut self) {
        self.0.count.fetch_sub(1, Ordering::AcqRel);
    }
}

enum Payload {
    Hardware {
        frame: Video,
        _guard: PendingHwGuard,
    },
    Software(Video),
    Mat(Arc<Mat>),
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadStage {
    Hardware,
    Software,
    Mat,
    Discarded,
}

pub struct VideoFrame {
    pub pts: i64,
    pub pos_ms: i64,
    pub dur: i64,
    payload: Mutex<Payload>,
    /// Compare-exchange spin-loop guarding transfer vs. client reads.
    in_use: AtomicBool,
    is_start_frame: AtomicBool,
    is_eof_frame: AtomicBool,
    decode_started: AtomicBool,
    decode_failed: AtomicBool,
}

impl VideoFrame {
    pub fn from_software(frame: Video, pts: i64, pos_ms: i64, dur: i64) -> VideoFrame {
        VideoFrame::new(Payload::Software(frame), pts, pos_ms, dur)
    }

    pub fn from_hardware(
        frame: Video,
        pts: i64,
        pos_ms: i64,
        dur: i64,
        pending: &Arc<PendingHwFrames>,
    ) -> VideoFrame {
        VideoFrame::new(
            Payload::Hardware {
                frame,
                _guard: PendingHwFrames::guard(pending),
            },
            pts,
            pos_ms,
            dur,
        )
    }

    pub fn from_mat(mat: Mat, pts: i64, pos_ms: i64, dur: i64) -> VideoFrame {
        VideoFrame::new(Payload::Mat(Arc::new(mat)), pts, pos_ms, dur)
    }

    fn new(payload: Payload, pts: i64, pos_ms: i64, dur: i64) -> VideoFrame {
        VideoFrame {
            pts,
            pos_ms,
            dur,
            payload: Mutex::new(payload),
            in_use: AtomicBool::new(false),
            is_start_frame: AtomicBool::new(false),
            is_eof_frame: AtomicBool::new(false),
            decode_started: AtomicBool::new(false),
            decode_failed: AtomicBool::new(false),
        }
    }

    pub fn stage(&self) -> PayloadStage {
        match &*self.payload.lock().unwrap() {
            Payload::Hardware { .. } => PayloadStage::Hardware,
            Payload::Software(_) => PayloadStage::Software,
            Payload::Mat(_) => PayloadStage::Mat,
            Payload::Discarded => PayloadStage::Discarded,
        }
    }

    pub fn is_hw(&self) -> bool {
        self.stage() == PayloadStage::Hardware
    }

    pub fn is_ready(&self) -> bool {
        self.stage() == PayloadStage::Mat
    }

    pub fn is_start_frame(&self) -> bool {
        self.is_start_frame.load(Ordering::Acquire)
    }

    pub fn set_start_frame(&self, val: bool) {
        self.is_start_frame.store(val, Ordering::Release);
    }

    pub fn is_eof_frame(&self) -> bool {
        self.is_eof_frame.load(Ordering::Acquire)
    }

    pub fn set_eof_frame(&self, val: bool) {
        self.is_eof_frame.store(val, Ordering::Release);
    }

    pub fn decode_started(&self) -> bool {
        self.decode_started.load(Ordering::Acquire)
    }

    pub fn mark_decode_started(&self) {
        self.decode_started.store(true, Ordering::Release);
    }

    pub fn decode_failed(&self) -> bool {
        self.decode_failed.load(Ordering::Acquire)
    }

    pub fn mark_decode_failed(&self) {
        self.decode_failed.store(true, Ordering::Release);
    }

    pub fn is_discarded(&self) -> bool {
        self.stage() == PayloadStage::Discarded
    }

    pub fn discard(&self) {
        *self.payload.lock().unwrap() = Payload::Discarded;
    }

    /// Converted matrix if conversion already happened.
    pub fn peek_mat(&self) -> Option<Arc<Mat>> {
        match &*self.payload.lock().unwrap() {
            Payload::Mat(mat) => Some(mat.clone()),
            _ => None,
        }
    }

    /// Spin on `in_use` until acquired or `quit` is raised.
    fn acquire(&self, quit: &AtomicBool) -> bool {
        loop {
            if self
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
            if quit.load(Ordering::Acquire) {
                return false;
            }
            poll::idle_wait();
        }
    }

    fn release(&self) {
        self.in_use.store(false, Ordering::Release);
    }

    /// Move a hardware payload into host memory under the decoder context
    /// lock. A failed transfer discards the payload; the caller decides
    /// whether that cascades into a task redo.
    pub fn transfer_to_software(&self, dec_ctx_lock: &CondMutex, quit: &AtomicBool) -> Result<()> {
        if !self.acquire(quit) {
            bail!("shutting down");
        }
        let result = (|| {
            let mut payload = self.payload.lock().unwrap();
            let hw_frame = match &*payload {
                Payload::Hardware { frame, .. } => frame,
                // another worker got here first
                _ => return Ok(()),
            };
            let _lk = dec_ctx_lock.lock();
            match hwaccel::transfer_to_software(hw_frame) {
                Ok(sw_frame) => {
                    *payload = Payload::Software(sw_frame);
                    Ok(())
                }
                Err(e) => {
                    error!(pts = self.pts, pos_ms = self.pos_ms, %e, "hardware frame transfer failed");
                    *payload = Payload::Discarded;
                    self.mark_decode_failed();
                    Err(e)
                }
            }
        })();
        self.release();
        result
    }

    /// Full post-processing chain: hardware transfer (if still needed),
    /// rotation, pixel conversion. Idempotent; the result is cached in the
    /// payload.
    pub fn convert(
        &self,
        converter: &mut FrameConverter,
        rotation: Option<&mut RotationFilter>,
        dec_ctx_lock: &CondMutex,
        quit: &AtomicBool,
    ) -> Result<Arc<Mat>> {
        if let Some(mat) = self.peek_mat() {
            return Ok(mat);
        }
        if !self.acquire(quit) {
            bail!("shutting down");
        }
        let result = (|| {
            let mut payload = self.payload.lock().unwrap();
            // transfer stage
            let transferred = match &*payload {
                Payload::Hardware { frame, .. } => {
                    let _lk = dec_ctx_lock.lock();
                    Some(hwaccel::transfer_to_software(frame))
                }
                _ => None,
            };
            match transferred {
                Some(Ok(sw_frame)) => *payload = Payload::Software(sw_frame),
                Some(Err(e)) => {
                    *payload = Payload::Discarded;
                    self.mark_decode_failed();
                    return Err(e);
                }
                None => {}
            }
            let sw_frame = match &*payload {
                Payload::Software(frame) => frame,
                Payload::Mat(mat) => return Ok(mat.clone()),
                Payload::Hardware { .. } => unreachable!(),
                Payload::Discarded => bail!("frame at {}ms was discarded", self.pos_ms),
            };
            // rotation stage
            let mat = match rotation {
                Some(filter) => {
                    let rotated = filter.run(sw_frame)?;
                    converter.convert_image(&rotated, self.pos_ms)?
                }
                None => converter.convert_image(sw_frame, self.pos_ms)?,
            };
            let mat = Arc::new(mat);
            *payload = Payload::Mat(mat.clone());
            Ok(mat)
        })();
        self.release();
        if result.is_err() {
            self.mark_decode_failed();
        }
        result
    }
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("pts", &self.pts)
            .field("pos_ms", &self.pos_ms)
            .field("dur", &self.dur)
            .field("stage", &self.stage())
            .field("start", &self.is_start_frame())
            .field("eof", &self.is_eof_frame())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use crate::mat::{ColorFormat, MatData};

    use super::*;

    fn mat_frame(pts: i64) -> VideoFrame {
        let mat = Mat {
            data: MatData::U8(Array3::zeros((2, 2, 4))),
            color_format: ColorFormat::Rgba,
            timestamp_ms: pts,
        };
        VideoFrame::from_mat(mat, pts, pts, 1)
    }

    #[test]
    fn test_mat_payload_is_ready() {
        let frame = mat_frame(0);
        assert!(frame.is_ready());
        assert!(!frame.is_hw());
        assert!(frame.peek_mat().is_some());
    }

    #[test]
    fn test_flags_default_off() {
        let frame = mat_frame(0);
        assert!(!frame.is_start_frame());
        assert!(!frame.is_eof_frame());
        assert!(!frame.decode_failed());
        frame.set_start_frame(true);
        frame.set_eof_frame(true);
        assert!(frame.is_start_frame());
        assert!(frame.is_eof_frame());
    }

    #[test]
    fn test_discard() {
        let frame = mat_frame(0);
        frame.discard();
        assert!(frame.is_discarded());
        assert!(frame.peek_mat().is_none());
    }

    #[test]
    fn test_pending_hw_guard_counts() {
        let pending = Arc::new(PendingHwFrames::default());
        assert_eq!(pending.count(), 0);
        let g1 = PendingHwFrames::guard(&pending);
        let g2 = PendingHwFrames::guard(&pending);
        assert_eq!(pending.count(), 2);
        drop(g1);
        assert_eq!(pending.count(), 1);
        drop(g2);
        assert_eq!(pending.count(), 0);
    }

    #[test]
    fn test_convert_on_mat_payload_returns_cached() {
        let frame = mat_frame(7);
        let quit = AtomicBool::new(false);
        let lock = CondMutex::new(false);
        let mut cvt = FrameConverter::new();
        let mat = frame.convert(&mut cvt, None, &lock, &quit).unwrap();
        assert_eq!(mat.timestamp_ms, 7);
    }
}
