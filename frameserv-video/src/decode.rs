//! Decoder context wrapper shared by the pipelines.
//!
//! Exactly one decoder context exists per reader. All codec calls go
//! through the conditional context lock: engaged while a hardware device
//! is attached, free in all-software decode.

use std::sync::Arc;

use anyhow::{Context, Result};
use ffmpeg::{
    codec::{self, packet::Packet, Parameters},
    util::error::EAGAIN,
    util::frame::video::Video,
};
use tracing::{debug, warn};

use crate::{
    frame::{PendingHwFrames, VideoFrame},
    hwaccel::{self, CondMutex, HwDevice, HwDeviceKind},
    timebase::TimeBase,
};

/// What to do with hardware output frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HwFrameEviction {
    /// Keep the device reference; the post-processor transfers later.
    #[default]
    Deferred,
    /// Transfer to host memory right out of the decoder so the device
    /// context is released as early as possible.
    Inline,
}

#[derive(Debug)]
pub enum SendOutcome {
    Consumed,
    Again,
    /// One bad packet; dropped and logged, decoding continues.
    Invalid,
}

#[derive(Debug)]
pub enum ReceiveOutcome {
    Frame(Video),
    Again,
    Eof,
}

pub struct VideoDecoder {
    decoder: codec::decoder::Video,
    /// Keeps the device context alive for as long as the decoder uses it.
    _hw_device: Option<HwDevice>,
    ctx_lock: Arc<CondMutex>,
    pending_hw: Arc<PendingHwFrames>,
    pub hw_frame_eviction: HwFrameEviction,
    /// Hardware frame references pin driver buffers; stop pulling output
    /// past this many un-transferred frames.
    pub max_pending_hw: usize,
}

impl VideoDecoder {
    pub fn open(parameters: Parameters, hw_kind: Option<HwDeviceKind>) -> Result<VideoDecoder> {
        let mut ctx = codec::Context::from_parameters(parameters.clone())
            .context("failed to create decoder context")?;
        let hw_device = match hw_kind {
            Some(kind) => match HwDevice::create(kind, parameters.id()) {
                Ok(device) => {
                    hwaccel::attach_device(&mut ctx, &device);
                    Some(device)
                }
                Err(e) => {
                    warn!(%e, "hardware decoding unavailable, falling back to software");
                    None
                }
            },
            None => None,
        };
        let decoder = ctx
            .decoder()
            .video()
            .context("failed to open video decoder")?;
        let ctx_lock = Arc::new(CondMutex::new(hw_device.is_some()));
        Ok(VideoDecoder {
            decoder,
            _hw_device: hw_device,
            ctx_lock,
            pending_hw: Arc::new(PendingHwFrames::default()),
            hw_frame_eviction: HwFrameEviction::default(),
            max_pending_hw: 3,
        })
    }

    /// The conditional lock serializing decoder access with hardware-frame
    /// transfers done by other threads.
    pub fn ctx_lock(&self) -> Arc<CondMutex> {
        self.ctx_lock.clone()
    }

    pub fn hw_backlog_full(&self) -> bool {
        self.pending_hw.count() > self.max_pending_hw
    }

    pub fn send_packet(&mut self, packet: &Packet) -> Result<SendOutcome> {
        let _lk = self.ctx_lock.lock();
        match self.decoder.send_packet(packet) {
            Ok(()) => Ok(SendOutcome::Consumed),
            Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => Ok(SendOutcome::Again),
            Err(ffmpeg::Error::InvalidData) => {
                warn!(pts = ?packet.pts(), "invalid data in packet, dropping");
                Ok(SendOutcome::Invalid)
            }
            Err(e) => Err(e).context("send_packet failed"),
        }
    }

    /// Null packet draining the frames the codec still holds.
    pub fn send_eof(&mut self) -> Result<()> {
        let _lk = self.ctx_lock.lock();
        match self.decoder.send_eof() {
            Ok(()) | Err(ffmpeg::Error::Eof) => Ok(()),
            Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => Ok(()),
            Err(e) => Err(e).context("send_eof failed"),
        }
    }

    pub fn receive_frame(&mut self) -> Result<ReceiveOutcome> {
        let mut frame = Video::empty();
        let received = {
            let _lk = self.ctx_lock.lock();
            self.decoder.receive_frame(&mut frame)
        };
        match received {
            Ok(()) => {
                // prefer the demuxer-reconstructed timestamp
                if let Some(bets) = frame.timestamp() {
                    frame.set_pts(Some(bets));
                }
                Ok(ReceiveOutcome::Frame(frame))
            }
            Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => Ok(ReceiveOutcome::Again),
            Err(ffmpeg::Error::Eof) => Ok(ReceiveOutcome::Eof),
            Err(e) => Err(e).context("receive_frame failed"),
        }
    }

    pub fn flush(&mut self) {
        debug!("decoder flush");
        let _lk = self.ctx_lock.lock();
        self.decoder.flush();
    }

    /// Wrap a decoded frame for the cache, transferring inline when the
    /// eviction policy asks for it.
    pub fn wrap_frame(
        &self,
        frame: Video,
        time_base: &TimeBase,
        fallback_dur: i64,
    ) -> Result<Arc<VideoFrame>> {
        let pts = frame.pts().unwrap_or(0);
        let pos_ms = time_base.pts_to_millis(pts);
        let mut dur = frame_duration(&frame);
        if dur <= 0 {
            dur = fallback_dur;
        }
        if hwaccel::is_hw_frame(&frame) {
            match self.hw_frame_eviction {
                HwFrameEviction::Inline => {
                    let sw = {
                        let _lk = self.ctx_lock.lock();
                        hwaccel::transfer_to_software(&frame)?
                    };
                    Ok(Arc::new(VideoFrame::from_software(sw, pts, pos_ms, dur)))
                }
                HwFrameEviction::Deferred => Ok(Arc::new(VideoFrame::from_hardware(
                    frame,
                    pts,
                    pos_ms,
                    dur,
                    &self.pending_hw,
                ))),
            }
        } else {
            Ok(Arc::new(VideoFrame::from_software(frame, pts, pos_ms, dur)))
        }
    }
}

fn frame_duration(frame: &Video) -> i64 {
    unsafe { (*frame.as_ptr()).duration }
}

/// Snapshot index a decoded frame belongs to, and how far its PTS sits
/// from that index's ideal PTS.
pub fn snapshot_index_for(pts: i64, ss_interval_pts: f64) -> (i32, i64) {
    debug_assert!(ss_interval_pts > 0.0);
    let idx = (pts as f64 / ss_interval_pts).round() as i32;
    let bias = (ss_interval_pts * idx as f64 - pts as f64).abs().floor() as i64;
    (idx, bias)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_index_exact() {
        let (idx, bias) = snapshot_index_for(3000, 1000.0);
        assert_eq!(idx, 3);
        assert_eq!(bias, 0);
    }

    #[test]
    fn test_snapshot_index_rounds_to_nearest() {
        let (idx, bias) = snapshot_index_for(1499, 1000.0);
        assert_eq!(idx, 1);
        assert_eq!(bias, 499);
        let (idx, bias) = snapshot_index_for(1501, 1000.0);
        assert_eq!(idx, 2);
        assert_eq!(bias, 499);
    }

    #[test]
    fn test_snapshot_index_fractional_interval() {
        let (idx, bias) = snapshot_index_for(1001, 333.5);
        assert_eq!(idx, 3);
        // ideal = 1000.5, |1000.5 - 1001| = 0.5 floors to 0
        assert_eq!(bias, 0);
    }

    #[test]
    fn test_snapshot_index_zero() {
        let (idx, bias) = snapshot_index_for(100, 1000.0);
        assert_eq!(idx, 0);
        assert_eq!(bias, 100);
    }
}
