//! Hardware decoding support: device context creation, decoder wiring
//! through the `get_format` callback, and hardware→software transfer.
//!
//! `ffmpeg-next` has no safe surface for any of this, so this module talks
//! to the raw API directly and keeps the unsafety contained.

use std::{
    ffi::c_void,
    ptr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
};

use anyhow::{bail, Result};
use ffmpeg::{codec, ffi, util::frame::video::Video};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum HwDeviceKind {
    /// First device type the build supports and the host can open.
    #[default]
    Auto,
    Cuda,
    Vaapi,
    D3d11va,
    VideoToolbox,
}

impl HwDeviceKind {
    fn to_av(self) -> Option<ffi::AVHWDeviceType> {
        use ffi::AVHWDeviceType::*;
        match self {
            HwDeviceKind::Auto => None,
            HwDeviceKind::Cuda => Some(AV_HWDEVICE_TYPE_CUDA),
            HwDeviceKind::Vaapi => Some(AV_HWDEVICE_TYPE_VAAPI),
            HwDeviceKind::D3d11va => Some(AV_HWDEVICE_TYPE_D3D11VA),
            HwDeviceKind::VideoToolbox => Some(AV_HWDEVICE_TYPE_VIDEOTOOLBOX),
        }
    }
}

/// RAII wrapper around an `AVBufferRef` holding a hardware device context.
pub struct HwDevice {
    ptr: *mut ffi::AVBufferRef,
    pixel_format: ffi::AVPixelFormat,
}

unsafe impl Send for HwDevice {}
unsafe impl Sync for HwDevice {}

impl HwDevice {
    /// Create a device of `kind` for decoding `codec_id`, probing the
    /// codec's hardware configs for the matching pixel format.
    pub fn create(kind: HwDeviceKind, codec_id: codec::Id) -> Result<HwDevice> {
        unsafe {
            let codec_ptr = ffi::avcodec_find_decoder(codec_id.into());
            if codec_ptr.is_null() {
                bail!("no decoder for codec {codec_id:?}");
            }

            let mut idx = 0;
            loop {
                let config = ffi::avcodec_get_hw_config(codec_ptr, idx);
                if config.is_null() {
                    bail!("codec {codec_id:?} supports no usable hardware device");
                }
                idx += 1;
                if (*config).methods & ffi::AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX as i32 == 0 {
                    continue;
                }
                let device_type = (*config).device_type;
                if let Some(wanted) = kind.to_av() {
                    if device_type != wanted {
                        continue;
                    }
                }
                let mut ptr: *mut ffi::AVBufferRef = ptr::null_mut();
                let ret = ffi::av_hwdevice_ctx_create(
                    &mut ptr,
                    device_type,
                    ptr::null(),
                    ptr::null_mut(),
                    0,
                );
                if ret < 0 || ptr.is_null() {
                    debug!(?device_type, ret, "hardware device unavailable, trying next");
                    continue;
                }
                debug!(?device_type, "hardware device created");
                return Ok(HwDevice {
                    ptr,
                    pixel_format: (*config).pix_fmt,
                });
            }
        }
    }

    /// New `av_buffer_ref` of this context; the caller owns the ref.
    fn buf_ref(&self) -> *mut ffi::AVBufferRef {
        unsafe { ffi::av_buffer_ref(self.ptr) }
    }
}

impl Drop for HwDevice {
    fn drop(&mut self) {
        unsafe {
            ffi::av_buffer_unref(&mut self.ptr);
        }
    }
}

/// Attach the device to a not-yet-opened decoder context and install the
/// `get_format` callback preferring the device's pixel format.
pub fn attach_device(decoder_ctx: &mut codec::context::Context, device: &HwDevice) {
    unsafe {
        let raw = decoder_ctx.as_mut_ptr();
        (*raw).hw_device_ctx = device.buf_ref();
        (*raw).opaque = device.pixel_format as i64 as *mut c_void;
        (*raw).get_format = Some(prefer_hw_format);
    }
}

/// Given the list of acceptable formats, pick the hardware format stashed
/// in `opaque` when present, otherwise the first software format offered.
unsafe extern "C" fn prefer_hw_format(
    ctx: *mut ffi::AVCodecContext,
    mut fmts: *const ffi::AVPixelFormat,
) -> ffi::AVPixelFormat {
    let wanted: ffi::AVPixelFormat = std::mem::transmute((*ctx).opaque as i64 as i32);
    let mut first_sw = ffi::AVPixelFormat::AV_PIX_FMT_NONE;
    while *fmts != ffi::AVPixelFormat::AV_PIX_FMT_NONE {
        if *fmts == wanted {
            return wanted;
        }
        if first_sw == ffi::AVPixelFormat::AV_PIX_FMT_NONE {
            let desc = ffi::av_pix_fmt_desc_get(*fmts);
            if desc.is_null() || (*desc).flags & ffi::AV_PIX_FMT_FLAG_HWACCEL as u64 == 0 {
                first_sw = *fmts;
            }
        }
        fmts = fmts.add(1);
    }
    first_sw
}

/// Whether a decoded frame still lives in device memory.
pub fn is_hw_frame(frame: &Video) -> bool {
    unsafe { !(*frame.as_ptr()).hw_frames_ctx.is_null() }
}

/// Copy a hardware frame into host memory, preserving timing properties.
pub fn transfer_to_software(hw_frame: &Video) -> Result<Video> {
    let mut sw_frame = Video::empty();
    unsafe {
        let ret = ffi::av_hwframe_transfer_data(sw_frame.as_mut_ptr(), hw_frame.as_ptr(), 0);
        if ret < 0 {
            bail!("hardware frame transfer failed ({ret})");
        }
        let ret = ffi::av_frame_copy_props(sw_frame.as_mut_ptr(), hw_frame.as_ptr());
        if ret < 0 {
            warn!(ret, "failed to copy frame props after transfer");
        }
    }
    sw_frame.set_pts(hw_frame.pts());
    Ok(sw_frame)
}

/// A mutex that only locks while engaged. Hardware decoder contexts are
/// rarely thread-safe, so the decoder context lock engages exactly when a
/// hardware device is attached; in all-software decode every acquisition
/// is a single atomic load.
#[derive(Default)]
pub struct CondMutex {
    engaged: AtomicBool,
    inner: Mutex<()>,
}

impl CondMutex {
    pub fn new(engaged: bool) -> CondMutex {
        CondMutex {
            engaged: AtomicBool::new(engaged),
            inner: Mutex::new(()),
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::Acquire)
    }

    /// `None` when disengaged; the caller proceeds without serialization.
    pub fn lock(&self) -> Option<MutexGuard<'_, ()>> {
        if self.is_engaged() {
            Some(self.inner.lock().unwrap())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn test_cond_mutex_disengaged_is_noop() {
        let m = CondMutex::new(false);
        assert!(m.lock().is_none());
        assert!(m.lock().is_none());
    }

    #[test]
    fn test_cond_mutex_engaged_serializes() {
        let m = Arc::new(CondMutex::new(true));
        let g = m.lock();
        assert!(g.is_some());
        let m2 = m.clone();
        let handle = thread::spawn(move || {
            // blocks until the first guard drops
            let _g = m2.lock();
        });
        drop(g);
        handle.join().unwrap();
    }
}
