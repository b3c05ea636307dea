//! Random-access frame serving over compressed video.
//!
//! Three readers share one decode-ahead cache engine: [`VideoReader`] for
//! timestamp-addressed frames around a moving read pointer,
//! [`SnapshotGenerator`] for fixed-cadence timeline thumbnails, and
//! [`ImageSequenceReader`] for directories of numbered images. Each reader
//! owns a small set of polled worker threads that demux, decode and
//! convert into a sliding window of ready frames; see the module docs for
//! the task model they cooperate through.

mod convert;
mod decode;
mod frame;
mod hwaccel;
mod imgseq;
mod input;
mod mat;
mod parser;
mod reader;
mod rotate;
mod sched;
mod seek_points;
mod snapshot;
mod task;
mod timebase;
mod window;

pub use convert::FrameConverter;
pub use decode::HwFrameEviction;
pub use frame::{PayloadStage, VideoFrame};
pub use hwaccel::HwDeviceKind;
pub use imgseq::ImageSequenceReader;
pub use mat::{ColorFormat, InterpMode, Mat, MatData, MatDataType};
pub use parser::{ImageSequenceIterator, MediaInfo, MediaParser, VideoStreamInfo};
pub use reader::{ReadOutcome, VideoReader};
pub use snapshot::{
    mat_to_jpeg_base64, ImageSequenceSnapshotGenerator, ImageSequenceSnapshotViewer,
    OverviewProvider, Snapshot, SnapshotGenerator, SnapshotQuality, SnapshotViewer,
};
pub use seek_points::SeekPointTable;
pub use timebase::TimeBase;
pub use window::SnapWindow;

pub fn init() {
    ffmpeg::init().expect("failed to init ffmpeg");
}
