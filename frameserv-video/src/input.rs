//! Thin wrapper over a demuxing context bound to one video stream.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use ffmpeg::{
    codec::{self, packet::Packet},
    ffi, format,
    media::Type,
};

pub struct MediaInput {
    input: format::context::Input,
    stream_index: usize,
    parameters: codec::Parameters,
}

impl MediaInput {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<MediaInput> {
        let path = path.as_ref().to_owned();
        let input = format::input(&path)
            .with_context(|| format!("failed to open '{}'", path.display()))?;
        let stream = input
            .streams()
            .best(Type::Video)
            .ok_or_else(|| anyhow!("video stream not found in '{}'", path.display()))?;
        let stream_index = stream.index();
        let parameters = stream.parameters();
        drop(stream);

        Ok(MediaInput {
            input,
            stream_index,
            parameters,
        })
    }

    pub fn parameters(&self) -> codec::Parameters {
        self.parameters.clone()
    }

    /// Per-stream seek with `target` as both the upper bound and the goal,
    /// so the demuxer lands on the keyframe at or before it.
    pub fn seek_to_pts(&mut self, target: i64) -> Result<()> {
        let ret = unsafe {
            ffi::avformat_seek_file(
                self.input.as_mut_ptr(),
                self.stream_index as i32,
                i64::MIN,
                target,
                target,
                0,
            )
        };
        if ret < 0 {
            bail!("seek to pts {target} failed ({ret})");
        }
        Ok(())
    }

    /// Next packet of the bound stream, `None` at container EOF.
    pub fn read_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            let mut packet = Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if packet.stream() == self.stream_index {
                        return Ok(Some(packet));
                    }
                }
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(e) => return Err(e).context("packet read failed"),
            }
        }
    }
}
