//! Display-matrix rotation through a libavfilter chain.
//!
//! Rotation metadata only ever comes in quarter turns; 90 and 270 go
//! through `transpose`, 180 through `hflip,vflip` (one pass instead of a
//! double transpose).

use anyhow::{anyhow, bail, Context, Result};
use ffmpeg::{filter, format::Pixel, util::frame::video::Video, Rational};

/// Normalize arbitrary rotation degrees to one of {0, 90, 180, 270}.
pub fn normalize_rotation(degrees: f64) -> i32 {
    let mut d = degrees.round() as i64 % 360;
    if d < 0 {
        d += 360;
    }
    // quarter-turn metadata can come in slightly off (e.g. 89.9)
    ((d + 45) / 90 * 90 % 360) as i32
}

/// Filter chain descriptor for a normalized rotation, `None` for 0.
pub fn filter_desc_for_rotation(rotation: i32) -> Option<&'static str> {
    match rotation {
        90 => Some("transpose=cclock"),
        180 => Some("hflip,vflip"),
        270 => Some("transpose=clock"),
        _ => None,
    }
}

/// Frame size after applying a normalized rotation.
pub fn rotated_size(rotation: i32, width: u32, height: u32) -> (u32, u32) {
    match rotation {
        90 | 270 => (height, width),
        _ => (width, height),
    }
}

/// A configured buffer → chain → buffersink graph. Built lazily from the
/// first frame's geometry; rebuilt when the geometry changes.
pub struct RotationFilter {
    desc: String,
    time_base: Rational,
    graph: Option<filter::Graph>,
    src_format: Pixel,
    src_size: (u32, u32),
}

impl RotationFilter {
    /// `rotation` must already be normalized and nonzero.
    pub fn new(rotation: i32, time_base: Rational) -> Result<RotationFilter> {
        let desc = filter_desc_for_rotation(rotation)
            .ok_or_else(|| anyhow!("rotation {rotation} needs no filter"))?;
        Ok(RotationFilter {
            desc: desc.to_owned(),
            time_base,
            graph: None,
            src_format: Pixel::None,
            src_size: (0, 0),
        })
    }

    fn build_graph(&mut self, frame: &Video) -> Result<()> {
        let format = frame.format();
        let pix_fmt_name = format
            .descriptor()
            .ok_or_else(|| anyhow!("frame has no pixel format"))?
            .name();
        let args = format!(
            "video_size={}x{}:pix_fmt={}:time_base={}/{}:pixel_aspect=1/1",
            frame.width(),
            frame.height(),
            pix_fmt_name,
            self.time_base.numerator(),
            self.time_base.denominator(),
        );

        let mut graph = filter::Graph::new();
        graph
            .add(
                &filter::find("buffer").ok_or_else(|| anyhow!("buffer filter not found"))?,
                "in",
                &args,
            )
            .context("failed to add buffer source")?;
        graph
            .add(
                &filter::find("buffersink")
                    .ok_or_else(|| anyhow!("buffersink filter not found"))?,
                "out",
                "",
            )
            .context("failed to add buffer sink")?;
        graph
            .output("in", 0)?
            .input("out", 0)?
            .parse(&self.desc)
            .with_context(|| format!("failed to parse filter chain '{}'", self.desc))?;
        graph.validate().context("filter graph validation failed")?;

        self.graph = Some(graph);
        self.src_format = format;
        self.src_size = (frame.width(), frame.height());
        Ok(())
    }

    pub fn send_frame(&mut self, frame: &Video) -> Result<()> {
        if self.graph.is_none()
            || self.src_format != frame.format()
            || self.src_size != (frame.width(), frame.height())
        {
            self.build_graph(frame)?;
        }
        let graph = self.graph.as_mut().unwrap();
        graph
            .get("in")
            .ok_or_else(|| anyhow!("buffer source missing from graph"))?
            .source()
            .add(frame)
            .context("failed to feed frame into filter graph")?;
        Ok(())
    }

    pub fn receive_frame(&mut self) -> Result<Video> {
        let graph = match &mut self.graph {
            Some(graph) => graph,
            None => bail!("filter graph not initialized"),
        };
        let mut filtered = Video::empty();
        graph
            .get("out")
            .ok_or_else(|| anyhow!("buffer sink missing from graph"))?
            .sink()
            .frame(&mut filtered)
            .context("failed to pull frame from filter graph")?;
        Ok(filtered)
    }

    /// Convenience single-frame pass.
    pub fn run(&mut self, frame: &Video) -> Result<Video> {
        self.send_frame(frame)?;
        self.receive_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_rotation() {
        assert_eq!(normalize_rotation(0.0), 0);
        assert_eq!(normalize_rotation(90.0), 90);
        assert_eq!(normalize_rotation(-90.0), 270);
        assert_eq!(normalize_rotation(180.0), 180);
        assert_eq!(normalize_rotation(270.0), 270);
        assert_eq!(normalize_rotation(-270.0), 90);
        assert_eq!(normalize_rotation(359.8), 0);
        assert_eq!(normalize_rotation(89.9), 90);
        assert_eq!(normalize_rotation(450.0), 90);
    }

    #[test]
    fn test_filter_desc() {
        assert_eq!(filter_desc_for_rotation(0), None);
        assert_eq!(filter_desc_for_rotation(90), Some("transpose=cclock"));
        assert_eq!(filter_desc_for_rotation(180), Some("hflip,vflip"));
        assert_eq!(filter_desc_for_rotation(270), Some("transpose=clock"));
    }

    #[test]
    fn test_rotated_size() {
        assert_eq!(rotated_size(0, 1920, 1080), (1920, 1080));
        assert_eq!(rotated_size(90, 1920, 1080), (1080, 1920));
        assert_eq!(rotated_size(180, 1920, 1080), (1920, 1080));
        assert_eq!(rotated_size(270, 1920, 1080), (1080, 1920));
    }
}
