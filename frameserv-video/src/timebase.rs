//! Conversion pair between stream PTS and media milliseconds.
//!
//! Two coordinate systems coexist everywhere in the pipelines: integer PTS
//! in the stream's native time base, and integer milliseconds. Display
//! conversions round to nearest; seek-target conversions round toward
//! negative infinity so a target never lands past the requested time.

use ffmpeg::Rational;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
    /// First PTS of the stream; subtracted so position 0ms maps to it.
    pub start_pts: i64,
}

impl TimeBase {
    pub fn new(time_base: Rational, start_pts: i64) -> TimeBase {
        TimeBase {
            num: time_base.numerator(),
            den: time_base.denominator(),
            start_pts,
        }
    }

    /// Round-to-nearest conversion used for display positions.
    pub fn pts_to_millis(&self, pts: i64) -> i64 {
        let num = self.num as i128;
        let den = self.den as i128;
        let x = (pts - self.start_pts) as i128 * num * 1000;
        round_div(x, den) as i64
    }

    /// Floor conversion used for seek targets.
    pub fn millis_to_pts(&self, millis: i64) -> i64 {
        let num = self.num as i128;
        let den = self.den as i128;
        let x = millis as i128 * den;
        floor_div(x, num * 1000) as i64 + self.start_pts
    }

    /// PTS ticks spanned by one frame at `frame_rate`, rounded to nearest,
    /// at least 1.
    pub fn frame_interval_pts(&self, frame_rate: Rational) -> i64 {
        let fr_num = frame_rate.numerator() as i128;
        let fr_den = frame_rate.denominator() as i128;
        if fr_num == 0 || self.num == 0 {
            return 1;
        }
        let x = fr_den * self.den as i128;
        let y = fr_num * self.num as i128;
        (round_div(x, y) as i64).max(1)
    }
}

fn round_div(x: i128, y: i128) -> i128 {
    debug_assert!(y > 0);
    if x >= 0 {
        (x + y / 2) / y
    } else {
        (x - y / 2) / y
    }
}

fn floor_div(x: i128, y: i128) -> i128 {
    debug_assert!(y > 0);
    let q = x / y;
    if x % y != 0 && x < 0 {
        q - 1
    } else {
        q
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tb_90k() -> TimeBase {
        TimeBase::new(Rational::new(1, 90000), 0)
    }

    #[test]
    fn test_pts_to_millis_rounds_to_nearest() {
        let tb = tb_90k();
        assert_eq!(tb.pts_to_millis(90000), 1000);
        // 45 ticks = 0.5ms, rounds up
        assert_eq!(tb.pts_to_millis(45), 1);
        assert_eq!(tb.pts_to_millis(44), 0);
    }

    #[test]
    fn test_millis_to_pts_floors() {
        let tb = tb_90k();
        assert_eq!(tb.millis_to_pts(1000), 90000);
        assert_eq!(tb.millis_to_pts(1), 90);
        // 1/90000 tick per 1/90 ms; floor keeps the target at or before
        let tb25 = TimeBase::new(Rational::new(1, 25), 0);
        assert_eq!(tb25.millis_to_pts(39), 0);
        assert_eq!(tb25.millis_to_pts(40), 1);
        assert_eq!(tb25.millis_to_pts(79), 1);
    }

    #[test]
    fn test_start_pts_offset() {
        let tb = TimeBase::new(Rational::new(1, 1000), 500);
        assert_eq!(tb.pts_to_millis(500), 0);
        assert_eq!(tb.millis_to_pts(0), 500);
        assert_eq!(tb.pts_to_millis(1500), 1000);
        assert_eq!(tb.millis_to_pts(1000), 1500);
    }

    #[test]
    fn test_negative_position() {
        let tb = TimeBase::new(Rational::new(1, 1000), 0);
        assert_eq!(tb.millis_to_pts(-1), -1);
        assert_eq!(tb.pts_to_millis(-1), -1);
    }

    #[test]
    fn test_frame_interval() {
        let tb = tb_90k();
        assert_eq!(tb.frame_interval_pts(Rational::new(30, 1)), 3000);
        assert_eq!(tb.frame_interval_pts(Rational::new(30000, 1001)), 3003);
        let tb25 = TimeBase::new(Rational::new(1, 25), 0);
        assert_eq!(tb25.frame_interval_pts(Rational::new(25, 1)), 1);
    }

    #[test]
    fn test_round_trip_display() {
        let tb = tb_90k();
        for pts in [0i64, 3000, 3003, 89999, 90001] {
            let ms = tb.pts_to_millis(pts);
            let back = tb.millis_to_pts(ms);
            assert!(back <= pts, "seek conversion must not overshoot");
            assert!(pts - back < 90, "within one millisecond of ticks");
        }
    }
}
