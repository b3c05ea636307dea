//! Cache-range and view-window bookkeeping.
//!
//! `CacheRange` is the PTS interval that should hold ready-to-serve frames
//! around the read pointer. `SnapWindow` is the snapshot pipeline's view
//! state derived from a viewer position. `TaskRange` describes one desired
//! span of snapshot indices; per-viewer ranges are aggregated into the
//! minimum set of non-overlapping ranges whose in-view bit is well-defined
//! everywhere.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheRange {
    pub first: i64,
    pub second: i64,
}

impl CacheRange {
    /// Window of `back`/`fwd` frame intervals around `read_pts`, widened by
    /// one tick per side when an interval spans more than one tick so
    /// boundary frames are not evicted by rounding.
    pub fn around(read_pts: i64, back: u32, fwd: u32, interval_pts: i64) -> CacheRange {
        let mut first = read_pts - back as i64 * interval_pts;
        let mut second = read_pts + fwd as i64 * interval_pts;
        if interval_pts > 1 {
            first -= 1;
            second += 1;
        }
        CacheRange { first, second }
    }

    pub fn contains(&self, pts: i64) -> bool {
        pts >= self.first && pts <= self.second
    }
}

/// View state of one snapshot viewer, recomputed on every viewer seek.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapWindow {
    /// Window start position in seconds.
    pub wnd_pos: f64,
    /// Inclusive range of snapshot indices currently visible.
    pub view_idx: (i32, i32),
    /// Inclusive range of snapshot indices to keep cached.
    pub cache_idx: (i32, i32),
    /// Seek points bracketing the cache bounds.
    pub seek_pos00: i64,
    pub seek_pos10: i64,
}

impl SnapWindow {
    pub fn is_in_view(&self, idx: i32) -> bool {
        idx >= self.view_idx.0 && idx <= self.view_idx.1
    }

    pub fn is_in_cache(&self, idx: i32) -> bool {
        idx >= self.cache_idx.0 && idx <= self.cache_idx.1
    }

    pub fn is_pts_in_cache(&self, pts: i64) -> bool {
        pts >= self.seek_pos00 && pts <= self.seek_pos10
    }

    /// Whether moving from `self` to `other` requires a task-list rebuild.
    /// The seek positions participate so a window that keeps its indices
    /// but crosses a newly discovered keyframe still rebuilds.
    pub fn task_range_changed(&self, other: &SnapWindow) -> bool {
        self.view_idx != other.view_idx
            || self.cache_idx != other.cache_idx
            || self.seek_pos00 != other.seek_pos00
            || self.seek_pos10 != other.seek_pos10
    }
}

/// One desired span of snapshot indices (`ss_idx` half-open) produced by a
/// viewer: its visible range or one of its prefetch ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRange {
    pub seek_pts: (i64, i64),
    pub ss_idx: (i32, i32),
    pub in_view: bool,
    pub dist_to_view: i32,
}

impl TaskRange {
    pub fn new(seek_pts: (i64, i64), ss_idx: (i32, i32), in_view: bool) -> TaskRange {
        TaskRange {
            seek_pts,
            ss_idx,
            in_view,
            dist_to_view: if in_view { 0 } else { i32::MAX },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ss_idx.0 >= self.ss_idx.1
    }
}

/// Exact-key aggregation used when tasks are bracketed by real seek points:
/// ranges with identical brackets collapse, in-view wins ties.
pub fn dedupe_ranges(ranges: impl IntoIterator<Item = TaskRange>) -> Vec<TaskRange> {
    let mut total: Vec<TaskRange> = Vec::new();
    for range in ranges {
        match total.iter_mut().find(|r| r.seek_pts == range.seek_pts) {
            Some(existing) => {
                if range.in_view {
                    existing.in_view = true;
                    existing.dist_to_view = 0;
                }
                existing.dist_to_view = existing.dist_to_view.min(range.dist_to_view);
            }
            None => total.push(range),
        }
    }
    total.sort_by_key(|r| r.seek_pts.0);
    total
}

/// Index-interval aggregation used when every index is its own decode unit
/// (image sequences): a boundary sweep unions all viewer ranges, lets the
/// in-view flag dominate wherever any contributing range is visible, and
/// coalesces adjacent same-flag spans, yielding the minimal non-overlapping
/// cover.
pub fn aggregate_index_ranges(ranges: &[TaskRange]) -> Vec<TaskRange> {
    let ranges: Vec<&TaskRange> = ranges.iter().filter(|r| !r.is_empty()).collect();
    if ranges.is_empty() {
        return Vec::new();
    }

    let mut bounds: Vec<i32> = ranges
        .iter()
        .flat_map(|r| [r.ss_idx.0, r.ss_idx.1])
        .collect();
    bounds.sort_unstable();
    bounds.dedup();

    // classify each elementary interval
    let mut pieces: Vec<TaskRange> = Vec::new();
    for win in bounds.windows(2) {
        let (lo, hi) = (win[0], win[1]);
        let covering: Vec<&&TaskRange> = ranges
            .iter()
            .filter(|r| r.ss_idx.0 <= lo && r.ss_idx.1 >= hi)
            .collect();
        if covering.is_empty() {
            continue;
        }
        let in_view = covering.iter().any(|r| r.in_view);
        let seek_first = covering.iter().map(|r| r.seek_pts.0).min().unwrap();
        let seek_second = covering.iter().map(|r| r.seek_pts.1).max().unwrap();
        pieces.push(TaskRange {
            seek_pts: (seek_first, seek_second),
            ss_idx: (lo, hi),
            in_view,
            dist_to_view: if in_view { 0 } else { i32::MAX },
        });
    }

    // coalesce adjacent pieces with the same flag until nothing changes
    let mut coalesced: Vec<TaskRange> = Vec::new();
    for piece in pieces {
        match coalesced.last_mut() {
            Some(last) if last.ss_idx.1 == piece.ss_idx.0 && last.in_view == piece.in_view => {
                last.ss_idx.1 = piece.ss_idx.1;
                last.seek_pts.0 = last.seek_pts.0.min(piece.seek_pts.0);
                last.seek_pts.1 = last.seek_pts.1.max(piece.seek_pts.1);
            }
            _ => coalesced.push(piece),
        }
    }

    // distance of out-of-view spans to the nearest visible edge
    let in_view_spans: Vec<(i32, i32)> = coalesced
        .iter()
        .filter(|r| r.in_view)
        .map(|r| r.ss_idx)
        .collect();
    for range in &mut coalesced {
        if !range.in_view {
            range.dist_to_view = dist_to_nearest_span(range.ss_idx, &in_view_spans);
        }
    }
    coalesced
}

/// Distance of snapshot index `idx` to the nearest in-view range edge.
pub fn dist_to_nearest_in_view(idx: i32, ranges: &[TaskRange]) -> i32 {
    let spans: Vec<(i32, i32)> = ranges
        .iter()
        .filter(|r| r.in_view)
        .map(|r| r.ss_idx)
        .collect();
    dist_to_nearest_span((idx, idx + 1), &spans)
}

fn dist_to_nearest_span(span: (i32, i32), in_view: &[(i32, i32)]) -> i32 {
    let mut best = i32::MAX;
    for &(lo, hi) in in_view {
        if span.1 <= lo {
            best = best.min(lo - span.1 + 1);
        } else if span.0 >= hi {
            best = best.min(span.0 - hi + 1);
        } else {
            return 0;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_range_around() {
        let range = CacheRange::around(1000, 2, 8, 10);
        assert_eq!(range, CacheRange { first: 979, second: 1081 });
        assert!(range.contains(979));
        assert!(range.contains(1081));
        assert!(!range.contains(978));

        // single-tick interval gets no widening
        let tight = CacheRange::around(100, 1, 1, 1);
        assert_eq!(tight, CacheRange { first: 99, second: 101 });
    }

    #[test]
    fn test_snap_window_membership() {
        let wnd = SnapWindow {
            wnd_pos: 0.0,
            view_idx: (10, 20),
            cache_idx: (5, 30),
            seek_pos00: 500,
            seek_pos10: 3000,
        };
        assert!(wnd.is_in_view(10) && wnd.is_in_view(20));
        assert!(!wnd.is_in_view(9) && !wnd.is_in_view(21));
        assert!(wnd.is_in_cache(5) && wnd.is_in_cache(30));
        assert!(wnd.is_pts_in_cache(500) && !wnd.is_pts_in_cache(499));
    }

    fn r(lo: i32, hi: i32, in_view: bool) -> TaskRange {
        TaskRange::new((lo as i64 * 100, hi as i64 * 100), (lo, hi), in_view)
    }

    #[test]
    fn test_dedupe_ranges_in_view_wins() {
        let out = dedupe_ranges([r(0, 4, false), r(0, 4, true), r(4, 8, false)]);
        assert_eq!(out.len(), 2);
        assert!(out[0].in_view);
        assert!(!out[1].in_view);
    }

    #[test]
    fn test_aggregate_same_flag_merges() {
        let out = aggregate_index_ranges(&[r(0, 5, false), r(3, 8, false)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ss_idx, (0, 8));
        assert!(!out[0].in_view);
    }

    #[test]
    fn test_aggregate_in_view_dominates_overlap() {
        let out = aggregate_index_ranges(&[r(0, 10, false), r(4, 6, true)]);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].ss_idx, (0, 4));
        assert!(!out[0].in_view);
        assert_eq!(out[1].ss_idx, (4, 6));
        assert!(out[1].in_view);
        assert_eq!(out[2].ss_idx, (6, 10));
        assert!(!out[2].in_view);
    }

    #[test]
    fn test_aggregate_coalesces_adjacent() {
        let out = aggregate_index_ranges(&[r(0, 3, true), r(3, 6, true), r(6, 9, false)]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].ss_idx, (0, 6));
        assert!(out[0].in_view);
        assert_eq!(out[1].ss_idx, (6, 9));
    }

    #[test]
    fn test_aggregate_disjoint_viewers() {
        let out = aggregate_index_ranges(&[r(0, 2, true), r(10, 12, true), r(2, 4, false)]);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].ss_idx, (0, 2));
        assert_eq!(out[1].ss_idx, (2, 4));
        assert_eq!(out[2].ss_idx, (10, 12));
    }

    #[test]
    fn test_aggregate_distance_weighting() {
        let out = aggregate_index_ranges(&[r(4, 6, true), r(0, 4, false), r(6, 9, false)]);
        let before = out.iter().find(|r| r.ss_idx == (0, 4)).unwrap();
        let after = out.iter().find(|r| r.ss_idx == (6, 9)).unwrap();
        assert_eq!(before.dist_to_view, 1);
        assert_eq!(after.dist_to_view, 1);
    }

    #[test]
    fn test_dist_to_nearest_in_view() {
        let ranges = [r(10, 20, true)];
        assert_eq!(dist_to_nearest_in_view(15, &ranges), 0);
        assert_eq!(dist_to_nearest_in_view(9, &ranges), 1);
        assert_eq!(dist_to_nearest_in_view(5, &ranges), 5);
        assert_eq!(dist_to_nearest_in_view(20, &ranges), 1);
        assert_eq!(dist_to_nearest_in_view(25, &ranges), 6);
    }

    #[test]
    fn test_aggregate_fixed_point_stability() {
        let input = [r(0, 10, false), r(4, 6, true)];
        let once = aggregate_index_ranges(&input);
        let twice = aggregate_index_ranges(&once);
        assert_eq!(once, twice);
    }
}
