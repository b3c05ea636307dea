//! Keyframe PTS table shared by the parser and the demuxer.
//!
//! The parser seeds the table during info parsing; the demuxer appends
//! better candidates it observes after seeks. Single writer at a time,
//! many readers: appends happen under a short lock, readers snapshot the
//! current contents and work on the copy.
//!
//! Invariant: strictly increasing, first entry at or before the stream
//! start, last entry at or before the last PTS seen.

use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
pub struct SeekPointTable {
    points: Arc<Mutex<Vec<i64>>>,
}

impl SeekPointTable {
    pub fn new() -> SeekPointTable {
        SeekPointTable::default()
    }

    pub fn from_points(points: Vec<i64>) -> SeekPointTable {
        let table = SeekPointTable::new();
        table.merge_parsed(&points);
        table
    }

    pub fn is_empty(&self) -> bool {
        self.points.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.lock().unwrap().len()
    }

    pub fn first(&self) -> Option<i64> {
        self.points.lock().unwrap().first().copied()
    }

    pub fn last(&self) -> Option<i64> {
        self.points.lock().unwrap().last().copied()
    }

    pub fn snapshot(&self) -> Vec<i64> {
        self.points.lock().unwrap().clone()
    }

    /// Merge a parser-produced sorted list into the table, keeping any
    /// points already observed by the demuxer that the parser missed.
    pub fn merge_parsed(&self, parsed: &[i64]) {
        let mut points = self.points.lock().unwrap();
        let mut merged = parsed.to_vec();
        for &pts in points.iter() {
            match merged.binary_search(&pts) {
                Ok(_) => {}
                Err(idx) => merged.insert(idx, pts),
            }
        }
        *points = merged;
    }

    /// Record a keyframe PTS observed by the demuxer. Returns true when the
    /// point was new.
    pub fn insert_observed(&self, pts: i64) -> bool {
        let mut points = self.points.lock().unwrap();
        match points.binary_search(&pts) {
            Ok(_) => false,
            Err(idx) => {
                points.insert(idx, pts);
                true
            }
        }
    }

    /// Greatest seek point at or before `target` and its successor.
    /// The successor is `i64::MAX` past the last entry. Targets before the
    /// first entry bracket to the first entry itself.
    pub fn bracket(&self, target: i64) -> (i64, i64) {
        let points = self.points.lock().unwrap();
        bracket_in(&points, target)
    }

    /// `bracket` with half a frame interval of slack: a target landing
    /// within `tolerance` before a seek point snaps forward onto it.
    pub fn bracket_with_tolerance(&self, target: i64, tolerance: i64) -> (i64, i64) {
        let points = self.points.lock().unwrap();
        let (first, second) = bracket_in(&points, target);
        if second != i64::MAX && second - target <= tolerance {
            let after = match points.binary_search(&second) {
                Ok(idx) | Err(idx) => points.get(idx + 1).copied().unwrap_or(i64::MAX),
            };
            (second, after)
        } else {
            (first, second)
        }
    }
}

fn bracket_in(points: &[i64], target: i64) -> (i64, i64) {
    assert!(!points.is_empty(), "seek point table is empty");
    match points.binary_search(&target) {
        Ok(idx) => (
            points[idx],
            points.get(idx + 1).copied().unwrap_or(i64::MAX),
        ),
        Err(0) => (points[0], points.get(1).copied().unwrap_or(i64::MAX)),
        Err(idx) => (
            points[idx - 1],
            points.get(idx).copied().unwrap_or(i64::MAX),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bracket() {
        let table = SeekPointTable::from_points(vec![0, 300, 600, 900]);
        assert_eq!(table.bracket(0), (0, 300));
        assert_eq!(table.bracket(299), (0, 300));
        assert_eq!(table.bracket(300), (300, 600));
        assert_eq!(table.bracket(899), (600, 900));
        assert_eq!(table.bracket(900), (900, i64::MAX));
        assert_eq!(table.bracket(5000), (900, i64::MAX));
    }

    #[test]
    fn test_bracket_before_first() {
        let table = SeekPointTable::from_points(vec![100, 400]);
        assert_eq!(table.bracket(-50), (100, 400));
        assert_eq!(table.bracket(50), (100, 400));
    }

    #[test]
    fn test_bracket_tolerance_snaps_forward() {
        let table = SeekPointTable::from_points(vec![0, 300, 600]);
        // target 299 with half-frame slack 2 snaps onto 300
        assert_eq!(table.bracket_with_tolerance(299, 2), (300, 600));
        assert_eq!(table.bracket_with_tolerance(297, 2), (0, 300));
        assert_eq!(table.bracket_with_tolerance(599, 2), (600, i64::MAX));
    }

    #[test]
    fn test_insert_observed_keeps_sorted() {
        let table = SeekPointTable::from_points(vec![0, 600]);
        assert!(table.insert_observed(300));
        assert!(!table.insert_observed(300));
        assert_eq!(table.snapshot(), vec![0, 300, 600]);
    }

    #[test]
    fn test_merge_parsed_keeps_observed() {
        let table = SeekPointTable::new();
        table.insert_observed(450);
        table.merge_parsed(&[0, 300, 600]);
        assert_eq!(table.snapshot(), vec![0, 300, 450, 600]);
    }

    #[test]
    fn test_strictly_increasing_after_random_inserts() {
        let table = SeekPointTable::from_points(vec![0]);
        for pts in [700, 100, 400, 100, 0, 900] {
            table.insert_observed(pts);
        }
        let snap = table.snapshot();
        assert!(snap.windows(2).all(|w| w[0] < w[1]));
    }
}
