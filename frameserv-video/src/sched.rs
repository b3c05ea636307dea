//! Task list shared by the three worker classes.
//!
//! The list is kept in presentation order and published under three locks,
//! one per worker class, so the demuxer, decoder and post-processor can
//! each take a stable snapshot without contending with one another.
//! Publishing takes all three locks.

use std::{
    cmp::Ordering,
    sync::{Arc, Mutex},
};

use tracing::debug;

use crate::{
    seek_points::SeekPointTable,
    task::{GopDecodeTask, TaskHandle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerClass {
    Demux = 0,
    Decode = 1,
    PostProcess = 2,
}

#[derive(Default)]
pub struct TaskList {
    slots: [Mutex<Arc<Vec<TaskHandle>>>; 3],
}

impl TaskList {
    pub fn new() -> TaskList {
        TaskList::default()
    }

    /// Replace the published list. Takes every class lock, in index order.
    pub fn publish(&self, tasks: Vec<TaskHandle>) {
        let shared = Arc::new(tasks);
        let mut g0 = self.slots[0].lock().unwrap();
        let mut g1 = self.slots[1].lock().unwrap();
        let mut g2 = self.slots[2].lock().unwrap();
        *g0 = shared.clone();
        *g1 = shared.clone();
        *g2 = shared;
    }

    pub fn snapshot(&self, class: WorkerClass) -> Arc<Vec<TaskHandle>> {
        self.slots[class as usize].lock().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot(WorkerClass::Demux).is_empty()
    }
}

/// Ranks tasks for worker pickup. Lower ranks first.
pub trait TaskPriority {
    fn rank(&self, task: &GopDecodeTask) -> (u8, i64);

    fn cmp(&self, a: &GopDecodeTask, b: &GopDecodeTask) -> Ordering {
        self.rank(a).cmp(&self.rank(b))
    }
}

/// Random-access reader priority: the GOP under the read pointer first,
/// then GOPs ahead of it in the read direction by proximity, then GOPs
/// behind it by proximity. Backward mode mirrors the arithmetic.
pub struct VideoPriority {
    pub show_gop_pts: i64,
    pub forward: bool,
}

impl TaskPriority for VideoPriority {
    fn rank(&self, task: &GopDecodeTask) -> (u8, i64) {
        let first = task.seek_pts().0;
        if first == self.show_gop_pts {
            return (0, 0);
        }
        let ahead = if self.forward {
            first > self.show_gop_pts
        } else {
            first < self.show_gop_pts
        };
        let dist = (first - self.show_gop_pts).abs();
        if ahead {
            (1, dist)
        } else {
            (2, dist)
        }
    }
}

/// Snapshot priority: in-view tasks in list order, out-of-view tasks by
/// distance to the view-window edge.
pub struct SnapshotPriority;

impl TaskPriority for SnapshotPriority {
    fn rank(&self, task: &GopDecodeTask) -> (u8, i64) {
        if task.is_in_view() {
            (0, task.seek_pts().0)
        } else {
            (1, task.dist_to_view() as i64)
        }
    }
}

fn find_best<F>(tasks: &[TaskHandle], priority: &dyn TaskPriority, eligible: F) -> Option<TaskHandle>
where
    F: Fn(&GopDecodeTask) -> bool,
{
    let mut best: Option<&TaskHandle> = None;
    for task in tasks {
        if task.is_cancelled() || !eligible(task) {
            continue;
        }
        match best {
            Some(current) if priority.cmp(current, task) != Ordering::Greater => {}
            _ => best = Some(task),
        }
    }
    best.cloned()
}

/// Highest-priority task the demuxer should fill next.
/// `max_pending_decode` bounds the demuxed-but-undecoded backlog; exceeding
/// it makes the demuxer wait for the decoder to catch up.
pub fn find_next_demux_task(
    tasks: &[TaskHandle],
    priority: &dyn TaskPriority,
    max_pending_decode: Option<usize>,
) -> Option<TaskHandle> {
    if let Some(cap) = max_pending_decode {
        let pending = tasks
            .iter()
            .filter(|t| !t.is_cancelled() && t.is_demuxing() && !t.is_decoding())
            .count();
        if pending > cap {
            return None;
        }
    }
    find_best(tasks, priority, |t| !t.is_demuxing())
}

/// Highest-priority task with demuxed input the decoder has not consumed,
/// or one flagged for redo.
pub fn find_next_decode_task(
    tasks: &[TaskHandle],
    priority: &dyn TaskPriority,
) -> Option<TaskHandle> {
    find_best(tasks, priority, |t| {
        t.is_demuxing() && (!t.is_decoding() || t.redo_requested())
    })
}

/// Highest-priority task holding decoded frames awaiting post-processing.
pub fn find_next_postprocess_task(
    tasks: &[TaskHandle],
    priority: &dyn TaskPriority,
) -> Option<TaskHandle> {
    find_best(tasks, priority, |t| {
        t.decoded_frame_count() > 0 && !t.redo_requested()
    })
}

/// Diff the current video task list against a new cache range
/// `[begin_pts, end_pts]`: keep tasks whose bracket is still wanted, cancel
/// the rest, create tasks for newly covered GOPs. Returns the new list in
/// time order.
pub fn rebuild_video_tasks(
    existing: &[TaskHandle],
    seek_points: &SeekPointTable,
    begin_pts: i64,
    end_pts: i64,
) -> Vec<TaskHandle> {
    let mut wanted_brackets = Vec::new();
    let (mut first, mut second) = seek_points.bracket(begin_pts);
    loop {
        wanted_brackets.push((first, second));
        if second == i64::MAX || second > end_pts {
            break;
        }
        let next = seek_points.bracket(second);
        first = next.0;
        second = next.1;
    }

    let mut new_list = Vec::with_capacity(wanted_brackets.len());
    for bracket in wanted_brackets {
        match existing.iter().find(|t| t.seek_pts().0 == bracket.0) {
            Some(task) => new_list.push(task.clone()),
            None => new_list.push(Arc::new(GopDecodeTask::new(bracket))),
        }
    }
    for task in existing {
        if !new_list.iter().any(|t| Arc::ptr_eq(t, task)) {
            debug!(seek_pts = ?task.seek_pts(), "cancel task outside cache range");
            task.cancel();
        }
    }
    new_list
}

/// After the demuxer hits container EOF inside `eof_task`, every task that
/// starts past the media end can never produce frames.
pub fn cancel_tasks_past_eof(tasks: &[TaskHandle], eof_task: &GopDecodeTask) {
    let eof_start = eof_task.seek_pts().0;
    for task in tasks {
        if task.seek_pts().0 > eof_start {
            debug!(seek_pts = ?task.seek_pts(), "cancel task past media end");
            task.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(first: i64, second: i64) -> TaskHandle {
        Arc::new(GopDecodeTask::new((first, second)))
    }

    fn pts_of(list: &[TaskHandle]) -> Vec<i64> {
        list.iter().map(|t| t.seek_pts().0).collect()
    }

    #[test]
    fn test_publish_and_snapshot_per_class() {
        let list = TaskList::new();
        list.publish(vec![task(0, 100), task(100, 200)]);
        for class in [WorkerClass::Demux, WorkerClass::Decode, WorkerClass::PostProcess] {
            assert_eq!(list.snapshot(class).len(), 2);
        }
    }

    #[test]
    fn test_video_priority_forward() {
        let pri = VideoPriority { show_gop_pts: 300, forward: true };
        let tasks = vec![task(0, 100), task(100, 300), task(300, 500), task(500, 700)];
        let next = find_next_demux_task(&tasks, &pri, None).unwrap();
        assert_eq!(next.seek_pts().0, 300);
        next.begin_demuxing();
        // ahead-of-pointer GOP beats behind-pointer GOPs
        let next = find_next_demux_task(&tasks, &pri, None).unwrap();
        assert_eq!(next.seek_pts().0, 500);
        next.begin_demuxing();
        let next = find_next_demux_task(&tasks, &pri, None).unwrap();
        assert_eq!(next.seek_pts().0, 100);
    }

    #[test]
    fn test_video_priority_backward() {
        let pri = VideoPriority { show_gop_pts: 300, forward: false };
        let tasks = vec![task(0, 100), task(100, 300), task(300, 500), task(500, 700)];
        tasks[2].begin_demuxing();
        // behind the pointer (lower pts) is "ahead" in backward mode
        let next = find_next_demux_task(&tasks, &pri, None).unwrap();
        assert_eq!(next.seek_pts().0, 100);
    }

    #[test]
    fn test_snapshot_priority_prefers_in_view_then_distance() {
        let make = |first, in_view, dist| {
            let t = Arc::new(GopDecodeTask::new_snapshot(
                (first, first + 100),
                (0, 1),
                in_view,
                dist,
                100,
            ));
            t
        };
        let tasks = vec![make(0, false, 4), make(100, true, 0), make(200, false, 1)];
        let next = find_next_demux_task(&tasks, &SnapshotPriority, None).unwrap();
        assert_eq!(next.seek_pts().0, 100);
        next.begin_demuxing();
        let next = find_next_demux_task(&tasks, &SnapshotPriority, None).unwrap();
        assert_eq!(next.seek_pts().0, 200);
    }

    #[test]
    fn test_demux_backlog_cap() {
        let tasks = vec![task(0, 100), task(100, 200), task(200, 300)];
        tasks[0].begin_demuxing();
        tasks[1].begin_demuxing();
        let pri = VideoPriority { show_gop_pts: 0, forward: true };
        assert!(find_next_demux_task(&tasks, &pri, Some(1)).is_none());
        assert!(find_next_demux_task(&tasks, &pri, Some(2)).is_some());
    }

    #[test]
    fn test_decode_task_requires_demuxed_input() {
        let tasks = vec![task(0, 100)];
        let pri = VideoPriority { show_gop_pts: 0, forward: true };
        assert!(find_next_decode_task(&tasks, &pri).is_none());
        tasks[0].begin_demuxing();
        assert!(find_next_decode_task(&tasks, &pri).is_some());
        assert!(tasks[0].begin_decoding());
        assert!(find_next_decode_task(&tasks, &pri).is_none());
        tasks[0].request_redo();
        assert!(find_next_decode_task(&tasks, &pri).is_some());
    }

    #[test]
    fn test_rebuild_keeps_overlap_cancels_rest() {
        let table = SeekPointTable::from_points(vec![0, 100, 200, 300, 400]);
        let old = rebuild_video_tasks(&[], &table, 0, 250);
        assert_eq!(pts_of(&old), vec![0, 100, 200]);

        let new = rebuild_video_tasks(&old, &table, 150, 350);
        assert_eq!(pts_of(&new), vec![100, 200, 300]);
        // shared brackets are the same task objects
        assert!(Arc::ptr_eq(&old[1], &new[0]));
        assert!(Arc::ptr_eq(&old[2], &new[1]));
        // the dropped head task got cancelled
        assert!(old[0].is_cancelled());
        assert!(!new.iter().any(|t| t.is_cancelled()));
    }

    #[test]
    fn test_rebuild_last_gop_open_ended() {
        let table = SeekPointTable::from_points(vec![0, 100]);
        let tasks = rebuild_video_tasks(&[], &table, 50, 500);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].seek_pts(), (100, i64::MAX));
    }

    #[test]
    fn test_cancel_tasks_past_eof() {
        let tasks = vec![task(0, 100), task(100, 200), task(200, 300)];
        cancel_tasks_past_eof(&tasks, &tasks[1]);
        assert!(!tasks[0].is_cancelled());
        assert!(!tasks[1].is_cancelled());
        assert!(tasks[2].is_cancelled());
    }
}
