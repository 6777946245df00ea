//! The background work queue.
//!
//! One worker thread per UBI instance drains a FIFO of tagged work items:
//! erases, wear-levelling passes, consolidation packs, and fastmap
//! rewrites. Items carry the volume/LEB they affect so that [flush] can
//! wait for exactly the work that matters to a caller. Shutdown drains the
//! queue without executing it; the detach path flushes first when it wants
//! the work done.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use log::debug;

use crate::{conso, fastmap, wl, UbiDevice};

/// Sentinel matching every volume or every LEB in [flush]
pub const ALL: u32 = u32::MAX;

/// The kinds of background work
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Work {
    /// Erase a PEB (optionally torturing it) and return it to the free pool
    Erase { pnum: u32, torture: bool },

    /// Run one wear-levelling / scrubbing pass
    Move,

    /// Pack SLC-written LEBs of the volume into an MLC-safe PEB
    Consolidate { vol_id: u32 },

    /// Write a fresh fastmap checkpoint
    FastmapWrite,
}

/// A queued work item, tagged with the volume/LEB it affects (or [ALL])
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub kind: Work,
    pub vol_id: u32,
    pub lnum: u32,
}

#[derive(Default)]
struct Wq {
    queue: VecDeque<WorkItem>,
    in_flight: Option<(u32, u32)>,
    shutdown: bool,
    enabled: bool,
}

/// The queue shared between producers, the worker thread, and flushers
pub struct WorkQueue {
    inner: Mutex<Wq>,

    /// Wakes the worker when work arrives or the queue state changes
    work_cond: Condvar,

    /// Wakes flushers when an item completes
    done_cond: Condvar,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Wq {
                enabled: true,
                ..Default::default()
            }),
            work_cond: Condvar::new(),
            done_cond: Condvar::new(),
        }
    }
}

fn affects(item_vol: u32, item_lnum: u32, vol_id: u32, lnum: u32) -> bool {
    (vol_id == ALL || item_vol == ALL || item_vol == vol_id)
        && (lnum == ALL || item_lnum == ALL || item_lnum == lnum)
}

impl WorkQueue {
    /// Enqueue a work item. Returns false when the queue is shutting down
    /// and the item was dropped.
    pub fn push(&self, item: WorkItem) -> bool {
        let mut wq = self.inner.lock().unwrap();
        if wq.shutdown {
            return false;
        }
        wq.queue.push_back(item);
        self.work_cond.notify_one();
        true
    }

    /// Is a matching item queued or currently executing?
    pub fn has_pending(&self, vol_id: u32, lnum: u32) -> bool {
        let wq = self.inner.lock().unwrap();
        wq.queue
            .iter()
            .any(|i| affects(i.vol_id, i.lnum, vol_id, lnum))
            || wq
                .in_flight
                .map(|(v, l)| affects(v, l, vol_id, lnum))
                .unwrap_or(false)
    }

    /// How many items wait in the queue
    pub fn backlog(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Pause or resume the worker. While paused, items queue up but nothing
    /// executes; tests use this to freeze the device at a precise point.
    pub fn enable(&self, on: bool) {
        let mut wq = self.inner.lock().unwrap();
        wq.enabled = on;
        self.work_cond.notify_all();
    }

    /// Wait until no queued or in-flight work affects `(vol_id, lnum)`.
    /// Pass [ALL] for either to widen the match.
    pub fn flush(&self, vol_id: u32, lnum: u32) {
        let mut wq = self.inner.lock().unwrap();
        loop {
            let pending = wq
                .queue
                .iter()
                .any(|i| affects(i.vol_id, i.lnum, vol_id, lnum))
                || wq
                    .in_flight
                    .map(|(v, l)| affects(v, l, vol_id, lnum))
                    .unwrap_or(false);
            if !pending || wq.shutdown {
                return;
            }
            wq = self.done_cond.wait(wq).unwrap();
        }
    }

    /// Stop accepting work and drop whatever is still queued. The worker
    /// thread exits once its current item finishes.
    pub fn shutdown(&self) {
        let mut wq = self.inner.lock().unwrap();
        wq.shutdown = true;
        let dropped = wq.queue.len();
        wq.queue.clear();
        if dropped > 0 {
            debug!("dropped {dropped} queued work items at shutdown");
        }
        self.work_cond.notify_all();
        self.done_cond.notify_all();
    }
}

/// The worker thread body: pop, execute, signal, repeat until shutdown
pub fn run(dev: Arc<UbiDevice>) {
    loop {
        let item = {
            let mut wq = dev.work.inner.lock().unwrap();
            loop {
                if wq.shutdown {
                    return;
                }
                if wq.enabled {
                    if let Some(item) = wq.queue.pop_front() {
                        wq.in_flight = Some((item.vol_id, item.lnum));
                        break item;
                    }
                }
                wq = dev.work.work_cond.wait(wq).unwrap();
            }
        };

        execute(&dev, &item);

        let mut wq = dev.work.inner.lock().unwrap();
        wq.in_flight = None;
        dev.work.done_cond.notify_all();
    }
}

fn execute(dev: &UbiDevice, item: &WorkItem) {
    debug!("executing {:?}", item.kind);
    match item.kind {
        Work::Erase { pnum, torture } => wl::do_erase(dev, pnum, torture, item.vol_id, item.lnum),
        Work::Move => wl::do_move(dev),
        Work::Consolidate { vol_id } => conso::do_consolidate(dev, vol_id),
        Work::FastmapWrite => {
            dev.fm.take_scheduled();
            if let Err(e) = fastmap::update(dev) {
                log::warn!("background fastmap update failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_affects_matching() {
        assert!(affects(1, 2, 1, 2));
        assert!(!affects(1, 2, 1, 3));
        assert!(!affects(1, 2, 2, 2));
        assert!(affects(1, 2, ALL, ALL));
        assert!(affects(ALL, ALL, 1, 2));
        assert!(affects(1, ALL, 1, 7));
    }

    #[test]
    fn test_queue_shutdown_drops_items() {
        let q = WorkQueue::default();
        assert!(q.push(WorkItem {
            kind: Work::Move,
            vol_id: ALL,
            lnum: ALL,
        }));
        assert_eq!(q.backlog(), 1);

        q.shutdown();
        assert_eq!(q.backlog(), 0);
        assert!(!q.push(WorkItem {
            kind: Work::Move,
            vol_id: ALL,
            lnum: ALL,
        }));

        // flush after shutdown must not hang
        q.flush(ALL, ALL);
    }
}
