//! The wear-levelling engine.
//!
//! Every live PEB is tracked in exactly one place: the free, used, scrub or
//! erroneous set (ordered by erase counter, ties broken by pnum), the
//! protection-queue ring, one of the two allocation pools, or — transiently —
//! the lookup table alone while a move or erase owns it. The lookup table
//! itself is a flat vector indexed by pnum, so the sets and queues only ever
//! hold indices.
//!
//! Allocation is pool-based: between two fastmap checkpoints, every PEB is
//! dispensed from the user pool (callers) or the wl pool (the move worker).
//! When a pool runs dry a fresh fastmap is written, which refills both.
//! With fastmap disabled the pools refill straight from the free set.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use log::{debug, warn};

use crate::eba::{self, MoveError};
use crate::fastmap::{self, FM_MAX_BLOCKS};
use crate::headers::Ec;
use crate::io::{HdrRead, IO_RETRIES};
use crate::work::{Work, WorkItem, ALL};
use crate::{Error, UbiDevice};

/// Depth of the protection-queue ring: a freshly allocated PEB is shielded
/// from move-source selection for this many subsequent allocations
pub const PROT_QUEUE_LEN: usize = 10;

/// Default EC gap between the fleet maximum and the coldest used PEB that
/// triggers a wear-levelling move
pub const WL_THRESHOLD: u64 = 4096;

/// Erase counters beyond this are treated as a dying device
pub const MAX_ERASECOUNTER: u64 = 0x7FFF_FFFF;

/// Smallest and largest allocation-pool sizes
pub const MIN_POOL_SIZE: usize = 8;
pub const MAX_POOL_SIZE: usize = 256;

/// Where a PEB currently lives
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
enum PebState {
    Free,
    Pool,
    Used,
    Scrub,
    Erroneous,
    Protected,
    Erasing,
    Moving,
    /// Holds a live fastmap checkpoint
    Fm,
}

#[derive(Debug, Copy, Clone)]
struct WlEntry {
    ec: u64,
    state: PebState,
}

/// How attach seeds a PEB into the engine
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum SeedState {
    Free,
    Used,
    Scrub,
    /// Known-unreadable data, kept out of circulation
    Erroneous,
    /// Part of the live fastmap checkpoint
    Fastmap,
    /// Queue for erasure right away (stale duplicate, corrupt VID, …)
    Erase { torture: bool },
}

pub(crate) struct WlState {
    tab: Vec<Option<WlEntry>>,
    free: BTreeSet<(u64, u32)>,
    used: BTreeSet<(u64, u32)>,
    scrub: BTreeSet<(u64, u32)>,
    erroneous: BTreeSet<(u64, u32)>,

    pq: [Vec<u32>; PROT_QUEUE_LEN],
    pq_head: usize,

    user_pool: VecDeque<u32>,
    wl_pool: VecDeque<u32>,
    pool_max: usize,
    wl_pool_max: usize,

    max_ec: u64,
    pending_erases: usize,
    wl_scheduled: bool,
    max_erroneous: usize,
}

pub struct Wl {
    state: Mutex<WlState>,

    /// Wakes allocators when an erase completes and frees a PEB
    free_cond: Condvar,

    /// Serialises moves
    move_mutex: Mutex<()>,

    /// Completed wear-levelling/scrub copies
    pub moves: AtomicU64,
}

impl Wl {
    pub fn new(peb_count: u32) -> Self {
        let pool_max = (peb_count as usize / 8).clamp(MIN_POOL_SIZE, MAX_POOL_SIZE);
        Self {
            state: Mutex::new(WlState {
                tab: (0..peb_count).map(|_| None).collect(),
                free: BTreeSet::new(),
                used: BTreeSet::new(),
                scrub: BTreeSet::new(),
                erroneous: BTreeSet::new(),
                pq: Default::default(),
                pq_head: 0,
                user_pool: VecDeque::new(),
                wl_pool: VecDeque::new(),
                pool_max,
                wl_pool_max: (pool_max / 2).max(2),
                max_ec: 0,
                pending_erases: 0,
                wl_scheduled: false,
                max_erroneous: (peb_count as usize / 10).max(1),
            }),
            free_cond: Condvar::new(),
            move_mutex: Mutex::new(()),
            moves: AtomicU64::new(0),
        }
    }

    /// Install one PEB into the engine during attach
    pub fn seed(&self, dev: &UbiDevice, pnum: u32, ec: u64, state: SeedState) {
        let mut st = self.state.lock().unwrap();
        st.max_ec = st.max_ec.max(ec);
        match state {
            SeedState::Free => {
                st.tab[pnum as usize] = Some(WlEntry {
                    ec,
                    state: PebState::Free,
                });
                st.free.insert((ec, pnum));
            }
            SeedState::Used => {
                st.tab[pnum as usize] = Some(WlEntry {
                    ec,
                    state: PebState::Used,
                });
                st.used.insert((ec, pnum));
            }
            SeedState::Scrub => {
                st.tab[pnum as usize] = Some(WlEntry {
                    ec,
                    state: PebState::Scrub,
                });
                st.scrub.insert((ec, pnum));
            }
            SeedState::Erroneous => {
                st.tab[pnum as usize] = Some(WlEntry {
                    ec,
                    state: PebState::Erroneous,
                });
                st.erroneous.insert((ec, pnum));
            }
            SeedState::Fastmap => {
                st.tab[pnum as usize] = Some(WlEntry {
                    ec,
                    state: PebState::Fm,
                });
            }
            SeedState::Erase { torture } => {
                st.tab[pnum as usize] = Some(WlEntry {
                    ec,
                    state: PebState::Erasing,
                });
                st.pending_erases += 1;
                drop(st);
                dev.work.push(WorkItem {
                    kind: Work::Erase { pnum, torture },
                    vol_id: ALL,
                    lnum: ALL,
                });
            }
        }
    }

    /// Fleet-wide (min, max) erase counters over live PEBs
    pub fn ec_bounds(&self) -> (u64, u64) {
        let st = self.state.lock().unwrap();
        let mut min = u64::MAX;
        let mut max = 0;
        for entry in st.tab.iter().flatten() {
            min = min.min(entry.ec);
            max = max.max(entry.ec);
        }
        (if min == u64::MAX { 0 } else { min }, max)
    }

    pub fn erroneous_count(&self) -> usize {
        self.state.lock().unwrap().erroneous.len()
    }

    pub fn free_count(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.free.len() + st.user_pool.len() + st.wl_pool.len()
    }

    pub fn pending_erases(&self) -> usize {
        self.state.lock().unwrap().pending_erases
    }
}

fn mean_ec(st: &WlState) -> u64 {
    let mut sum = 0u64;
    let mut count = 0u64;
    for entry in st.tab.iter().flatten() {
        sum += entry.ec;
        count += 1;
    }
    (sum + count / 2).checked_div(count).unwrap_or(0)
}

/// The free PEB that fastmap wants preserved for its next superblock: the
/// lowest-numbered free PEB within the superblock search range
fn anchor_candidate(st: &WlState) -> Option<u32> {
    st.free
        .iter()
        .map(|&(_, pnum)| pnum)
        .filter(|&pnum| pnum < FM_MAX_BLOCKS)
        .min()
}

/// Take the free entry with the median erase counter. Ties share the same
/// `(ec, pnum)` ordering, so the pick is deterministic.
fn take_median_free(st: &mut WlState, skip: Option<u32>) -> Option<(u64, u32)> {
    let candidates: Vec<(u64, u32)> = st
        .free
        .iter()
        .copied()
        .filter(|&(_, pnum)| Some(pnum) != skip)
        .collect();
    if candidates.is_empty() {
        return None;
    }
    let pick = candidates[candidates.len() / 2];
    st.free.remove(&pick);
    Some(pick)
}

/// Take the free entry whose erase counter is closest to `target`
fn take_near_ec_free(st: &mut WlState, target: u64, skip: Option<u32>) -> Option<(u64, u32)> {
    let pick = st
        .free
        .iter()
        .copied()
        .filter(|&(_, pnum)| Some(pnum) != skip)
        .min_by_key(|&(ec, pnum)| (ec.abs_diff(target), pnum))?;
    st.free.remove(&pick);
    Some(pick)
}

/// Refill both pools from the free set, leaving the fastmap anchor alone.
/// Returns true if anything was added.
pub(crate) fn refill_pools_locked(dev: &UbiDevice, st: &mut WlState) -> bool {
    let anchor = if dev.fm.is_enabled() {
        anchor_candidate(st)
    } else {
        None
    };
    let mean = mean_ec(st);
    let mut progress = false;

    while st.user_pool.len() < st.pool_max {
        let Some((ec, pnum)) = take_median_free(st, anchor) else {
            break;
        };
        st.tab[pnum as usize] = Some(WlEntry {
            ec,
            state: PebState::Pool,
        });
        st.user_pool.push_back(pnum);
        progress = true;
    }

    while st.wl_pool.len() < st.wl_pool_max {
        let Some((ec, pnum)) = take_near_ec_free(st, mean, anchor) else {
            break;
        };
        st.tab[pnum as usize] = Some(WlEntry {
            ec,
            state: PebState::Pool,
        });
        st.wl_pool.push_back(pnum);
        progress = true;
    }

    progress
}

/// Advance the protection-queue ring by one step, draining the bucket that
/// comes due into the used (or scrub) set
fn serve_prot_queue(st: &mut WlState) {
    let head = st.pq_head;
    st.pq_head = (st.pq_head + 1) % PROT_QUEUE_LEN;
    let evicted = std::mem::take(&mut st.pq[head]);
    for pnum in evicted {
        let entry = st.tab[pnum as usize].as_mut().expect("protected PEB vanished");
        match entry.state {
            PebState::Protected => {
                entry.state = PebState::Used;
                let ec = entry.ec;
                st.used.insert((ec, pnum));
            }
            PebState::Scrub => {
                let ec = entry.ec;
                st.scrub.insert((ec, pnum));
            }
            // Reclaimed by an erase while it sat in the ring
            _ => {}
        }
    }
}

fn protect(st: &mut WlState, pnum: u32) {
    let tail = (st.pq_head + PROT_QUEUE_LEN - 1) % PROT_QUEUE_LEN;
    st.pq[tail].push(pnum);
}

fn remove_from_pq(st: &mut WlState, pnum: u32) {
    for bucket in st.pq.iter_mut() {
        bucket.retain(|&p| p != pnum);
    }
}

enum AllocAction {
    Got(u32, u64),
    Wait,
    Fastmap,
    Refill,
    Fail,
}

fn alloc_from(
    dev: &UbiDevice,
    st: &mut WlState,
    wl_pool: bool,
    tick: bool,
) -> AllocAction {
    if tick {
        serve_prot_queue(st);
    }

    let pool = if wl_pool {
        &mut st.wl_pool
    } else {
        &mut st.user_pool
    };
    if let Some(pnum) = pool.pop_front() {
        let entry = st.tab[pnum as usize].as_mut().expect("pooled PEB vanished");
        let ec = entry.ec;
        if wl_pool {
            entry.state = PebState::Moving;
        } else {
            entry.state = PebState::Protected;
            protect(st, pnum);
        }
        return AllocAction::Got(pnum, ec);
    }

    if !st.free.is_empty() {
        if dev.fm.is_enabled() {
            AllocAction::Fastmap
        } else {
            AllocAction::Refill
        }
    } else if st.pending_erases > 0 {
        AllocAction::Wait
    } else {
        AllocAction::Fail
    }
}

fn get_peb_inner(dev: &UbiDevice, wl_pool: bool, block: bool) -> Result<(u32, u64), Error> {
    loop {
        let action = {
            let mut st = dev.wl.state.lock().unwrap();
            match alloc_from(dev, &mut st, wl_pool, !wl_pool) {
                AllocAction::Got(pnum, ec) => return Ok((pnum, ec)),
                AllocAction::Refill => {
                    if !refill_pools_locked(dev, &mut st) {
                        return Err(Error::OutOfSpace);
                    }
                    continue;
                }
                // Waiting for an erase is only safe off the worker thread;
                // the worker itself must give up and let the queued erases
                // run, or it starves the very work it is waiting on
                AllocAction::Wait if !block => return Err(Error::OutOfSpace),
                AllocAction::Wait => {
                    let _unused = dev.wl.free_cond.wait(st).unwrap();
                    continue;
                }
                other => other,
            }
        };

        match action {
            AllocAction::Fastmap => {
                // The pool ran dry: a checkpoint write refills both pools.
                // Callers hand the write to the background worker and wait
                // for it; the worker itself runs it inline, since waiting
                // on the queue from the queue's own thread goes nowhere.
                if block {
                    fastmap::schedule(dev);
                    dev.work.flush(ALL, ALL);
                } else {
                    fastmap::update(dev)?;
                }
                let st = dev.wl.state.lock().unwrap();
                let empty = if wl_pool {
                    st.wl_pool.is_empty()
                } else {
                    st.user_pool.is_empty()
                };
                if empty && st.free.is_empty() && st.pending_erases == 0 {
                    return Err(Error::OutOfSpace);
                }
            }
            AllocAction::Fail => return Err(Error::OutOfSpace),
            _ => unreachable!(),
        }
    }
}

/// Allocate a PEB for a caller write. The PEB comes out of the user pool
/// with its erase counter already stamped on flash, and enters the
/// protection queue so the move logic leaves it alone while it is young.
pub fn get_peb(dev: &UbiDevice) -> Result<(u32, u64), Error> {
    get_peb_inner(dev, false, true)
}

/// Allocate a move/consolidation target from the wl pool. Runs on the
/// worker thread, so it never blocks on pending erases.
pub(crate) fn get_peb_for_move(dev: &UbiDevice) -> Result<(u32, u64), Error> {
    get_peb_inner(dev, true, false)
}

/// Detach a PEB from whatever structure holds it, and hand it to the
/// background worker for erasure. `vol_id`/`lnum` tag the work for
/// [crate::work::WorkQueue::flush] matching.
pub fn put_peb(dev: &UbiDevice, pnum: u32, torture: bool, vol_id: u32, lnum: u32) {
    {
        let mut st = dev.wl.state.lock().unwrap();
        let Some(entry) = st.tab[pnum as usize] else {
            return; // already retired as bad
        };
        match entry.state {
            PebState::Erasing => return, // already queued
            PebState::Free => {
                st.free.remove(&(entry.ec, pnum));
            }
            PebState::Used => {
                st.used.remove(&(entry.ec, pnum));
            }
            PebState::Scrub => {
                st.scrub.remove(&(entry.ec, pnum));
            }
            PebState::Erroneous => {
                st.erroneous.remove(&(entry.ec, pnum));
            }
            PebState::Protected => remove_from_pq(&mut st, pnum),
            PebState::Pool => {
                st.user_pool.retain(|&p| p != pnum);
                st.wl_pool.retain(|&p| p != pnum);
            }
            PebState::Moving => {
                warn!("PEB {pnum} released while owned by a move");
            }
            // Superseded checkpoint PEBs are tracked by the fastmap layer
            PebState::Fm => {}
        }
        st.tab[pnum as usize].as_mut().unwrap().state = PebState::Erasing;
        st.pending_erases += 1;
    }

    dev.work.push(WorkItem {
        kind: Work::Erase { pnum, torture },
        vol_id,
        lnum,
    });
}

/// Note a corrected bit-flip: queue the PEB for scrubbing and make sure a
/// move pass is scheduled
pub fn schedule_scrub(dev: &UbiDevice, pnum: u32) {
    {
        let mut st = dev.wl.state.lock().unwrap();
        let Some(entry) = st.tab[pnum as usize] else {
            return;
        };
        match entry.state {
            PebState::Used => {
                st.used.remove(&(entry.ec, pnum));
                st.scrub.insert((entry.ec, pnum));
            }
            PebState::Protected => {
                remove_from_pq(&mut st, pnum);
                st.scrub.insert((entry.ec, pnum));
            }
            // Already queued, being moved, or gone; nothing to note
            _ => return,
        }
        st.tab[pnum as usize].as_mut().unwrap().state = PebState::Scrub;
        debug!("PEB {pnum} queued for scrubbing");
    }
    ensure_wear_leveling(dev);
}

/// Move a PEB whose data proved unreadable out of circulation. Exceeding
/// the erroneous cap means the medium is failing wholesale: latch
/// read-only.
pub fn mark_erroneous(dev: &UbiDevice, pnum: u32) {
    let over_cap = {
        let mut st = dev.wl.state.lock().unwrap();
        let Some(entry) = st.tab[pnum as usize] else {
            return;
        };
        match entry.state {
            PebState::Used => {
                st.used.remove(&(entry.ec, pnum));
            }
            PebState::Scrub => {
                st.scrub.remove(&(entry.ec, pnum));
            }
            PebState::Protected => remove_from_pq(&mut st, pnum),
            PebState::Moving => {}
            _ => return,
        }
        st.erroneous.insert((entry.ec, pnum));
        st.tab[pnum as usize].as_mut().unwrap().state = PebState::Erroneous;
        warn!("PEB {pnum} marked erroneous ({} total)", st.erroneous.len());
        st.erroneous.len() > st.max_erroneous
    };

    if over_cap {
        dev.io.set_ro();
    }
}

/// Schedule a wear-levelling pass if the EC spread or the scrub backlog
/// warrants one
pub fn ensure_wear_leveling(dev: &UbiDevice) {
    let schedule = {
        let mut st = dev.wl.state.lock().unwrap();
        if st.wl_scheduled {
            false
        } else {
            // Without a target in sight (a free PEB now, or an erase that
            // will produce one) a move pass could only spin
            let have_target =
                !st.free.is_empty() || !st.wl_pool.is_empty() || st.pending_erases > 0;
            let need = have_target
                && (!st.scrub.is_empty()
                    || match st.used.first() {
                        Some(&(min_used, _)) => {
                            st.max_ec.saturating_sub(min_used) > dev.config.wl_threshold
                        }
                        None => false,
                    });
            if need {
                st.wl_scheduled = true;
            }
            need
        }
    };

    if schedule {
        dev.work.push(WorkItem {
            kind: Work::Move,
            vol_id: ALL,
            lnum: ALL,
        });
    }
}

/// Promote a move/consolidation target carrying live data into the used set
pub(crate) fn make_used(dev: &UbiDevice, pnum: u32) {
    set_state(dev, pnum, PebState::Used);
}

fn set_state(dev: &UbiDevice, pnum: u32, state: PebState) {
    let mut st = dev.wl.state.lock().unwrap();
    if let Some(entry) = st.tab[pnum as usize] {
        match state {
            PebState::Used => {
                st.used.insert((entry.ec, pnum));
            }
            PebState::Scrub => {
                st.scrub.insert((entry.ec, pnum));
            }
            PebState::Free => {
                st.free.insert((entry.ec, pnum));
            }
            _ => {}
        }
        st.tab[pnum as usize].as_mut().unwrap().state = state;
    }
}

/// The erase worker: erase (torturing when asked), bump the counter,
/// restamp the EC header, and return the PEB to the free set.
pub(crate) fn do_erase(dev: &UbiDevice, pnum: u32, torture: bool, vol_id: u32, lnum: u32) {
    let ec = {
        let st = dev.wl.state.lock().unwrap();
        match st.tab[pnum as usize] {
            Some(entry) => entry.ec,
            None => return,
        }
    };

    let finish_pending = |retired: bool| {
        let mut st = dev.wl.state.lock().unwrap();
        st.pending_erases -= 1;
        if retired {
            st.tab[pnum as usize] = None;
        }
        dev.wl.free_cond.notify_all();
    };

    match dev.io.erase(pnum, torture) {
        Ok(()) => {}
        Err(Error::BadPeb { .. }) => {
            // Torture already marked it bad
            finish_pending(true);
            return;
        }
        Err(Error::ReadOnly) => {
            finish_pending(false);
            return;
        }
        Err(e) => {
            if !torture {
                // A failed plain erase sends the PEB through torture
                warn!("erase of PEB {pnum} failed ({e}), torturing");
                dev.work.push(WorkItem {
                    kind: Work::Erase {
                        pnum,
                        torture: true,
                    },
                    vol_id,
                    lnum,
                });
                return;
            }
            let _ = dev.io.mark_bad(pnum);
            finish_pending(true);
            return;
        }
    }

    let new_ec = ec + 1;
    if new_ec > MAX_ERASECOUNTER {
        warn!("erase counter of PEB {pnum} overflows");
        dev.io.set_ro();
        finish_pending(false);
        return;
    }

    let geo = dev.io.geometry();
    let hdr = Ec {
        ec: new_ec,
        vid_hdr_offset: geo.vid_hdr_offset as u32,
        data_offset: geo.leb_start as u32,
        image_seq: dev.image_seq,
    };
    if let Err(e) = dev.io.write_ec_hdr(pnum, hdr) {
        if !torture {
            warn!("cannot stamp EC header on PEB {pnum} ({e}), torturing");
            dev.work.push(WorkItem {
                kind: Work::Erase {
                    pnum,
                    torture: true,
                },
                vol_id,
                lnum,
            });
            return;
        }
        let _ = dev.io.mark_bad(pnum);
        finish_pending(true);
        return;
    }

    {
        let mut st = dev.wl.state.lock().unwrap();
        st.pending_erases -= 1;
        st.max_ec = st.max_ec.max(new_ec);
        st.tab[pnum as usize] = Some(WlEntry {
            ec: new_ec,
            state: PebState::Free,
        });
        st.free.insert((new_ec, pnum));
        dev.wl.free_cond.notify_all();
    }
    ensure_wear_leveling(dev);
}

/// Outcome of moving the contents of one source PEB
enum MoveOutcome {
    /// Every live LEB was copied off; the source can be erased
    Evacuated,

    /// At least one LEB stayed behind (contention); source returns to its
    /// tree
    Contended,

    /// The source PEB could not be read; it was marked erroneous
    SourceDead,
}

/// The wear-levelling / scrubbing worker: pick a source, copy its LEB(s)
/// to fresh targets via the EBA copy protocol, then release the source.
pub(crate) fn do_move(dev: &UbiDevice) {
    let _serial = dev.wl.move_mutex.lock().unwrap();

    let picked = {
        let mut st = dev.wl.state.lock().unwrap();
        st.wl_scheduled = false;

        let pick = if let Some(&(ec, pnum)) = st.scrub.first() {
            st.scrub.remove(&(ec, pnum));
            Some((pnum, true))
        } else {
            match st.used.first().copied() {
                Some((min_used, pnum))
                    if st.max_ec.saturating_sub(min_used) > dev.config.wl_threshold =>
                {
                    st.used.remove(&(min_used, pnum));
                    Some((pnum, false))
                }
                _ => None,
            }
        };
        if let Some((pnum, _)) = pick {
            st.tab[pnum as usize].as_mut().unwrap().state = PebState::Moving;
        }
        pick
    };

    let Some((src_pnum, was_scrub)) = picked else {
        return;
    };

    let vidb = match dev.io.read_vid_hdrs(src_pnum) {
        Ok(HdrRead::Ok(vidb)) | Ok(HdrRead::Bitflips(vidb)) => vidb,
        Ok(HdrRead::Blank) => {
            // EC-only PEB sitting in the used set: reclaim it
            put_peb(dev, src_pnum, false, ALL, ALL);
            return;
        }
        Ok(HdrRead::Bad) => {
            put_peb(dev, src_pnum, true, ALL, ALL);
            return;
        }
        Ok(HdrRead::BadEcc) | Err(_) => {
            mark_erroneous(dev, src_pnum);
            return;
        }
    };

    let mut outcome = MoveOutcome::Evacuated;

    for (lpos, vid) in vidb.hdrs().iter().enumerate() {
        let Some(vol) = dev.volumes.get(vid.vol_id) else {
            // An unknown volume is not proof the data is dead (the
            // registry may still be filling); leave the PEB alone
            outcome = MoveOutcome::Contended;
            break;
        };
        if !vol.maps_to(vid.lnum, src_pnum, lpos as u8) {
            continue; // stale slot, superseded by a newer write
        }

        match move_one(dev, &vol, *vid, lpos as u8, src_pnum) {
            Ok(true) => {}
            Ok(false) => outcome = MoveOutcome::Contended,
            Err(MoveError::SourceRead) => {
                outcome = MoveOutcome::SourceDead;
                break;
            }
            Err(_) => {
                outcome = MoveOutcome::Contended;
                break;
            }
        }
    }

    match outcome {
        MoveOutcome::Evacuated => {
            put_peb(dev, src_pnum, false, ALL, ALL);
        }
        MoveOutcome::Contended => {
            set_state(
                dev,
                src_pnum,
                if was_scrub {
                    PebState::Scrub
                } else {
                    PebState::Used
                },
            );
        }
        MoveOutcome::SourceDead => {
            mark_erroneous(dev, src_pnum);
        }
    }

    ensure_wear_leveling(dev);
}

/// Copy one LEB off `src_pnum`. Target write failures burn through fresh
/// targets a bounded number of times; the last failing target is marked
/// erroneous rather than re-tortured. Returns Ok(false) on a quiet
/// cancel-race.
fn move_one(
    dev: &UbiDevice,
    vol: &crate::volumes::Volume,
    vid: crate::headers::Vid,
    lpos: u8,
    src_pnum: u32,
) -> Result<bool, MoveError> {
    for attempt in 0..=IO_RETRIES {
        let (tgt, _ec) = match get_peb_for_move(dev) {
            Ok(got) => got,
            Err(e) => return Err(MoveError::Fatal(e)),
        };

        match eba::copy_leb(dev, vol, vid, lpos, src_pnum, tgt) {
            Ok(()) => {
                set_state(dev, tgt, PebState::Used);
                dev.wl.moves.fetch_add(1, Ordering::Relaxed);
                return Ok(true);
            }
            Err(MoveError::CancelRace) => {
                debug!("move of LEB {}:{} cancelled by a racing user", vid.vol_id, vid.lnum);
                set_state(dev, tgt, PebState::Free);
                return Ok(false);
            }
            Err(MoveError::SourceRead) => {
                set_state(dev, tgt, PebState::Free);
                return Err(MoveError::SourceRead);
            }
            Err(
                e @ (MoveError::TargetWrite | MoveError::TargetRead | MoveError::TargetBitflips),
            ) => {
                if attempt < IO_RETRIES {
                    debug!("move target PEB {tgt} failed ({e:?}), torturing and retrying");
                    put_peb(dev, tgt, true, ALL, ALL);
                } else {
                    mark_erroneous(dev, tgt);
                    return Err(e);
                }
            }
            Err(MoveError::Retry) => {
                set_state(dev, tgt, PebState::Free);
                return Err(MoveError::Retry);
            }
            Err(MoveError::Fatal(e)) => {
                set_state(dev, tgt, PebState::Free);
                return Err(MoveError::Fatal(e));
            }
        }
    }
    unreachable!()
}

/// Lock and refill both pools from the free set
pub(crate) fn refill_pools(dev: &UbiDevice) -> bool {
    let mut st = dev.wl.state.lock().unwrap();
    refill_pools_locked(dev, &mut st)
}

/// Claim a free PEB for the next checkpoint. The superblock must sit in
/// the low range the attach probe covers.
pub(crate) fn claim_fastmap_peb(dev: &UbiDevice, anchor: bool) -> Result<(u32, u64), Error> {
    let mut st = dev.wl.state.lock().unwrap();
    let pick = if anchor {
        st.free
            .iter()
            .copied()
            .filter(|&(_, pnum)| pnum < FM_MAX_BLOCKS)
            .min_by_key(|&(_, pnum)| pnum)
    } else {
        st.free.first().copied()
    };
    let Some((ec, pnum)) = pick else {
        return Err(Error::OutOfSpace);
    };
    st.free.remove(&(ec, pnum));
    st.tab[pnum as usize] = Some(WlEntry {
        ec,
        state: PebState::Fm,
    });
    Ok((pnum, ec))
}

/// Snapshot of the engine used by the fastmap writer
pub(crate) struct WlSnapshot {
    pub free: Vec<(u32, u64)>,
    pub used: Vec<(u32, u64)>,
    pub scrub: Vec<(u32, u64)>,
    pub erroneous: Vec<(u32, u64)>,
    pub erasing: Vec<(u32, u64)>,
    pub user_pool: Vec<u32>,
    pub wl_pool: Vec<u32>,
    pub max_ec: u64,
}

impl Wl {
    /// Capture the engine state for checkpointing. Pool and protected PEBs
    /// are reported in the pools (their mappings may change after the
    /// checkpoint without another fastmap write, which is why attach
    /// re-scans them).
    pub(crate) fn snapshot(&self) -> WlSnapshot {
        let st = self.state.lock().unwrap();
        let by_state = |want: PebState| {
            st.tab
                .iter()
                .enumerate()
                .filter_map(|(pnum, e)| {
                    e.as_ref()
                        .filter(|e| e.state == want)
                        .map(|e| (pnum as u32, e.ec))
                })
                .collect::<Vec<_>>()
        };

        let mut user_pool: Vec<u32> = st.user_pool.iter().copied().collect();
        // Protected PEBs were handed out recently; their contents are as
        // volatile as the pools', so the checkpoint treats them alike
        for bucket in st.pq.iter() {
            user_pool.extend(bucket.iter().copied());
        }
        for (pnum, entry) in st.tab.iter().enumerate() {
            if let Some(entry) = entry {
                if entry.state == PebState::Moving {
                    user_pool.push(pnum as u32);
                }
            }
        }

        WlSnapshot {
            free: by_state(PebState::Free),
            used: by_state(PebState::Used),
            scrub: by_state(PebState::Scrub),
            erroneous: by_state(PebState::Erroneous),
            erasing: by_state(PebState::Erasing),
            user_pool,
            wl_pool: st.wl_pool.iter().copied().collect(),
            max_ec: st.max_ec,
        }
    }

    /// Erase counter of a PEB, if the engine tracks it
    pub(crate) fn ec_of(&self, pnum: u32) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .tab
            .get(pnum as usize)
            .and_then(|e| e.as_ref().map(|e| e.ec))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn state_for_test(peb_count: u32) -> WlState {
        let wl = Wl::new(peb_count);
        wl.state.into_inner().unwrap()
    }

    #[test]
    fn test_median_pick_deterministic() {
        let mut st = state_for_test(8);
        for pnum in 0..6u32 {
            st.free.insert((10 + (pnum as u64 % 3), pnum));
            st.tab[pnum as usize] = Some(WlEntry {
                ec: 10 + (pnum as u64 % 3),
                state: PebState::Free,
            });
        }

        let a = take_median_free(&mut st, None).unwrap();
        st.free.insert(a);
        let b = take_median_free(&mut st, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_near_ec_pick() {
        let mut st = state_for_test(8);
        for (pnum, ec) in [(0u32, 5u64), (1, 11), (2, 30)] {
            st.free.insert((ec, pnum));
            st.tab[pnum as usize] = Some(WlEntry {
                ec,
                state: PebState::Free,
            });
        }
        assert_eq!(take_near_ec_free(&mut st, 12, None), Some((11, 1)));
        assert_eq!(take_near_ec_free(&mut st, 12, None), Some((5, 0)));
    }

    #[test]
    fn test_prot_queue_eviction() {
        let mut st = state_for_test(4);
        st.tab[2] = Some(WlEntry {
            ec: 7,
            state: PebState::Protected,
        });
        protect(&mut st, 2);

        for _ in 0..PROT_QUEUE_LEN - 1 {
            serve_prot_queue(&mut st);
            assert!(st.used.is_empty());
        }
        serve_prot_queue(&mut st);
        assert!(st.used.contains(&(7, 2)));
        assert_eq!(st.tab[2].unwrap().state, PebState::Used);
    }

    #[test]
    fn test_anchor_candidate() {
        let mut st = state_for_test(8);
        for (pnum, ec) in [(1u32, 3u64), (5, 1), (7, 2)] {
            st.free.insert((ec, pnum));
            st.tab[pnum as usize] = Some(WlEntry {
                ec,
                state: PebState::Free,
            });
        }
        assert_eq!(anchor_candidate(&st), Some(1));
    }
}
