//! An Unsorted Block Image (UBI) layer: presents fixed-size logical
//! eraseblocks on top of a raw erase-block flash device, wear-levelling,
//! scrubbing and remapping the physical eraseblocks underneath.
//!
//! The pieces, bottom up: [flash] is the narrow raw-device interface (plus
//! an in-memory simulator), `io` wraps it with headers, retries and the
//! read-only latch, `headers` holds the on-flash codecs, `eba` owns the
//! LEB→PEB map and its locking, `wl` levels wear and `work` runs its
//! background queue, `conso` packs SLC-written eraseblocks on MLC media,
//! `attach`/`fastmap` rebuild everything at mount, and `volumes` keeps the
//! registry the public API hands out descriptors from.
//!
//! ```no_run
//! use ubi_core::{Ubi, VolumeSpec, OpenMode};
//!
//! # fn main() -> Result<(), ubi_core::Error> {
//! let flash = ubi_core::SimFlash::new(ubi_core::MtdGeometry {
//!     peb_count: 64,
//!     peb_size: 64 * 1024,
//!     min_io_size: 2048,
//!     max_write_size: 4096,
//!     bits_per_cell: 1,
//! });
//! let ubi = Ubi::attach(Box::new(flash))?;
//! ubi.install_volume(VolumeSpec::dynamic(0, "data", 8))?;
//!
//! let vol = ubi.open_volume(0, OpenMode::ReadWrite)?;
//! vol.write_leb(0, b"hello", 0)?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{info, warn};
use thiserror::Error as ThisError;

mod attach;
mod conso;
mod eba;
mod fastmap;
pub mod flash;
pub mod headers;
mod io;
mod volumes;
mod vtbl;
mod wl;
mod work;

pub use flash::{FlashError, Mtd, MtdGeometry, PageUtil, ReadStatus, SimFlash};
pub use headers::{VolMode, VolTableRecord, VolType};
pub use io::{Geometry, IoMode};
pub use volumes::{NotifyFn, OpenMode, VolumeNotification, LAYOUT_VOLUME_ID, MAX_VOLUMES};
pub use wl::{PROT_QUEUE_LEN, WL_THRESHOLD};

use eba::LebDesc;
use headers::Ec;
use volumes::{Volume, Volumes};
use work::{WorkQueue, ALL};

/// The error surface of the crate
#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum Error {
    #[error("volume {0} does not exist")]
    NoVolume(u32),

    #[error("LEB {lnum} of volume {vol_id} is not mapped")]
    NotMapped { vol_id: u32, lnum: u32 },

    #[error("no free physical eraseblocks left")]
    OutOfSpace,

    #[error("device is in read-only mode")]
    ReadOnly,

    #[error("uncorrectable read error on PEB {pnum}")]
    Uncorrectable { pnum: u32 },

    #[error("PEB {pnum} went bad")]
    BadPeb { pnum: u32 },

    #[error("volume {vol_id} is corrupted")]
    Corrupted { vol_id: u32 },

    #[error("volume {vol_id} is busy")]
    Busy { vol_id: u32 },

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error(transparent)]
    Flash(#[from] FlashError),

    #[error("on-flash record codec failure: {0}")]
    Codec(#[from] deku::DekuError),
}

/// Attach-time and behaviour knobs. The defaults match a production
/// instance; tests tighten the thresholds to make the background machinery
/// observable on tiny simulated devices.
#[derive(Debug, Clone)]
pub struct UbiConfig {
    /// Verify every write by reading it back
    pub extra_checks: bool,

    /// Maintain an on-flash fastmap checkpoint
    pub fastmap: bool,

    /// Cross-check the fastmap against a sampled scan at attach
    pub self_check_fastmap: bool,

    /// EC spread that triggers a wear-levelling move
    pub wl_threshold: u64,

    /// SLC-LEB backlog that triggers consolidation of an MLC-safe volume
    pub conso_threshold: usize,

    /// Start the background worker immediately. Tests attach with this off
    /// to observe the queued work before it runs.
    pub start_worker: bool,
}

impl Default for UbiConfig {
    fn default() -> Self {
        Self {
            extra_checks: false,
            fastmap: true,
            self_check_fastmap: false,
            wl_threshold: wl::WL_THRESHOLD,
            conso_threshold: conso::CONSO_THRESHOLD,
            start_worker: true,
        }
    }
}

/// Everything a volume needs to be created
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    pub vol_id: u32,
    pub name: String,
    pub vol_type: VolType,
    pub vol_mode: VolMode,
    pub reserved_pebs: u32,
    pub alignment: u32,
}

impl VolumeSpec {
    /// A plain dynamic volume
    pub fn dynamic(vol_id: u32, name: &str, reserved_pebs: u32) -> Self {
        Self {
            vol_id,
            name: name.to_string(),
            vol_type: VolType::Dynamic,
            vol_mode: VolMode::Normal,
            reserved_pebs,
            alignment: 1,
        }
    }

    /// A static (write-once, CRC-checked) volume
    pub fn static_vol(vol_id: u32, name: &str, reserved_pebs: u32) -> Self {
        Self {
            vol_type: VolType::Static,
            ..Self::dynamic(vol_id, name, reserved_pebs)
        }
    }

    /// An MLC-safe volume: written in SLC mode, repacked by consolidation
    pub fn mlc_safe(vol_id: u32, name: &str, reserved_pebs: u32) -> Self {
        Self {
            vol_mode: VolMode::MlcSafe,
            ..Self::dynamic(vol_id, name, reserved_pebs)
        }
    }
}

/// Shared state of one attached UBI instance
pub(crate) struct UbiDevice {
    pub(crate) io: io::Io,
    pub(crate) eba: eba::Eba,
    pub(crate) wl: wl::Wl,
    pub(crate) work: WorkQueue,
    pub(crate) volumes: Volumes,
    pub(crate) fm: fastmap::Fastmap,
    pub(crate) config: UbiConfig,
    pub(crate) image_seq: u32,
    pub(crate) layout: Arc<Volume>,
    pub(crate) vtbl: Mutex<Vec<Option<VolTableRecord>>>,
    corrupt_pebs: AtomicU32,
}

/// Summary of the device state
#[derive(Debug, Clone)]
pub struct UbiInfo {
    pub peb_count: u32,
    pub peb_size: usize,
    pub leb_size: usize,
    pub slc_leb_size: usize,
    pub min_io_size: usize,
    pub free_pebs: usize,
    pub pending_erases: usize,
    pub bad_pebs: u32,
    pub corrupt_pebs: u32,
    pub erroneous_pebs: usize,
    pub read_only: bool,
    pub min_ec: u64,
    pub max_ec: u64,
    pub move_count: u64,
    pub image_seq: u32,
}

/// Summary of one volume
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub vol_id: u32,
    pub name: String,
    pub vol_type: VolType,
    pub vol_mode: VolMode,
    pub usable_leb_size: usize,
    pub reserved_pebs: u32,
    pub reserved_lebs: u32,
    pub used_ebs: u32,
    pub corrupted: bool,
    pub mapped_lebs: u32,
}

/// One attached UBI instance. Dropping (or [Ubi::detach]) flushes the work
/// queue and stops the background worker.
pub struct Ubi {
    dev: Arc<UbiDevice>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Ubi {
    /// Attach with default configuration
    pub fn attach(mtd: Box<dyn Mtd>) -> Result<Self, Error> {
        Self::attach_with(mtd, UbiConfig::default())
    }

    /// Attach a raw flash device: try the fastmap first, fall back to the
    /// full scan, seed the engine, and start the background worker.
    pub fn attach_with(mtd: Box<dyn Mtd>, config: UbiConfig) -> Result<Self, Error> {
        let io = io::Io::new(mtd, config.extra_checks)?;

        let fm_attach = if config.fastmap {
            fastmap::try_attach(&io, &config)
        } else {
            None
        };
        let (info, fm_pebs) = match fm_attach {
            Some(found) => found,
            None => (attach::full_scan(&io)?, Vec::new()),
        };

        let geo = *io.geometry();
        let layout = Arc::new(Volume::from_record(
            &geo,
            LAYOUT_VOLUME_ID,
            &vtbl::layout_volume_record(geo.bits_per_cell),
        )?);

        let dev = Arc::new(UbiDevice {
            io,
            eba: eba::Eba::default(),
            wl: wl::Wl::new(geo.peb_count),
            work: WorkQueue::default(),
            volumes: Volumes::default(),
            fm: fastmap::Fastmap::new(config.fastmap),
            image_seq: info.image_seq,
            config,
            layout,
            vtbl: Mutex::new(Vec::new()),
            corrupt_pebs: AtomicU32::new(0),
        });
        if !dev.config.start_worker {
            dev.work.enable(false);
        }

        // The worker may start right away: erase work queued while seeding
        // keeps the free pool breathing during the rest of the attach
        let worker = {
            let dev = Arc::clone(&dev);
            thread::Builder::new()
                .name("ubi-bgt".to_string())
                .spawn(move || work::run(dev))
                .map_err(|e| Error::Invalid(format!("cannot start worker: {e}")))?
        };

        let ubi = Ubi {
            dev,
            worker: Some(worker),
        };
        ubi.apply_attach(info, fm_pebs)?;
        Ok(ubi)
    }

    /// Turn the attach picture into live engine state
    fn apply_attach(&self, mut info: attach::AttachInfo, fm_pebs: Vec<u32>) -> Result<(), Error> {
        let dev = &self.dev;
        let geo = *dev.io.geometry();

        dev.io.note_bad_pebs(info.bad.len() as u32);
        dev.eba.seed_sqnum(info.max_sqnum);
        dev.corrupt_pebs
            .store(info.corrupt.len() as u32, Ordering::Relaxed);

        // Blank PEBs get an EC header at the mean counter and join the
        // free set; ones that refuse the stamp go through the erase path
        for pnum in std::mem::take(&mut info.empty) {
            let hdr = Ec {
                ec: info.mean_ec,
                vid_hdr_offset: geo.vid_hdr_offset as u32,
                data_offset: geo.leb_start as u32,
                image_seq: info.image_seq,
            };
            match dev.io.write_ec_hdr(pnum, hdr) {
                Ok(()) => {
                    info.ecs.insert(pnum, info.mean_ec);
                    info.free.push(pnum);
                }
                Err(e) => {
                    warn!("cannot stamp blank PEB {pnum} ({e})");
                    info.ecs.insert(pnum, info.mean_ec);
                    info.torn.push(pnum);
                }
            }
        }

        // Seed the wear-levelling engine
        let fm_set: std::collections::HashSet<u32> = fm_pebs.iter().copied().collect();
        for (&pnum, &ec) in &info.ecs {
            let state = if fm_set.contains(&pnum) {
                wl::SeedState::Fastmap
            } else if info.erroneous.contains(&pnum) {
                wl::SeedState::Erroneous
            } else if info.vid_pebs.contains(&pnum) {
                if info.scrub.contains(&pnum) {
                    wl::SeedState::Scrub
                } else {
                    wl::SeedState::Used
                }
            } else if info.torn.contains(&pnum) {
                wl::SeedState::Erase { torture: false }
            } else if info.free.contains(&pnum) {
                wl::SeedState::Free
            } else {
                wl::SeedState::Erase { torture: false }
            };
            dev.wl.seed(dev, pnum, ec, state);
        }
        dev.fm.adopt(fm_pebs);

        // The layout volume comes first; its mirrors carry the table every
        // other volume is built from
        seed_volume_table(&self.dev.layout, &info);
        dev.volumes.insert(Arc::clone(&dev.layout));

        let records = match vtbl::read_table(dev, &dev.layout)? {
            Some(records) => records,
            None => {
                let user_claims = info
                    .lebs
                    .keys()
                    .any(|&(vol_id, _)| vol_id < MAX_VOLUMES as u32);
                if user_claims {
                    return Err(Error::Invalid(
                        "device carries volume data but no volume table".into(),
                    ));
                }
                vtbl::create_empty(dev, &dev.layout)?
            }
        };
        *dev.vtbl.lock().unwrap() = records.clone();

        // Build each volume and point its LEBs at the scanned claims
        for (vol_id, rec) in records.iter().enumerate() {
            let Some(rec) = rec else { continue };
            let vol_id = vol_id as u32;
            let vol = Arc::new(Volume::from_record(&geo, vol_id, rec)?);
            seed_volume_table(&vol, &info);

            if vol.vol_type == VolType::Static {
                let used_ebs = info.static_used_ebs(vol_id);
                vol.used_ebs.store(used_ebs, Ordering::Relaxed);
                if !info.static_complete(vol_id, used_ebs) {
                    warn!("static volume {vol_id} has missing LEBs, marking corrupted");
                    vol.set_corrupted();
                }
            }

            dev.volumes.insert(vol);
        }

        // Whatever VID-bearing PEB ended up referenced by no table is
        // stale: lost arbitration, orphaned by a gone volume, or left over
        // from an old checkpoint
        let mut referenced: std::collections::HashSet<u32> = std::collections::HashSet::new();
        let mut ids = dev.volumes.ids();
        ids.push(LAYOUT_VOLUME_ID);
        for vol_id in ids {
            if let Some(vol) = dev.volumes.get(vol_id) {
                for desc in vol.eba_tbl.read().unwrap().iter().flatten() {
                    referenced.insert(desc.pnum);
                }
            }
        }
        for &pnum in &info.vid_pebs {
            if !referenced.contains(&pnum) {
                wl::put_peb(dev, pnum, false, ALL, ALL);
            }
        }

        for vol_id in dev.volumes.ids() {
            if let Some(vol) = dev.volumes.get(vol_id) {
                vol.conso_rearm(dev);
            }
        }
        wl::ensure_wear_leveling(dev);

        info!(
            "attached: {} volumes, {} free PEBs, image sequence {:#x}",
            dev.volumes.ids().len(),
            dev.wl.free_count(),
            dev.image_seq
        );
        Ok(())
    }

    /// Detach cleanly: drain the queue, write a final checkpoint, stop the
    /// worker. The medium then reattaches to an identical mapping.
    pub fn detach(mut self) -> Result<(), Error> {
        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.dev.work.enable(true);
        self.dev.work.flush(ALL, ALL);
        if self.dev.fm.is_enabled() && !self.dev.io.is_ro() {
            // The final checkpoint rides the queue like any other; the
            // second flush also covers the superseded checkpoint PEBs it
            // sends off for erasure
            fastmap::schedule(&self.dev);
            self.dev.work.flush(ALL, ALL);
        }
        self.dev.work.shutdown();
        let _ = worker.join();
    }

    /// Summary of the device
    pub fn info(&self) -> UbiInfo {
        let geo = self.dev.io.geometry();
        let (min_ec, max_ec) = self.dev.wl.ec_bounds();
        UbiInfo {
            peb_count: geo.peb_count,
            peb_size: geo.peb_size,
            leb_size: geo.leb_size,
            slc_leb_size: geo.slc_leb_size,
            min_io_size: geo.min_io_size,
            free_pebs: self.dev.wl.free_count(),
            pending_erases: self.dev.wl.pending_erases(),
            bad_pebs: self.dev.io.bad_peb_count(),
            corrupt_pebs: self.dev.corrupt_pebs.load(Ordering::Relaxed),
            erroneous_pebs: self.dev.wl.erroneous_count(),
            read_only: self.dev.io.is_ro(),
            min_ec,
            max_ec,
            move_count: self.dev.wl.moves.load(Ordering::Relaxed),
            image_seq: self.dev.image_seq,
        }
    }

    /// Install a new volume
    pub fn install_volume(&self, spec: VolumeSpec) -> Result<(), Error> {
        if spec.name.len() > headers::VOL_NAME_MAX {
            return Err(Error::Invalid(format!("volume name '{}' too long", spec.name)));
        }
        let geo = self.dev.io.geometry();
        let mode = match spec.vol_mode {
            VolMode::Normal => IoMode::Normal,
            _ => IoMode::Slc,
        };
        let alignment = spec.alignment.max(1);
        let data_pad = geo.leb_size_for(mode) as u32 % alignment;
        let rec = VolTableRecord {
            reserved_pebs: spec.reserved_pebs,
            alignment,
            data_pad,
            vol_type: spec.vol_type,
            vol_mode: spec.vol_mode,
            upd_marker: false,
            name: spec.name,
            flags: 0,
        };
        volumes::install_volume(&self.dev, spec.vol_id, rec)?;
        Ok(())
    }

    /// Remove a volume that nobody holds open
    pub fn remove_volume(&self, vol_id: u32) -> Result<(), Error> {
        volumes::remove_volume(&self.dev, vol_id)
    }

    /// Grow or shrink a volume's PEB reservation
    pub fn resize_volume(&self, vol_id: u32, reserved_pebs: u32) -> Result<(), Error> {
        volumes::resize_volume(&self.dev, vol_id, reserved_pebs)
    }

    /// Rename several volumes in one table update
    pub fn rename_volumes(&self, list: Vec<(u32, String)>) -> Result<(), Error> {
        volumes::rename_volumes(&self.dev, list)
    }

    /// Open a volume in the given mode
    pub fn open_volume(&self, vol_id: u32, mode: OpenMode) -> Result<VolumeDesc, Error> {
        if vol_id as usize >= MAX_VOLUMES {
            return Err(Error::NoVolume(vol_id));
        }
        let vol = self.dev.volumes.open(vol_id, mode)?;
        Ok(VolumeDesc {
            dev: Arc::clone(&self.dev),
            vol,
            mode,
        })
    }

    /// User-visible volume IDs
    pub fn volume_ids(&self) -> Vec<u32> {
        self.dev.volumes.ids()
    }

    /// Deliver registry events (add/remove/resize/rename, open/close) to a
    /// callback, e.g. a block-device shim
    pub fn register_notifier(&self, f: NotifyFn) {
        self.dev.volumes.register_notifier(f);
    }

    /// Wait until the whole background queue has drained
    pub fn flush(&self) {
        self.dev.work.flush(ALL, ALL);
    }

    /// Pause or resume the background worker. Paused, the queue only
    /// accumulates — handy for tests that need the device frozen between
    /// two steps.
    pub fn enable_worker(&self, on: bool) {
        self.dev.work.enable(on);
    }
}

impl Drop for Ubi {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn seed_volume_table(vol: &Volume, info: &attach::AttachInfo) {
    let mut tbl = vol.eba_tbl.write().unwrap();
    for lnum in 0..tbl.len() as u32 {
        if let Some(seed) = info.lebs.get(&(vol.vol_id, lnum)) {
            tbl[lnum as usize] = Some(LebDesc {
                pnum: seed.pnum,
                lpos: seed.lpos,
            });
        }
    }
}

/// An open volume handle. Closing happens on drop.
pub struct VolumeDesc {
    dev: Arc<UbiDevice>,
    vol: Arc<Volume>,
    mode: OpenMode,
}

impl VolumeDesc {
    fn check_writable(&self) -> Result<(), Error> {
        match self.mode {
            OpenMode::ReadWrite | OpenMode::Exclusive => Ok(()),
            _ => Err(Error::Invalid(format!(
                "volume {} is not open for writing",
                self.vol.vol_id
            ))),
        }
    }

    fn check_readable(&self) -> Result<(), Error> {
        match self.mode {
            OpenMode::MetaOnly => Err(Error::Invalid(format!(
                "volume {} is open metadata-only",
                self.vol.vol_id
            ))),
            _ => Ok(()),
        }
    }

    /// Read `buf.len()` bytes from a LEB. Unmapped LEBs of dynamic volumes
    /// read as all-ones. With `check`, static payloads are verified
    /// against their stored CRC.
    pub fn read_leb(
        &self,
        lnum: u32,
        buf: &mut [u8],
        offset: usize,
        check: bool,
    ) -> Result<(), Error> {
        self.check_readable()?;
        eba::read_leb(&self.dev, &self.vol, lnum, buf, offset, check)
    }

    /// Write to a LEB of a dynamic volume. Writes within one LEB must move
    /// forward; a fresh LEB is mapped on first write.
    pub fn write_leb(&self, lnum: u32, buf: &[u8], offset: usize) -> Result<(), Error> {
        self.check_writable()?;
        if self.vol.vol_type != VolType::Dynamic {
            return Err(Error::Invalid(format!(
                "volume {} is static; use write_static_leb",
                self.vol.vol_id
            )));
        }
        eba::write_leb(&self.dev, &self.vol, lnum, buf, offset)
    }

    /// Write one LEB of a static volume, stamping `used_ebs` and the
    /// payload CRC
    pub fn write_static_leb(&self, lnum: u32, buf: &[u8], used_ebs: u32) -> Result<(), Error> {
        self.check_writable()?;
        if self.vol.vol_type != VolType::Static {
            return Err(Error::Invalid(format!(
                "volume {} is dynamic; use write_leb",
                self.vol.vol_id
            )));
        }
        eba::write_leb_static(&self.dev, &self.vol, lnum, buf, used_ebs)?;
        self.vol.used_ebs.fetch_max(used_ebs, Ordering::Relaxed);
        Ok(())
    }

    /// Replace a LEB's contents atomically: afterwards every read sees the
    /// new bytes, or — if the operation failed or power was cut — the old
    /// ones
    pub fn atomic_leb_change(&self, lnum: u32, buf: &[u8]) -> Result<(), Error> {
        self.check_writable()?;
        eba::atomic_leb_change(&self.dev, &self.vol, lnum, buf)
    }

    /// Unmap a LEB, releasing its PEB for erasure. Idempotent.
    pub fn unmap_leb(&self, lnum: u32) -> Result<(), Error> {
        self.check_writable()?;
        eba::unmap_leb(&self.dev, &self.vol, lnum)
    }

    pub fn is_mapped(&self, lnum: u32) -> bool {
        eba::is_mapped(&self.vol, lnum)
    }

    /// Wait for background work affecting this volume (pending erases of
    /// its former PEBs, consolidation) to finish
    pub fn sync(&self) {
        self.dev.work.flush(self.vol.vol_id, ALL);
    }

    /// Summary of the volume
    pub fn info(&self) -> VolumeInfo {
        let mapped = self
            .vol
            .eba_tbl
            .read()
            .unwrap()
            .iter()
            .flatten()
            .count() as u32;
        VolumeInfo {
            vol_id: self.vol.vol_id,
            name: self.vol.name(),
            vol_type: self.vol.vol_type,
            vol_mode: self.vol.vol_mode,
            usable_leb_size: self.vol.usable_leb_size,
            reserved_pebs: self.vol.reserved_pebs.load(Ordering::Relaxed),
            reserved_lebs: self.vol.reserved_lebs(),
            used_ebs: self.vol.used_ebs.load(Ordering::Relaxed),
            corrupted: self.vol.is_corrupted(),
            mapped_lebs: mapped,
        }
    }
}

impl Drop for VolumeDesc {
    fn drop(&mut self) {
        self.dev.volumes.close(&self.vol, self.mode);
    }
}
