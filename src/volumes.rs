//! The volume registry: the dictionary of active volumes, open-mode
//! reference counting, change notifications, and the primitives the
//! administrative surface drives (install, remove, resize, rename).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, info};

use crate::eba::LebDesc;
use crate::headers::{VolMode, VolTableRecord, VolType};
use crate::io::IoMode;
use crate::work::{Work, WorkItem, ALL};
use crate::{vtbl, Error, UbiDevice};

/// Volume ID of the internal layout volume holding the volume table
pub const LAYOUT_VOLUME_ID: u32 = 0x7FFF_EFFF;

/// LEBs of the layout volume (two mirrors of the table)
pub const LAYOUT_VOLUME_EBS: u32 = 2;

/// Internal volumes claim compatibility so foreign implementations ignore
/// rather than reject them
pub const LAYOUT_VOLUME_COMPAT: u8 = 5;

pub const MAX_VOLUMES: usize = 128;

/// How a volume may be opened
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum OpenMode {
    /// Any number of readers coexist
    ReadOnly,

    /// A single writer; excludes other writers and meta-only holders
    ReadWrite,

    /// Excludes everyone else
    Exclusive,

    /// Reads volume metadata only; excludes writers
    MetaOnly,
}

/// Registry events delivered to registered notifiers
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum VolumeNotification {
    Added(u32),
    Removed(u32),
    Resized(u32),
    Renamed(u32),
    Opened(u32),
    Closed(u32),
}

pub type NotifyFn = Box<dyn Fn(VolumeNotification) + Send + Sync>;

#[derive(Debug, Default)]
struct OpenCounts {
    readers: u32,
    writers: u32,
    exclusive: u32,
    metaonly: u32,
}

impl OpenCounts {
    fn admits(&self, mode: OpenMode) -> bool {
        match mode {
            OpenMode::ReadOnly => self.exclusive == 0,
            OpenMode::ReadWrite => {
                self.exclusive == 0 && self.writers == 0 && self.metaonly == 0
            }
            OpenMode::Exclusive => {
                self.exclusive == 0 && self.writers == 0 && self.readers == 0 && self.metaonly == 0
            }
            OpenMode::MetaOnly => self.exclusive == 0 && self.writers == 0,
        }
    }

    fn slot(&mut self, mode: OpenMode) -> &mut u32 {
        match mode {
            OpenMode::ReadOnly => &mut self.readers,
            OpenMode::ReadWrite => &mut self.writers,
            OpenMode::Exclusive => &mut self.exclusive,
            OpenMode::MetaOnly => &mut self.metaonly,
        }
    }

    fn total(&self) -> u32 {
        self.readers + self.writers + self.exclusive + self.metaonly
    }
}

/// One active volume
pub struct Volume {
    pub vol_id: u32,
    pub vol_type: VolType,
    pub vol_mode: VolMode,
    pub alignment: u32,
    pub data_pad: u32,

    /// Usable bytes per LEB after mode and alignment padding
    pub usable_leb_size: usize,

    pub reserved_pebs: AtomicU32,

    /// LEBs a static volume actually uses; learned at attach or stamped by
    /// static writes
    pub used_ebs: AtomicU32,

    pub upd_marker: bool,
    pub flags: u8,

    name: Mutex<String>,
    corrupted: AtomicBool,

    /// LEB number → PEB descriptor; `None` is the explicit unmapped state
    pub eba_tbl: RwLock<Vec<Option<LebDesc>>>,

    open: Mutex<OpenCounts>,

    /// Aborts an in-flight consolidation of this volume
    pub(crate) conso_cancel: AtomicBool,

    /// A consolidation work item is queued
    conso_scheduled: AtomicBool,
}

impl Volume {
    pub(crate) fn from_record(
        geo: &crate::io::Geometry,
        vol_id: u32,
        rec: &VolTableRecord,
    ) -> Result<Self, Error> {
        let mode = match rec.vol_mode {
            VolMode::Normal => IoMode::Normal,
            _ => IoMode::Slc,
        };
        let leb_size = geo.leb_size_for(mode);
        if rec.data_pad as usize >= leb_size {
            return Err(Error::Invalid(format!(
                "volume {vol_id}: data_pad {} swallows the whole LEB",
                rec.data_pad
            )));
        }

        Ok(Self {
            vol_id,
            vol_type: rec.vol_type,
            vol_mode: rec.vol_mode,
            alignment: rec.alignment.max(1),
            data_pad: rec.data_pad,
            usable_leb_size: leb_size - rec.data_pad as usize,
            reserved_pebs: AtomicU32::new(rec.reserved_pebs),
            used_ebs: AtomicU32::new(0),
            upd_marker: rec.upd_marker,
            flags: rec.flags,
            name: Mutex::new(rec.name.clone()),
            corrupted: AtomicBool::new(rec.upd_marker),
            eba_tbl: RwLock::new(vec![None; rec.reserved_pebs as usize]),
            open: Mutex::new(OpenCounts::default()),
            conso_cancel: AtomicBool::new(false),
            conso_scheduled: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub(crate) fn rename(&self, name: String) {
        *self.name.lock().unwrap() = name;
    }

    pub fn reserved_lebs(&self) -> u32 {
        self.eba_tbl.read().unwrap().len() as u32
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::Relaxed)
    }

    pub(crate) fn set_corrupted(&self) {
        self.corrupted.store(true, Ordering::Relaxed);
    }

    /// The mode tag stamped into fresh VID headers of this volume. MLC-safe
    /// volumes write SLC first and get repacked by consolidation later.
    pub(crate) fn write_mode_tag(&self) -> VolMode {
        match self.vol_mode {
            VolMode::Normal => VolMode::Normal,
            VolMode::Slc | VolMode::MlcSafe => VolMode::Slc,
        }
    }

    pub(crate) fn write_io_mode(&self) -> IoMode {
        match self.vol_mode {
            VolMode::Normal => IoMode::Normal,
            VolMode::Slc | VolMode::MlcSafe => IoMode::Slc,
        }
    }

    /// Does LEB `lnum` currently map to `(pnum, lpos)`?
    pub(crate) fn maps_to(&self, lnum: u32, pnum: u32, lpos: u8) -> bool {
        self.eba_tbl
            .read()
            .unwrap()
            .get(lnum as usize)
            .copied()
            .flatten()
            == Some(LebDesc { pnum, lpos })
    }

    /// Live LEBs occupying a whole (SLC-written) PEB each: the consolidation
    /// backlog of this volume
    pub(crate) fn slc_leb_count(&self) -> usize {
        let tbl = self.eba_tbl.read().unwrap();
        let mut by_pnum: HashMap<u32, usize> = HashMap::new();
        for desc in tbl.iter().flatten() {
            *by_pnum.entry(desc.pnum).or_insert(0) += 1;
        }
        tbl.iter()
            .flatten()
            .filter(|d| by_pnum[&d.pnum] == 1 && d.lpos == 0)
            .count()
    }

    /// Re-arm consolidation if the SLC backlog crossed the threshold
    pub(crate) fn conso_rearm(&self, dev: &UbiDevice) {
        if self.vol_mode != VolMode::MlcSafe || dev.io.geometry().bits_per_cell < 2 {
            return;
        }
        if self.slc_leb_count() <= dev.config.conso_threshold {
            return;
        }
        if !self.conso_scheduled.swap(true, Ordering::AcqRel) {
            debug!("scheduling consolidation of volume {}", self.vol_id);
            dev.work.push(WorkItem {
                kind: Work::Consolidate {
                    vol_id: self.vol_id,
                },
                vol_id: self.vol_id,
                lnum: ALL,
            });
        }
    }

    /// The consolidation worker claimed the queued work item
    pub(crate) fn conso_take(&self) {
        self.conso_scheduled.store(false, Ordering::Release);
    }
}

/// The dictionary of active volumes
#[derive(Default)]
pub struct Volumes {
    map: RwLock<HashMap<u32, Arc<Volume>>>,
    notifiers: Mutex<Vec<NotifyFn>>,
}

impl Volumes {
    pub fn get(&self, vol_id: u32) -> Option<Arc<Volume>> {
        self.map.read().unwrap().get(&vol_id).cloned()
    }

    /// User-visible volume IDs, sorted
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .map
            .read()
            .unwrap()
            .keys()
            .copied()
            .filter(|&id| id < MAX_VOLUMES as u32)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn register_notifier(&self, f: NotifyFn) {
        self.notifiers.lock().unwrap().push(f);
    }

    pub(crate) fn notify(&self, event: VolumeNotification) {
        for f in self.notifiers.lock().unwrap().iter() {
            f(event);
        }
    }

    pub(crate) fn insert(&self, vol: Arc<Volume>) {
        self.map.write().unwrap().insert(vol.vol_id, vol);
    }

    fn remove(&self, vol_id: u32) -> Option<Arc<Volume>> {
        self.map.write().unwrap().remove(&vol_id)
    }

    /// Sum of reserved PEBs over all user volumes
    fn reserved_total(&self) -> u32 {
        self.map
            .read()
            .unwrap()
            .values()
            .filter(|v| v.vol_id < MAX_VOLUMES as u32)
            .map(|v| v.reserved_pebs.load(Ordering::Relaxed))
            .sum()
    }

    pub(crate) fn open(&self, vol_id: u32, mode: OpenMode) -> Result<Arc<Volume>, Error> {
        let vol = self.get(vol_id).ok_or(Error::NoVolume(vol_id))?;
        {
            let mut open = vol.open.lock().unwrap();
            if !open.admits(mode) {
                return Err(Error::Busy { vol_id });
            }
            *open.slot(mode) += 1;
        }
        self.notify(VolumeNotification::Opened(vol_id));
        Ok(vol)
    }

    pub(crate) fn close(&self, vol: &Volume, mode: OpenMode) {
        {
            let mut open = vol.open.lock().unwrap();
            let slot = open.slot(mode);
            debug_assert!(*slot > 0);
            *slot = slot.saturating_sub(1);
        }
        self.notify(VolumeNotification::Closed(vol.vol_id));
    }

    fn is_busy(&self, vol_id: u32) -> bool {
        self.get(vol_id)
            .map(|v| v.open.lock().unwrap().total() > 0)
            .unwrap_or(false)
    }
}

/// Install a volume from its table record: build the in-memory state,
/// persist the record in both table mirrors, and announce it.
pub fn install_volume(
    dev: &UbiDevice,
    vol_id: u32,
    rec: VolTableRecord,
) -> Result<Arc<Volume>, Error> {
    if vol_id as usize >= MAX_VOLUMES {
        return Err(Error::Invalid(format!("volume ID {vol_id} out of range")));
    }
    if dev.volumes.get(vol_id).is_some() {
        return Err(Error::Invalid(format!("volume {vol_id} already exists")));
    }
    if rec.reserved_pebs == 0 {
        return Err(Error::Invalid("volume with zero reserved PEBs".into()));
    }

    let geo = dev.io.geometry();
    let available = geo
        .peb_count
        .saturating_sub(geo.bad_peb_reserve)
        .saturating_sub(LAYOUT_VOLUME_EBS)
        .saturating_sub(dev.volumes.reserved_total());
    if rec.reserved_pebs > available {
        return Err(Error::OutOfSpace);
    }

    let vol = Arc::new(Volume::from_record(dev.io.geometry(), vol_id, &rec)?);
    dev.volumes.insert(Arc::clone(&vol));
    if let Err(e) = vtbl::write_record(dev, vol_id, Some(rec)) {
        dev.volumes.remove(vol_id);
        return Err(e);
    }
    dev.volumes.notify(VolumeNotification::Added(vol_id));
    info!("installed volume {vol_id} ({})", vol.name());
    Ok(vol)
}

/// Remove a volume: cancel its consolidation, flush its pending work,
/// release every mapped PEB, then drop the table record.
pub fn remove_volume(dev: &UbiDevice, vol_id: u32) -> Result<(), Error> {
    if dev.volumes.is_busy(vol_id) {
        return Err(Error::Busy { vol_id });
    }
    let vol = dev.volumes.get(vol_id).ok_or(Error::NoVolume(vol_id))?;

    vol.conso_cancel.store(true, Ordering::Release);
    dev.work.flush(vol_id, crate::work::ALL);

    let lebs = vol.reserved_lebs();
    for lnum in 0..lebs {
        crate::eba::unmap_leb(dev, &vol, lnum)?;
    }

    dev.volumes.remove(vol_id);
    vtbl::write_record(dev, vol_id, None)?;
    dev.volumes.notify(VolumeNotification::Removed(vol_id));
    info!("removed volume {vol_id}");
    Ok(())
}

/// Grow or shrink a volume's reservation. Shrinking unmaps the LEBs that
/// fall off the end.
pub fn resize_volume(dev: &UbiDevice, vol_id: u32, new_reserved: u32) -> Result<(), Error> {
    let vol = dev.volumes.get(vol_id).ok_or(Error::NoVolume(vol_id))?;
    let old = vol.reserved_pebs.load(Ordering::Relaxed);
    if new_reserved == 0 {
        return Err(Error::Invalid("resize to zero PEBs".into()));
    }

    if new_reserved > old {
        let geo = dev.io.geometry();
        let available = geo
            .peb_count
            .saturating_sub(geo.bad_peb_reserve)
            .saturating_sub(LAYOUT_VOLUME_EBS)
            .saturating_sub(dev.volumes.reserved_total());
        if new_reserved - old > available {
            return Err(Error::OutOfSpace);
        }
    } else {
        for lnum in new_reserved..old {
            crate::eba::unmap_leb(dev, &vol, lnum)?;
        }
    }

    {
        let mut tbl = vol.eba_tbl.write().unwrap();
        tbl.resize(new_reserved as usize, None);
    }
    vol.reserved_pebs.store(new_reserved, Ordering::Relaxed);

    let mut rec = record_of(&vol);
    rec.reserved_pebs = new_reserved;
    vtbl::write_record(dev, vol_id, Some(rec))?;
    dev.volumes.notify(VolumeNotification::Resized(vol_id));
    Ok(())
}

/// Rename a set of volumes in one table rewrite
pub fn rename_volumes(dev: &UbiDevice, list: Vec<(u32, String)>) -> Result<(), Error> {
    for (vol_id, name) in &list {
        let vol = dev.volumes.get(*vol_id).ok_or(Error::NoVolume(*vol_id))?;
        if name.len() > crate::headers::VOL_NAME_MAX {
            return Err(Error::Invalid(format!("volume name '{name}' too long")));
        }
        vol.rename(name.clone());
    }

    for (vol_id, _) in &list {
        let vol = dev.volumes.get(*vol_id).unwrap();
        vtbl::write_record(dev, *vol_id, Some(record_of(&vol)))?;
        dev.volumes.notify(VolumeNotification::Renamed(*vol_id));
    }
    Ok(())
}

/// The current table record of a volume
pub(crate) fn record_of(vol: &Volume) -> VolTableRecord {
    VolTableRecord {
        reserved_pebs: vol.reserved_pebs.load(Ordering::Relaxed),
        alignment: vol.alignment,
        data_pad: vol.data_pad,
        vol_type: vol.vol_type,
        vol_mode: vol.vol_mode,
        upd_marker: vol.upd_marker,
        name: vol.name(),
        flags: vol.flags,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_open_mode_composition() {
        let mut c = OpenCounts::default();

        assert!(c.admits(OpenMode::ReadOnly));
        c.readers = 2;
        assert!(c.admits(OpenMode::ReadOnly));
        assert!(c.admits(OpenMode::ReadWrite));
        assert!(!c.admits(OpenMode::Exclusive));

        c.writers = 1;
        assert!(c.admits(OpenMode::ReadOnly));
        assert!(!c.admits(OpenMode::ReadWrite));
        assert!(!c.admits(OpenMode::MetaOnly));

        c = OpenCounts {
            metaonly: 1,
            ..Default::default()
        };
        assert!(c.admits(OpenMode::ReadOnly));
        assert!(c.admits(OpenMode::MetaOnly));
        assert!(!c.admits(OpenMode::ReadWrite));

        c = OpenCounts {
            exclusive: 1,
            ..Default::default()
        };
        assert!(!c.admits(OpenMode::ReadOnly));
        assert!(!c.admits(OpenMode::MetaOnly));
    }
}
