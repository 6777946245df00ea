//! The flash I/O facade: a typed wrapper over the raw flash device.
//!
//! Everything the upper layers do to the medium funnels through [Io]. It
//! owns the derived PEB layout, absorbs bounded read retries, verifies
//! writes when extra checks are on, runs the torture-erase procedure on
//! suspect eraseblocks, and holds the one-way read-only latch that trips on
//! unrecoverable write failures.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use log::{debug, error, warn};
use retry::{delay::NoDelay, retry_with_index, OperationResult};

use crate::flash::{FlashError, Mtd, PageUtil, ReadStatus};
use crate::headers::{Ec, VidBuf, EC_HDR_SIZE, VID_HDR_SIZE};
use crate::Error;

/// How many times a failing flash operation is retried before the outcome
/// is surfaced
pub const IO_RETRIES: usize = 3;

/// At most this many eraseblocks per 1024 are expected to go bad over the
/// device lifetime; drives the size of the bad-PEB reserve
pub const MAX_BEB_PER1024: u32 = 20;

/// Write modes, per the paired-page discipline of MLC/TLC media
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum IoMode {
    /// Native cell programming over the whole PEB
    Normal,

    /// Restrict programming to the paired-page-safe prefix of the PEB;
    /// on SLC media this is the same as [IoMode::Normal]
    Slc,
}

/// The UBI view of the device geometry, derived once at attach
#[derive(Debug, Copy, Clone)]
pub struct Geometry {
    pub peb_count: u32,
    pub peb_size: usize,
    pub min_io_size: usize,
    pub max_write_size: usize,
    pub bits_per_cell: u32,

    /// Offset of the VID header page within a PEB
    pub vid_hdr_offset: usize,

    /// Offset of LEB data within a PEB
    pub leb_start: usize,

    /// Usable bytes per LEB for normal-mode PEBs
    pub leb_size: usize,

    /// Usable bytes per LEB for SLC-mode PEBs
    pub slc_leb_size: usize,

    /// PEBs withheld from volumes to replace ones that go bad
    pub bad_peb_reserve: u32,
}

impl Geometry {
    fn new(mtd: &dyn Mtd) -> Result<Self, Error> {
        let raw = mtd.geometry();
        let vid_hdr_offset = raw.min_io_size;
        let leb_start = 2 * raw.min_io_size;

        if raw.peb_size <= leb_start {
            return Err(Error::Invalid(format!(
                "PEB size {} leaves no room for data after the headers",
                raw.peb_size
            )));
        }
        if raw.safe_peb_size() <= leb_start {
            return Err(Error::Invalid(format!(
                "paired-page-safe prefix {} cannot hold the headers",
                raw.safe_peb_size()
            )));
        }

        Ok(Self {
            peb_count: raw.peb_count,
            peb_size: raw.peb_size,
            min_io_size: raw.min_io_size,
            max_write_size: raw.max_write_size,
            bits_per_cell: raw.bits_per_cell,
            vid_hdr_offset,
            leb_start,
            leb_size: raw.peb_size - leb_start,
            slc_leb_size: raw.safe_peb_size() - leb_start,
            bad_peb_reserve: (raw.peb_count * MAX_BEB_PER1024 + 1023) / 1024,
        })
    }

    /// Usable LEB payload for a given write mode
    pub fn leb_size_for(&self, mode: IoMode) -> usize {
        match mode {
            IoMode::Normal => self.leb_size,
            IoMode::Slc => self.slc_leb_size,
        }
    }

    /// Offset of the VID buffer page of a consolidated PEB (the tail page,
    /// programmed after all the data it names)
    pub fn conso_vid_offset(&self) -> usize {
        self.peb_size - self.min_io_size
    }

    /// Byte offset of consolidated LEB number `lpos` within its PEB
    pub fn conso_data_offset(&self, lpos: usize) -> usize {
        self.leb_start + lpos * self.slc_leb_size
    }

    /// How many LEBs a consolidated PEB holds
    pub fn lebs_per_conso_peb(&self) -> usize {
        self.bits_per_cell as usize
    }

    /// Round `len` up to a whole number of pages
    pub fn page_align(&self, len: usize) -> usize {
        len.div_ceil(self.min_io_size) * self.min_io_size
    }
}

/// Outcome of a header read, separating the states the attach logic and the
/// EBA paths care about
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum HdrRead<T> {
    /// Header parsed cleanly
    Ok(T),

    /// Header parsed, but the read needed ECC correction; the PEB should be
    /// scrubbed before the flips accumulate
    Bitflips(T),

    /// The header region is all-ones: nothing was ever written there
    Blank,

    /// Data is present but the magic or CRC check failed
    Bad,

    /// The read itself failed ECC, so the region contents are garbage
    BadEcc,
}

impl<T> HdrRead<T> {
    /// The parsed header, if there is one
    pub fn header(&self) -> Option<&T> {
        match self {
            Self::Ok(t) | Self::Bitflips(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_header(self) -> Option<T> {
        match self {
            Self::Ok(t) | Self::Bitflips(t) => Some(t),
            _ => None,
        }
    }
}

/// The typed flash access layer shared by every UBI component
pub struct Io {
    mtd: Box<dyn Mtd>,
    geo: Geometry,

    /// One-way read-only latch; set on unrecoverable write/erase trouble
    ro_mode: AtomicBool,

    /// Verify writes by reading them back and comparing
    extra_checks: bool,

    bad_peb_count: AtomicU32,

    /// PEB-sized scratch for torture and write verification
    scratch: Mutex<Vec<u8>>,
}

impl Io {
    pub fn new(mtd: Box<dyn Mtd>, extra_checks: bool) -> Result<Self, Error> {
        let geo = Geometry::new(mtd.as_ref())?;
        let scratch = Mutex::new(vec![0u8; geo.peb_size]);
        Ok(Self {
            mtd,
            geo,
            ro_mode: AtomicBool::new(false),
            extra_checks,
            bad_peb_count: AtomicU32::new(0),
            scratch,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    pub fn is_ro(&self) -> bool {
        self.ro_mode.load(Ordering::Acquire)
    }

    /// Trip the read-only latch. There is no way back.
    pub fn set_ro(&self) {
        if !self.ro_mode.swap(true, Ordering::AcqRel) {
            error!("switching to read-only mode");
        }
    }

    fn check_writable(&self) -> Result<(), Error> {
        if self.is_ro() {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    pub fn bad_peb_count(&self) -> u32 {
        self.bad_peb_count.load(Ordering::Relaxed)
    }

    /// Record bad PEBs found during attach, so the reserve accounting starts
    /// from the real state of the medium
    pub fn note_bad_pebs(&self, count: u32) {
        self.bad_peb_count.store(count, Ordering::Relaxed);
    }

    pub fn is_bad(&self, pnum: u32) -> Result<bool, Error> {
        Ok(self.mtd.is_bad(pnum)?)
    }

    /// Mark a PEB bad. Exhausting the bad-PEB reserve is fatal: the device
    /// can no longer guarantee its mappings, so the latch trips.
    pub fn mark_bad(&self, pnum: u32) -> Result<(), Error> {
        self.check_writable()?;
        warn!("marking PEB {pnum} bad");

        if let Err(e) = self.mtd.mark_bad(pnum) {
            error!("cannot mark PEB {pnum} bad: {e}");
            self.set_ro();
            return Err(e.into());
        }

        let bad = self.bad_peb_count.fetch_add(1, Ordering::Relaxed) + 1;
        if bad > self.geo.bad_peb_reserve {
            error!("{bad} bad PEBs exceed the reserve of {}", self.geo.bad_peb_reserve);
            self.set_ro();
        }
        Ok(())
    }

    /// Read `buf.len()` bytes of `pnum` starting at `offset`, retrying
    /// transient failures a bounded number of times. Corrected bit-flips
    /// are a success; the caller decides whether to schedule scrubbing.
    pub fn read(&self, pnum: u32, offset: usize, buf: &mut [u8]) -> Result<ReadStatus, Error> {
        let result = retry_with_index(NoDelay.take(IO_RETRIES), |attempt| {
            match self.mtd.read(pnum, offset, buf) {
                Ok(status) => OperationResult::Ok(status),
                // An uncorrectable report sometimes clears up on a re-read;
                // give the controller a few chances before surfacing it.
                Err(FlashError::Uncorrectable) => {
                    debug!("uncorrectable read on PEB {pnum}, attempt {attempt}");
                    OperationResult::Retry(FlashError::Uncorrectable)
                }
                Err(e) => OperationResult::Err(e),
            }
        });

        result.map_err(|e| match e.error {
            FlashError::Uncorrectable => Error::Uncorrectable { pnum },
            other => other.into(),
        })
    }

    /// Program `buf` into `pnum` at `offset`. `offset` and `buf.len()` must
    /// be page-aligned; `mode` bounds the reachable region of the PEB.
    ///
    /// A verify failure is reported as a program failure; recovery (retry on
    /// a different PEB, torture of this one) is the caller's business.
    pub fn write(&self, pnum: u32, offset: usize, buf: &[u8], mode: IoMode) -> Result<(), Error> {
        self.check_writable()?;

        let limit = match mode {
            IoMode::Normal => self.geo.peb_size,
            IoMode::Slc => self.geo.peb_size / self.geo.bits_per_cell as usize,
        };
        if offset + buf.len() > limit {
            return Err(Error::Invalid(format!(
                "write of {} bytes at {offset} exceeds the {mode:?} limit {limit} of PEB {pnum}",
                buf.len()
            )));
        }

        self.mtd.write(pnum, offset, buf)?;

        if self.extra_checks {
            self.verify_write(pnum, offset, buf)?;
        }
        Ok(())
    }

    fn verify_write(&self, pnum: u32, offset: usize, buf: &[u8]) -> Result<(), Error> {
        let mut scratch = self.scratch.lock().unwrap();
        let readback = &mut scratch[..buf.len()];
        self.read(pnum, offset, readback)?;
        if readback != buf {
            warn!("write verification failed on PEB {pnum} at {offset}");
            return Err(FlashError::Program.into());
        }
        Ok(())
    }

    /// Erase a PEB. With `torture`, run the pattern-check procedure used on
    /// eraseblocks that misbehaved during a write or erase; if the PEB fails
    /// it, mark it bad and report [Error::BadPeb].
    pub fn erase(&self, pnum: u32, torture: bool) -> Result<(), Error> {
        self.check_writable()?;

        if torture {
            return self.torture(pnum);
        }

        match self.mtd.erase(pnum) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("erase of PEB {pnum} failed: {e}");
                Err(e.into())
            }
        }
    }

    /// Write-erase-read validation: patterns that survive an erase prove the
    /// eraseblock dead.
    fn torture(&self, pnum: u32) -> Result<(), Error> {
        const PATTERNS: [u8; 3] = [0xA5, 0x5A, 0x00];

        debug!("torturing PEB {pnum}");
        let mut scratch = self.scratch.lock().unwrap();

        let failed = (|| -> Result<bool, Error> {
            for pattern in PATTERNS {
                self.mtd.erase(pnum)?;
                self.mtd.read(pnum, 0, &mut scratch)?;
                if !scratch.is_erased() {
                    return Ok(true);
                }

                scratch.fill(pattern);
                self.mtd.write(pnum, 0, &scratch)?;
                let expected = pattern;
                self.mtd.read(pnum, 0, &mut scratch)?;
                if scratch.iter().any(|&b| b != expected) {
                    return Ok(true);
                }
            }
            self.mtd.erase(pnum)?;
            self.mtd.read(pnum, 0, &mut scratch)?;
            Ok(!scratch.is_erased())
        })()
        .unwrap_or(true);

        if failed {
            drop(scratch);
            self.mark_bad(pnum)?;
            return Err(Error::BadPeb { pnum });
        }

        debug!("PEB {pnum} passed torture");
        Ok(())
    }

    /// Read and validate the EC header of a PEB
    pub fn read_ec_hdr(&self, pnum: u32) -> Result<HdrRead<Ec>, Error> {
        let mut buf = [0u8; EC_HDR_SIZE];
        let status = match self.read(pnum, 0, &mut buf) {
            Ok(status) => status,
            // ECC failed, so even a parsing header would not be trusted
            Err(Error::Uncorrectable { .. }) => return Ok(HdrRead::BadEcc),
            Err(e) => return Err(e),
        };

        match Ec::decode(&buf) {
            Some(ec) if status == ReadStatus::Bitflips => Ok(HdrRead::Bitflips(ec)),
            Some(ec) => Ok(HdrRead::Ok(ec)),
            None if buf.is_erased() => Ok(HdrRead::Blank),
            None => Ok(HdrRead::Bad),
        }
    }

    /// Stamp the EC header of a (freshly erased) PEB
    pub fn write_ec_hdr(&self, pnum: u32, ec: Ec) -> Result<(), Error> {
        let mut page = vec![0xFFu8; self.geo.min_io_size];
        ec.encode(&mut page[..EC_HDR_SIZE])?;
        self.write(pnum, 0, &page, IoMode::Slc)
    }

    /// Read and validate the VID header(s) of a PEB.
    ///
    /// The normal VID page is probed first. If it is blank, the tail page is
    /// probed too: a consolidated PEB keeps its VID buffer there, written
    /// after the data it names.
    pub fn read_vid_hdrs(&self, pnum: u32) -> Result<HdrRead<VidBuf>, Error> {
        match self.read_vid_page(pnum, self.geo.vid_hdr_offset)? {
            HdrRead::Blank => self.read_vid_page(pnum, self.geo.conso_vid_offset()),
            other => Ok(other),
        }
    }

    fn read_vid_page(&self, pnum: u32, offset: usize) -> Result<HdrRead<VidBuf>, Error> {
        let mut page = vec![0u8; self.geo.min_io_size];
        let status = match self.read(pnum, offset, &mut page) {
            Ok(status) => status,
            Err(Error::Uncorrectable { .. }) => return Ok(HdrRead::BadEcc),
            Err(e) => return Err(e),
        };

        match VidBuf::decode(&page) {
            Some(buf) if status == ReadStatus::Bitflips => Ok(HdrRead::Bitflips(buf)),
            Some(buf) => Ok(HdrRead::Ok(buf)),
            None if page.is_erased() => Ok(HdrRead::Blank),
            None => Ok(HdrRead::Bad),
        }
    }

    /// Write the VID header(s) of a PEB. Single-header buffers go to the
    /// VID page; consolidated buffers go to the tail page.
    pub fn write_vid_hdrs(&self, pnum: u32, vidb: &VidBuf) -> Result<(), Error> {
        if vidb.nhdrs() * VID_HDR_SIZE > self.geo.min_io_size {
            return Err(Error::Invalid(format!(
                "{} VID headers do not fit a {}-byte page",
                vidb.nhdrs(),
                self.geo.min_io_size
            )));
        }

        let mut page = vec![0xFFu8; self.geo.min_io_size];
        vidb.encode(&mut page)?;

        if vidb.nhdrs() == 1 {
            self.write(pnum, self.geo.vid_hdr_offset, &page, IoMode::Slc)
        } else {
            self.write(pnum, self.geo.conso_vid_offset(), &page, IoMode::Normal)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::flash::{MtdGeometry, SimFlash};
    use crate::headers::Vid;

    const GEO: MtdGeometry = MtdGeometry {
        peb_count: 16,
        peb_size: 8192,
        min_io_size: 512,
        max_write_size: 1024,
        bits_per_cell: 2,
    };

    fn new_io(flash: &SimFlash) -> Io {
        Io::new(Box::new(flash.clone()), true).unwrap()
    }

    #[test]
    fn test_geometry() {
        let flash = SimFlash::new(GEO);
        let io = new_io(&flash);
        let geo = io.geometry();

        assert_eq!(geo.vid_hdr_offset, 512);
        assert_eq!(geo.leb_start, 1024);
        assert_eq!(geo.leb_size, 8192 - 1024);
        assert_eq!(geo.slc_leb_size, 4096 - 1024);
        assert_eq!(geo.conso_vid_offset(), 8192 - 512);
        assert_eq!(geo.conso_data_offset(1), 1024 + 3072);
    }

    #[test]
    fn test_ec_hdr_roundtrip() {
        let flash = SimFlash::new(GEO);
        let io = new_io(&flash);

        assert_eq!(io.read_ec_hdr(3).unwrap(), HdrRead::Blank);

        let ec = Ec {
            ec: 12,
            vid_hdr_offset: 512,
            data_offset: 1024,
            image_seq: 99,
        };
        io.write_ec_hdr(3, ec).unwrap();
        assert_eq!(io.read_ec_hdr(3).unwrap(), HdrRead::Ok(ec));
    }

    #[test]
    fn test_vid_hdr_placement() {
        let flash = SimFlash::new(GEO);
        let io = new_io(&flash);

        // Single header goes to the VID page
        let vid = Vid {
            vol_id: 1,
            ..Default::default()
        }
        .sqnum(5);
        io.write_ec_hdr(0, Ec::default()).unwrap();
        io.write_vid_hdrs(0, &VidBuf::single(vid)).unwrap();
        let read = io.read_vid_hdrs(0).unwrap().into_header().unwrap();
        assert_eq!(read.hdrs(), &[vid]);

        // Consolidated buffer goes to the tail page and is still found
        let hdrs: Vec<Vid> = (0..2).map(|i| vid.lnum(i).sqnum(10 + i as u64)).collect();
        io.write_ec_hdr(1, Ec::default()).unwrap();
        io.write_vid_hdrs(1, &VidBuf::consolidated(hdrs.clone()))
            .unwrap();
        let read = io.read_vid_hdrs(1).unwrap().into_header().unwrap();
        assert_eq!(read.hdrs(), &hdrs[..]);
    }

    #[test]
    fn test_bad_header_detected() {
        let flash = SimFlash::new(GEO);
        let io = new_io(&flash);

        // Garbage where the EC header should be
        flash.write(2, 0, &vec![0xABu8; 512]).unwrap();
        assert_eq!(io.read_ec_hdr(2).unwrap(), HdrRead::Bad);

        flash.inject_uncorrectable(4);
        assert_eq!(io.read_ec_hdr(4).unwrap(), HdrRead::BadEcc);
    }

    #[test]
    fn test_slc_write_bound() {
        let flash = SimFlash::new(GEO);
        let io = new_io(&flash);

        let page = vec![0u8; 512];
        // 4096 is the paired-page-safe boundary with bits_per_cell = 2
        assert!(io.write(5, 3584, &page, IoMode::Slc).is_ok());
        assert!(io.write(5, 4096, &page, IoMode::Slc).is_err());
    }

    #[test]
    fn test_torture_retires_dead_peb() {
        let flash = SimFlash::new(GEO);
        let io = new_io(&flash);

        // A PEB whose erase keeps failing flunks torture and is marked bad
        flash.fail_erases(6, 100);
        assert!(matches!(
            io.erase(6, true),
            Err(Error::BadPeb { pnum: 6 })
        ));
        assert!(flash.is_bad(6).unwrap());
    }

    #[test]
    fn test_ro_latch() {
        let flash = SimFlash::new(GEO);
        let io = new_io(&flash);

        io.set_ro();
        let page = vec![0u8; 512];
        assert!(matches!(
            io.write(0, 0, &page, IoMode::Normal),
            Err(Error::ReadOnly)
        ));
        // Reads still work
        let mut buf = vec![0u8; 512];
        io.read(0, 0, &mut buf).unwrap();
    }
}
