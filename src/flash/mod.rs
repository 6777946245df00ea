//! Abstractions and code to access raw erase-block flash devices.
//!
//! Everything above this module addresses the flash as an array of physical
//! eraseblocks (PEBs) identified by `pnum`. Writes are page-granular and must
//! progress forward within a PEB; reads may use any byte range. MLC/TLC
//! devices report `bits_per_cell > 1`, and only the first `1/bits_per_cell`
//! of each PEB is safe against paired-page corruption when programmed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use thiserror::Error;

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for operating on `[u8]`s that represent flash contents
pub trait PageUtil {
    /// Does this region contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// Errors surfaced by the raw flash interface
#[derive(Debug, Error)]
pub enum FlashError {
    /// The read failed ECC correction; returned data is unusable.
    #[error("uncorrectable ECC error")]
    Uncorrectable,

    /// The eraseblock is marked bad and cannot be accessed.
    #[error("eraseblock is marked bad")]
    Bad,

    /// The program operation failed; the eraseblock contents are suspect.
    #[error("program operation failed")]
    Program,

    /// The erase operation failed; the eraseblock is probably dying.
    #[error("erase operation failed")]
    Erase,

    /// An access was out of bounds or violated the forward-write rule.
    #[error("{0}")]
    Bounds(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// `std::io::Error` has no `PartialEq`, so it's compared by kind here; the
// crate's `Error` enum wraps `FlashError` and needs `Eq`/`PartialEq` to
// satisfy `eba::MoveError`'s derive.
impl PartialEq for FlashError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Uncorrectable, Self::Uncorrectable) => true,
            (Self::Bad, Self::Bad) => true,
            (Self::Program, Self::Program) => true,
            (Self::Erase, Self::Erase) => true,
            (Self::Bounds(a), Self::Bounds(b)) => a == b,
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

impl Eq for FlashError {}

/// Successful reads distinguish clean data from data that needed correction
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ReadStatus {
    /// Data read back without any ECC intervention
    Clean,

    /// Data is good, but bit-flips were corrected; the block should be
    /// scrubbed before the flips accumulate beyond correctability
    Bitflips,
}

/// A pub-fields struct describing the data layout of a raw flash device
#[derive(Debug, Copy, Clone)]
pub struct MtdGeometry {
    /// Number of physical eraseblocks
    pub peb_count: u32,

    /// Bytes per physical eraseblock
    pub peb_size: usize,

    /// Minimal program unit (NAND page size)
    pub min_io_size: usize,

    /// Largest single program the controller accepts
    pub max_write_size: usize,

    /// 1 for SLC, 2 for MLC, 3 for TLC
    pub bits_per_cell: u32,
}

impl MtdGeometry {
    pub fn pages_per_peb(&self) -> u32 {
        (self.peb_size / self.min_io_size) as u32
    }

    /// The prefix of each PEB that stays intact if a later paired-page
    /// program is interrupted. On SLC devices this is the whole PEB.
    pub fn safe_peb_size(&self) -> usize {
        self.peb_size / self.bits_per_cell as usize
    }
}

/// Represents a raw flash device, addressed by physical eraseblock
///
/// Implementations use interior locking where needed; the UBI layers call
/// this trait from several threads at once (callers plus the background
/// worker), though never concurrently for the same PEB.
pub trait Mtd: Send + Sync {
    /// Get the layout of the device
    fn geometry(&self) -> MtdGeometry;

    /// Read `buf.len()` bytes from `pnum` starting at byte `offset`
    fn read(&self, pnum: u32, offset: usize, buf: &mut [u8]) -> Result<ReadStatus, FlashError>;

    /// Program `buf` into `pnum` starting at byte `offset`
    ///
    /// `offset` and `buf.len()` must be multiples of the page size, and the
    /// write must not touch pages at or below any previously-programmed page
    /// of this eraseblock. Skipped pages become nonwritable, per the
    /// sequential-program requirement of MLC NANDs.
    fn write(&self, pnum: u32, offset: usize, buf: &[u8]) -> Result<(), FlashError>;

    /// Erase an eraseblock, making all of its pages writable again
    fn erase(&self, pnum: u32) -> Result<(), FlashError>;

    /// Is this eraseblock marked bad?
    fn is_bad(&self, pnum: u32) -> Result<bool, FlashError>;

    /// Mark an eraseblock bad. It cannot be accessed afterwards.
    fn mark_bad(&self, pnum: u32) -> Result<(), FlashError>;
}

/// A simulated in-memory flash device, for testing purposes
///
/// Clones share the same underlying storage, so a test can hand one handle
/// to the UBI instance and keep another for fault injection and state
/// capture. [SimFlash::capture_after_writes] records a deep copy of the
/// array at a precise program count, which is how the tests freeze the
/// medium "at the instant the power failed".
#[derive(Debug, Clone)]
pub struct SimFlash {
    inner: Arc<SimInner>,
}

#[derive(Debug)]
struct SimInner {
    geometry: MtdGeometry,
    state: Mutex<SimState>,
}

#[derive(Debug, Clone)]
struct SimState {
    blocks: Vec<SimBlock>,
    faults: FaultPlan,
}

/// A block of [SimFlash]
#[derive(Debug, Clone)]
struct SimBlock {
    /// All bytes up to the write high-water mark (reads past it yield 0xFF)
    data: Vec<u8>,

    /// Is this block marked bad?
    marked_bad: bool,
}

/// Injectable faults and the power-cut capture counter
#[derive(Debug, Clone, Default)]
struct FaultPlan {
    /// Reads of these PEBs fail ECC entirely
    uncorrectable: HashSet<u32>,

    /// Reads of these PEBs succeed with corrected bit-flips
    bitflips: HashSet<u32>,

    /// Fail the next N program operations on a PEB
    program_failures: HashMap<u32, u32>,

    /// Fail the next N erase operations on a PEB
    erase_failures: HashMap<u32, u32>,

    /// When this hits zero on a program completion, deep-copy the array
    capture_countdown: Option<u64>,

    /// The captured array, if the countdown elapsed
    captured: Option<Vec<SimBlock>>,
}

impl SimFlash {
    /// Create an empty simulated device with the specified geometry
    pub fn new(geometry: MtdGeometry) -> Self {
        assert_eq!(geometry.peb_size % geometry.min_io_size, 0);
        let blocks = vec![
            SimBlock {
                data: Vec::new(),
                marked_bad: false,
            };
            geometry.peb_count as usize
        ];
        Self {
            inner: Arc::new(SimInner {
                geometry,
                state: Mutex::new(SimState {
                    blocks,
                    faults: FaultPlan::default(),
                }),
            }),
        }
    }

    /// Make every read of `pnum` fail as an uncorrectable ECC error
    pub fn inject_uncorrectable(&self, pnum: u32) {
        self.state().faults.uncorrectable.insert(pnum);
    }

    /// Make every read of `pnum` report corrected bit-flips (until erased)
    pub fn inject_bitflips(&self, pnum: u32) {
        self.state().faults.bitflips.insert(pnum);
    }

    /// Fail the next `count` program operations on `pnum`
    pub fn fail_programs(&self, pnum: u32, count: u32) {
        self.state().faults.program_failures.insert(pnum, count);
    }

    /// Fail the next `count` erase operations on `pnum`
    pub fn fail_erases(&self, pnum: u32, count: u32) {
        self.state().faults.erase_failures.insert(pnum, count);
    }

    /// Arm the power-cut capture: after `count` more successful program
    /// operations, a deep copy of the array is taken. Retrieve it with
    /// [Self::take_capture].
    pub fn capture_after_writes(&self, count: u64) {
        self.state().faults.capture_countdown = Some(count);
    }

    /// Take the armed capture as a standalone device, if it has triggered
    pub fn take_capture(&self) -> Option<SimFlash> {
        let geometry = self.inner.geometry;
        let blocks = self.state().faults.captured.take()?;
        Some(SimFlash {
            inner: Arc::new(SimInner {
                geometry,
                state: Mutex::new(SimState {
                    blocks,
                    faults: FaultPlan::default(),
                }),
            }),
        })
    }

    /// Deep-copy the current array into a standalone device
    pub fn snapshot(&self) -> SimFlash {
        let geometry = self.inner.geometry;
        let blocks = self.state().blocks.clone();
        SimFlash {
            inner: Arc::new(SimInner {
                geometry,
                state: Mutex::new(SimState {
                    blocks,
                    faults: FaultPlan::default(),
                }),
            }),
        }
    }

    /// Count of PEBs currently holding no data at all (fully erased)
    pub fn erased_peb_count(&self) -> usize {
        self.state()
            .blocks
            .iter()
            .filter(|b| !b.marked_bad && b.data.is_erased())
            .count()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.inner.state.lock().unwrap()
    }

    fn check_bounds(&self, pnum: u32, offset: usize, len: usize) -> Result<(), FlashError> {
        let geo = self.inner.geometry;
        if pnum >= geo.peb_count {
            return Err(FlashError::Bounds(format!("PEB {pnum} out of range")));
        }
        if offset + len > geo.peb_size {
            return Err(FlashError::Bounds(format!(
                "range {offset}..{} beyond PEB size",
                offset + len
            )));
        }
        Ok(())
    }
}

impl Mtd for SimFlash {
    fn geometry(&self) -> MtdGeometry {
        self.inner.geometry
    }

    fn read(&self, pnum: u32, offset: usize, buf: &mut [u8]) -> Result<ReadStatus, FlashError> {
        self.check_bounds(pnum, offset, buf.len())?;
        let state = self.state();

        if state.faults.uncorrectable.contains(&pnum) {
            return Err(FlashError::Uncorrectable);
        }

        let block = &state.blocks[pnum as usize];
        if block.marked_bad {
            return Err(FlashError::Bad);
        }

        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = block.data.get(offset + i).copied().unwrap_or(0xFF);
        }

        if state.faults.bitflips.contains(&pnum) {
            Ok(ReadStatus::Bitflips)
        } else {
            Ok(ReadStatus::Clean)
        }
    }

    fn write(&self, pnum: u32, offset: usize, buf: &[u8]) -> Result<(), FlashError> {
        self.check_bounds(pnum, offset, buf.len())?;
        let page_size = self.inner.geometry.min_io_size;
        if offset % page_size != 0 || buf.len() % page_size != 0 {
            return Err(FlashError::Bounds(format!(
                "write at {offset}+{} not page-aligned",
                buf.len()
            )));
        }

        let mut state = self.state();

        if let Some(count) = state.faults.program_failures.get_mut(&pnum) {
            if *count > 0 {
                *count -= 1;
                return Err(FlashError::Program);
            }
        }

        let block = &mut state.blocks[pnum as usize];
        if block.marked_bad {
            return Err(FlashError::Bad);
        }
        if offset < block.data.len() {
            return Err(FlashError::Bounds(format!(
                "write at {offset} behind high-water mark {}",
                block.data.len()
            )));
        }

        // Programming all-0xFF content is a no-op and does not advance the
        // high-water mark, mirroring how real NAND treats erased patterns.
        if !buf.is_erased() {
            block.data.resize(offset, 0xFF);
            block.data.extend_from_slice(buf);
        }

        if let Some(countdown) = state.faults.capture_countdown.as_mut() {
            if *countdown > 0 {
                *countdown -= 1;
            }
            if *countdown == 0 {
                state.faults.capture_countdown = None;
                let copy = state.blocks.clone();
                state.faults.captured = Some(copy);
            }
        }

        Ok(())
    }

    fn erase(&self, pnum: u32) -> Result<(), FlashError> {
        self.check_bounds(pnum, 0, 0)?;
        let mut state = self.state();

        if let Some(count) = state.faults.erase_failures.get_mut(&pnum) {
            if *count > 0 {
                *count -= 1;
                return Err(FlashError::Erase);
            }
        }

        if state.blocks[pnum as usize].marked_bad {
            return Err(FlashError::Bad);
        }

        state.blocks[pnum as usize].data.clear();
        state.faults.bitflips.remove(&pnum);
        state.faults.uncorrectable.remove(&pnum);
        Ok(())
    }

    fn is_bad(&self, pnum: u32) -> Result<bool, FlashError> {
        self.check_bounds(pnum, 0, 0)?;
        Ok(self.state().blocks[pnum as usize].marked_bad)
    }

    fn mark_bad(&self, pnum: u32) -> Result<(), FlashError> {
        self.check_bounds(pnum, 0, 0)?;
        let mut state = self.state();
        state.blocks[pnum as usize].marked_bad = true;
        state.blocks[pnum as usize].data.clear();
        state.faults.bitflips.remove(&pnum);
        state.faults.uncorrectable.remove(&pnum);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    pub(crate) const TEST_GEOMETRY: MtdGeometry = MtdGeometry {
        peb_count: 8,
        peb_size: 4096,
        min_io_size: 256,
        max_write_size: 512,
        bits_per_cell: 1,
    };

    #[test]
    fn test_sim_read_write() {
        let flash = SimFlash::new(TEST_GEOMETRY);

        let data_in = vec![0xA5u8; 256];
        let mut data_out = vec![0u8; 256];

        flash.write(0, 512, &data_in).unwrap();
        assert!(flash.write(0, 256, &data_in).is_err());

        assert_eq!(flash.read(0, 256, &mut data_out).unwrap(), ReadStatus::Clean);
        assert!(data_out.is_erased());

        flash.read(0, 512, &mut data_out).unwrap();
        assert_eq!(data_out, data_in);

        flash.read(0, 768, &mut data_out).unwrap();
        assert!(data_out.is_erased());
    }

    #[test]
    fn test_sim_mark_bad() {
        let flash = SimFlash::new(TEST_GEOMETRY);
        assert!(!flash.is_bad(3).unwrap());
        flash.mark_bad(3).unwrap();
        assert!(flash.is_bad(3).unwrap());
        assert!(matches!(flash.erase(3), Err(FlashError::Bad)));
    }

    #[test]
    fn test_sim_faults() {
        let flash = SimFlash::new(TEST_GEOMETRY);
        let mut buf = vec![0u8; 256];

        flash.inject_bitflips(1);
        assert_eq!(flash.read(1, 0, &mut buf).unwrap(), ReadStatus::Bitflips);
        flash.erase(1).unwrap();
        assert_eq!(flash.read(1, 0, &mut buf).unwrap(), ReadStatus::Clean);

        flash.inject_uncorrectable(2);
        assert!(matches!(
            flash.read(2, 0, &mut buf),
            Err(FlashError::Uncorrectable)
        ));

        flash.fail_programs(4, 1);
        assert!(matches!(
            flash.write(4, 0, &vec![0u8; 256]),
            Err(FlashError::Program)
        ));
        flash.write(4, 0, &vec![0u8; 256]).unwrap();
    }

    #[test]
    fn test_sim_capture() {
        let flash = SimFlash::new(TEST_GEOMETRY);
        flash.capture_after_writes(2);

        flash.write(0, 0, &vec![0x11u8; 256]).unwrap();
        assert!(flash.take_capture().is_none());
        flash.write(0, 256, &vec![0x22u8; 256]).unwrap();
        flash.write(0, 512, &vec![0x33u8; 256]).unwrap();

        let frozen = flash.take_capture().unwrap();
        let mut buf = vec![0u8; 256];
        frozen.read(0, 256, &mut buf).unwrap();
        assert_eq!(buf, vec![0x22u8; 256]);
        frozen.read(0, 512, &mut buf).unwrap();
        assert!(buf.is_erased(), "write 3 must not be in the capture");
    }

    #[test]
    fn test_shared_handles() {
        let flash = SimFlash::new(TEST_GEOMETRY);
        let other = flash.clone();

        flash.write(5, 0, &vec![0xABu8; 256]).unwrap();
        let mut buf = vec![0u8; 256];
        other.read(5, 0, &mut buf).unwrap();
        assert_eq!(buf, vec![0xABu8; 256]);
    }
}
