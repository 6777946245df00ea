//! Raw flash access over the Linux MTD character devices

use super::{FlashError, Mtd, MtdGeometry, ReadStatus};

use anyhow::{bail, ensure};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// Flash device that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdDev {
    file: File,
    geometry: MtdGeometry,
}

impl MtdDev {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    ///
    /// The MTD ioctl interface does not report the cell density, so callers
    /// on MLC/TLC media must state it; everything else comes from
    /// `MEMGETINFO`.
    pub fn open<P: AsRef<Path>>(path: P, bits_per_cell: u32) -> anyhow::Result<Self> {
        ensure!(
            (1..=3).contains(&bits_per_cell),
            "bits_per_cell must be 1, 2 or 3"
        );

        let file = File::options().read(true).write(true).open(path)?;
        let info = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        };

        ensure!(
            info.size % info.erasesize == 0,
            "MTD size not multiple of erasesize"
        );
        ensure!(
            info.erasesize % info.writesize == 0,
            "MTD erasesize not multiple of writesize"
        );

        let geometry = MtdGeometry {
            peb_count: info.size / info.erasesize,
            peb_size: info.erasesize as usize,
            min_io_size: info.writesize as usize,
            max_write_size: info.erasesize as usize,
            bits_per_cell,
        };

        Ok(Self { file, geometry })
    }

    /// Look a device up by its partition name in `/proc/mtd` and open it
    pub fn open_named(name: &str, bits_per_cell: u32) -> anyhow::Result<Self> {
        // /proc/mtd prints names quoted
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                let mtd_dev = line.split(':').next().unwrap();
                return Self::open(Path::new("/dev").join(mtd_dev), bits_per_cell);
            }
        }

        bail!("MTD device {name} could not be found");
    }

    fn offset_for(&self, pnum: u32, offset: usize, len: usize) -> Result<u64, FlashError> {
        if pnum >= self.geometry.peb_count {
            return Err(FlashError::Bounds(format!("PEB {pnum} out of range")));
        }
        if offset + len > self.geometry.peb_size {
            return Err(FlashError::Bounds(format!(
                "PEB {pnum}, range {offset}..{} out of bounds",
                offset + len
            )));
        }
        Ok(pnum as u64 * self.geometry.peb_size as u64 + offset as u64)
    }

    fn peb_base(&self, pnum: u32) -> Result<u64, FlashError> {
        self.offset_for(pnum, 0, 0)
    }
}

impl Mtd for MtdDev {
    fn geometry(&self) -> MtdGeometry {
        self.geometry
    }

    fn read(&self, pnum: u32, offset: usize, buf: &mut [u8]) -> Result<ReadStatus, FlashError> {
        let at = self.offset_for(pnum, offset, buf.len())?;
        match self.file.read_exact_at(buf, at) {
            Ok(()) => Ok(ReadStatus::Clean),
            Err(e) => match e.raw_os_error() {
                Some(code) if code == nix::errno::Errno::EUCLEAN as i32 => {
                    Ok(ReadStatus::Bitflips)
                }
                Some(code) if code == nix::errno::Errno::EBADMSG as i32 => {
                    Err(FlashError::Uncorrectable)
                }
                _ => Err(e.into()),
            },
        }
    }

    fn write(&self, pnum: u32, offset: usize, buf: &[u8]) -> Result<(), FlashError> {
        let at = self.offset_for(pnum, offset, buf.len())?;
        self.file
            .write_all_at(buf, at)
            .map_err(|_| FlashError::Program)
    }

    fn erase(&self, pnum: u32) -> Result<(), FlashError> {
        let erase_info = ioctl::erase_info_user {
            start: self.peb_base(pnum)? as u32,
            length: self.geometry.peb_size as u32,
        };
        unsafe {
            ioctl::memerase(self.file.as_raw_fd(), &erase_info).map_err(|_| FlashError::Erase)?;
        }
        Ok(())
    }

    fn is_bad(&self, pnum: u32) -> Result<bool, FlashError> {
        let base = self.peb_base(pnum)?;
        let bad = unsafe {
            ioctl::memgetbadblock(self.file.as_raw_fd(), &base)
                .map_err(|e| FlashError::Io(std::io::Error::from_raw_os_error(e as i32)))?
        };
        Ok(bad != 0)
    }

    fn mark_bad(&self, pnum: u32) -> Result<(), FlashError> {
        let base = self.peb_base(pnum)?;
        unsafe {
            ioctl::memsetbadblock(self.file.as_raw_fd(), &base)
                .map_err(|e| FlashError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
        }
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use nix::{ioctl_read, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);
}
