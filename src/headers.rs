//! This module contains the code necessary to read, write, and manipulate the
//! on-flash records (EC headers, VID headers, volume-table records), with CRC
//! verification/computation.
//!
//! The EC header lives at offset 0 of every PEB and survives volume churn;
//! VID headers identify the logical eraseblock(s) stored in a PEB. A PEB
//! holding consolidated data carries several VID headers back to back in one
//! page, which [VidBuf] models.

use crc::{Crc, CRC_32_JAMCRC};
use deku::prelude::*;
pub use deku::{DekuContainerRead, DekuContainerWrite};

pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);
const UBI_VERSION: u8 = 1;

pub const EC_HDR_MAGIC: &[u8] = b"UBI#";
pub const VID_HDR_MAGIC: &[u8] = b"UBI!";

pub const EC_HDR_SIZE: usize = 64;
pub const VID_HDR_SIZE: usize = 64;
pub const VTBL_RECORD_SIZE: usize = 172;

pub const VOL_NAME_MAX: usize = 127;

/// The raw erase-counter header, bit-exact as stored on flash
#[derive(Debug, Eq, PartialEq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct EcHdr {
    pub magic: [u8; 4],
    pub version: u8,
    pub padding1: [u8; 3],
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
    pub padding2: [u8; 32],
    pub hdr_crc: u32,
}

/// The raw volume-identifier header, bit-exact as stored on flash
///
/// `vol_mode` occupies the first byte of what the pre-MLC format left as
/// padding after `lnum`, so normal-mode headers remain interchangeable with
/// media written by implementations that predate paired-page awareness.
#[derive(Debug, Eq, PartialEq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct VidHdr {
    pub magic: [u8; 4],
    pub version: u8,
    pub vol_type: u8,
    pub copy_flag: u8,
    pub compat: u8,
    pub vol_id: u32,
    pub lnum: u32,
    pub vol_mode: u8,
    pub padding1: [u8; 3],
    pub data_size: u32,
    pub used_ebs: u32,
    pub data_pad: u32,
    pub data_crc: u32,
    pub padding2: [u8; 4],
    pub sqnum: u64,
    pub padding3: [u8; 12],
    pub hdr_crc: u32,
}

/// The raw volume-table record, bit-exact as stored in the layout volume
#[derive(Debug, Eq, PartialEq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct VtblRecord {
    pub reserved_pebs: u32,
    pub alignment: u32,
    pub data_pad: u32,
    pub vol_type: u8,
    pub upd_marker: u8,
    pub name_len: u16,
    pub name: [u8; 128],
    pub flags: u8,
    pub vol_mode: u8,
    pub padding: [u8; 22],
    pub crc: u32,
}

/// Decoding of the magic-tagged records: deserialize, then insist on the
/// right magic, version and CRC before handing the header out. Anything
/// that fails a check is indistinguishable from garbage to the callers.
pub trait ParseHeader<'a>: Sized + DekuContainerRead<'a> + ComputeCrc {
    fn get_magic() -> &'static [u8];
    fn get_hdr_magic(&self) -> &[u8];
    fn get_hdr_version(&self) -> u8;

    fn parse(buf: &'a [u8]) -> Option<Self> {
        let (_, header) = Self::from_bytes((buf, 0)).ok()?;

        if header.get_hdr_magic() != Self::get_magic() {
            return None;
        }
        if header.get_hdr_version() != UBI_VERSION {
            return None;
        }

        header.check_crc().then_some(header)
    }
}

impl ParseHeader<'_> for EcHdr {
    fn get_magic() -> &'static [u8] {
        EC_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

impl ParseHeader<'_> for VidHdr {
    fn get_magic() -> &'static [u8] {
        VID_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

/// The trailing-CRC discipline shared by every record: the checksum covers
/// the whole serialized record minus its own last four bytes.
pub trait ComputeCrc: DekuContainerWrite {
    fn compute_crc(&self) -> u32 {
        let bytes = self.to_bytes().unwrap();
        let body = &bytes[..bytes.len() - std::mem::size_of::<u32>()];
        UBI_CRC.checksum(body)
    }

    fn check_crc(&self) -> bool {
        self.compute_crc() == self.get_crc()
    }

    fn fix_crc(&mut self) {
        let crc = self.compute_crc();
        self.set_crc(crc);
    }

    fn get_crc(&self) -> u32;
    fn set_crc(&mut self, crc: u32);
}

impl ComputeCrc for EcHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl ComputeCrc for VidHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl ComputeCrc for VtblRecord {
    fn get_crc(&self) -> u32 {
        self.crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.crc = crc;
    }
}

/// The decoded view of an EC header: only the fields the engine acts on,
/// with magic, version and CRC handled by the raw [EcHdr] codec underneath
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
}

impl Ec {
    /// Replace the erase counter
    pub fn ec(mut self, ec: u64) -> Self {
        self.ec = ec;
        self
    }

    /// Bump the erase counter by one
    pub fn inc_ec(mut self) -> Self {
        self.ec += 1;
        self
    }

    /// Parse from raw flash bytes, rejecting bad magic/version/CRC
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        EcHdr::parse(bytes).map(|x| x.into())
    }

    /// Serialize, with a freshly computed CRC, into the front of
    /// `out_bytes`
    pub fn encode(self, out_bytes: &mut [u8]) -> Result<(), DekuError> {
        let bytes = EcHdr::from(self).to_bytes()?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or_else(|| DekuError::InvalidParam("out_bytes too small".into()))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }
}

impl From<EcHdr> for Ec {
    fn from(value: EcHdr) -> Self {
        let EcHdr {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            ..
        } = value;

        Self {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        }
    }
}

impl From<Ec> for EcHdr {
    fn from(value: Ec) -> EcHdr {
        let Ec {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        } = value;

        let mut target = Self {
            magic: EC_HDR_MAGIC.try_into().unwrap(),
            version: UBI_VERSION,

            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
        };

        target.fix_crc();
        target
    }
}

/// Whether a volume's LEBs can be rewritten or are laid down once
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// LEBs may be mapped, unmapped and replaced at any time
    #[default]
    Dynamic,

    /// LEBs are written once, carry a payload CRC, and change only through
    /// a whole-volume update
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            _ => Err(()),
        }
    }
}

/// How a PEB's pages are programmed, and therefore how much of the PEB is
/// usable and power-cut safe
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolMode {
    /// Native cell programming; the whole PEB is usable
    #[default]
    Normal,

    /// Only the paired-page-safe prefix of the PEB is programmed, trading
    /// capacity for power-cut safety on MLC/TLC media
    Slc,

    /// Full-density PEB packed by consolidation; holds several LEBs, with
    /// the VID buffer written last into the tail page
    MlcSafe,
}

impl From<VolMode> for u8 {
    fn from(value: VolMode) -> Self {
        match value {
            VolMode::Normal => 0,
            VolMode::Slc => 1,
            VolMode::MlcSafe => 2,
        }
    }
}

impl TryFrom<u8> for VolMode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Slc),
            2 => Ok(Self::MlcSafe),
            _ => Err(()),
        }
    }
}

/// The decoded view of a VID header: which LEB lives in the PEB, and how
/// its payload is laid out and guarded
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    /// Type of the owning volume.
    pub vol_type: VolType,

    /// The programming mode the PEB was written in.
    pub vol_mode: VolMode,

    /// Raised when the payload was transplanted rather than written by a
    /// consumer — a wear-levelling copy, an atomic change, a pack slot.
    /// Attach only trusts such a header after its `data_crc` checks out.
    pub copy_flag: bool,

    /// For internal volumes, how an implementation that does not recognise
    /// the volume should treat it.
    pub compat: u8,

    /// Owning volume; doubles as its slot in the volume table.
    pub vol_id: u32,

    /// Logical eraseblock number within the volume.
    pub lnum: u32,

    /// Bytes covered by `data_crc`: the payload length on static LEBs,
    /// copies and atomic changes, 0 on plain dynamic writes.
    pub data_size: u32,

    /// How many LEBs a static volume occupies; 0 on dynamic volumes.
    pub used_ebs: u32,

    /// Tail bytes of the LEB sacrificed so its size is a multiple of the
    /// volume alignment.
    pub data_pad: u32,

    /// CRC over the first `data_size` payload bytes, 0 when nothing is
    /// covered.
    pub data_crc: u32,

    /// Value drawn from the global sequence counter just before this header
    /// was written; of two headers claiming one LEB, the higher wins.
    pub sqnum: u64,
}

impl Vid {
    /// Stamp the sequence number
    pub fn sqnum(mut self, sqnum: u64) -> Self {
        self.sqnum = sqnum;
        self
    }

    /// Retarget the header at LEB `lnum`
    pub fn lnum(mut self, lnum: u32) -> Self {
        self.lnum = lnum;
        self
    }

    /// Mark this `Vid` as the destination of a wear-leveling copy, carrying
    /// `data_size` bytes whose CRC is `data_crc`
    pub fn copy_of(mut self, data_size: u32, data_crc: u32) -> Self {
        self.copy_flag = true;
        self.data_size = data_size;
        self.data_crc = data_crc;
        self
    }

    /// Parse from raw flash bytes, rejecting bad magic/version/CRC and
    /// unknown type or mode codes
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        VidHdr::parse(bytes).and_then(|x| x.try_into().ok())
    }

    /// Serialize, with a freshly computed CRC, into the front of
    /// `out_bytes`
    pub fn encode(self, out_bytes: &mut [u8]) -> Result<(), DekuError> {
        let bytes = VidHdr::from(self).to_bytes()?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or_else(|| DekuError::InvalidParam("out_bytes too small".into()))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }
}

impl TryFrom<VidHdr> for Vid {
    type Error = ();

    fn try_from(value: VidHdr) -> Result<Self, Self::Error> {
        let VidHdr {
            vol_type,
            vol_mode,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            ..
        } = value;

        let vol_type = vol_type.try_into()?;
        let vol_mode = vol_mode.try_into()?;
        let copy_flag = copy_flag != 0;

        Ok(Self {
            vol_type,
            vol_mode,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        })
    }
}

impl From<Vid> for VidHdr {
    fn from(value: Vid) -> VidHdr {
        let Vid {
            vol_type,
            vol_mode,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        } = value;

        let vol_type = vol_type.into();
        let vol_mode = vol_mode.into();
        let copy_flag = copy_flag.into();

        let mut target = Self {
            magic: VID_HDR_MAGIC.try_into().unwrap(),
            version: UBI_VERSION,

            vol_type,
            vol_mode,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
            padding3: Default::default(),
        };

        target.fix_crc();
        target
    }
}

/// The VID headers of one PEB
///
/// Ordinary PEBs carry a single header at the VID offset. A consolidated
/// PEB carries one header per packed LEB, back to back in the tail page;
/// the position of a header within the buffer is the LEB's `lpos`.
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct VidBuf {
    hdrs: Vec<Vid>,
}

impl VidBuf {
    /// A buffer holding a single VID header
    pub fn single(vid: Vid) -> Self {
        Self { hdrs: vec![vid] }
    }

    /// A buffer holding one header per consolidated LEB, in `lpos` order
    pub fn consolidated(hdrs: Vec<Vid>) -> Self {
        Self { hdrs }
    }

    pub fn nhdrs(&self) -> usize {
        self.hdrs.len()
    }

    pub fn hdrs(&self) -> &[Vid] {
        &self.hdrs
    }

    /// The header at `lpos`
    pub fn get(&self, lpos: usize) -> Option<&Vid> {
        self.hdrs.get(lpos)
    }

    /// Parse consecutive VID headers from a page buffer. Returns `None`
    /// when the first record does not parse; trailing records are consumed
    /// while they keep parsing.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut hdrs = Vec::new();
        for chunk in bytes.chunks_exact(VID_HDR_SIZE) {
            match Vid::decode(chunk) {
                Some(vid) => hdrs.push(vid),
                None => break,
            }
        }
        if hdrs.is_empty() {
            return None;
        }
        Some(Self { hdrs })
    }

    /// Write all headers into a page buffer, back to back from offset 0
    pub fn encode(&self, out_bytes: &mut [u8]) -> Result<(), DekuError> {
        if out_bytes.len() < self.hdrs.len() * VID_HDR_SIZE {
            return Err(DekuError::InvalidParam("out_bytes too small".into()));
        }
        for (vid, chunk) in self.hdrs.iter().zip(out_bytes.chunks_exact_mut(VID_HDR_SIZE)) {
            vid.encode(chunk)?;
        }
        Ok(())
    }
}

/// The decoded view of one volume-table slot
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct VolTableRecord {
    /// PEBs set aside for this volume.
    pub reserved_pebs: u32,

    /// LEB sizes are cut down to a multiple of this.
    pub alignment: u32,

    /// Tail bytes of each LEB given up to satisfy the alignment.
    pub data_pad: u32,

    /// Type of the volume.
    pub vol_type: VolType,

    /// The programming mode of the volume's PEBs.
    pub vol_mode: VolMode,

    /// Raised while a whole-volume update is staged; still set at attach
    /// means the update was interrupted and the contents are suspect.
    pub upd_marker: bool,

    /// Volume name. Stored as UTF-8, though sticking to ASCII keeps
    /// foreign tooling comfortable.
    pub name: String,

    /// Volume flags (autoresize and friends).
    pub flags: u8,
}

impl VolTableRecord {
    /// Parse one table slot, rejecting bad CRCs and unknown codes
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (_, vtblrec) = VtblRecord::from_bytes((bytes, 0)).ok()?;
        if !vtblrec.check_crc() {
            return None;
        }
        vtblrec.try_into().ok()
    }

    /// Serialize with a freshly computed CRC
    pub fn into_bytes(self) -> Vec<u8> {
        VtblRecord::from(self).to_bytes().unwrap()
    }

    /// The encoding of an unoccupied table slot: all-zero fields under a
    /// valid CRC
    pub fn none_into_bytes() -> Vec<u8> {
        let mut record = VtblRecord {
            reserved_pebs: Default::default(),
            alignment: Default::default(),
            data_pad: Default::default(),
            vol_type: Default::default(),
            upd_marker: Default::default(),
            name: std::array::from_fn(|_| 0u8),
            name_len: Default::default(),
            flags: Default::default(),
            vol_mode: Default::default(),
            crc: Default::default(),
            padding: Default::default(),
        };
        record.fix_crc();
        record.to_bytes().unwrap()
    }
}

impl TryFrom<VtblRecord> for VolTableRecord {
    type Error = ();

    fn try_from(value: VtblRecord) -> Result<Self, Self::Error> {
        let VtblRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            vol_mode,
            upd_marker,
            name,
            name_len,
            flags,
            ..
        } = value;

        let vol_type = vol_type.try_into()?;
        let vol_mode = vol_mode.try_into()?;
        let upd_marker = upd_marker != 0;
        if name_len as usize > VOL_NAME_MAX {
            return Err(());
        }
        let name = std::str::from_utf8(&name[..name_len as usize])
            .map_err(|_| ())?
            .to_string();

        Ok(Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            vol_mode,
            upd_marker,
            name,
            flags,
        })
    }
}

impl From<VolTableRecord> for VtblRecord {
    fn from(value: VolTableRecord) -> VtblRecord {
        let VolTableRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            vol_mode,
            upd_marker,
            name,
            flags,
        } = value;

        let vol_type = vol_type.into();
        let vol_mode = vol_mode.into();
        let upd_marker = upd_marker.into();
        let name_len = name.len() as _;

        let name_bytes = name.as_bytes();
        let mut name = std::array::from_fn(|_| 0u8);
        name[..name_bytes.len()].copy_from_slice(name_bytes);

        let mut target = Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            vol_mode,
            upd_marker,
            name,
            name_len,
            flags,

            crc: Default::default(),
            padding: Default::default(),
        };

        target.fix_crc();
        target
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(EcHdr::from(Ec::default()).to_bytes().unwrap().len(), EC_HDR_SIZE);
        assert_eq!(
            VidHdr::from(Vid::default()).to_bytes().unwrap().len(),
            VID_HDR_SIZE
        );
        assert_eq!(
            VolTableRecord::default().into_bytes().len(),
            VTBL_RECORD_SIZE
        );
    }

    #[test]
    fn test_encode() {
        let ec = Ec::default();
        let vid = Vid {
            vol_mode: VolMode::Slc,
            ..Default::default()
        };
        let vtbl = VolTableRecord {
            alignment: 1024,
            name: "example".to_string(),
            ..Default::default()
        };

        let mut buf = vec![0u8; 1024];

        ec.encode(&mut buf).unwrap();
        assert_eq!(Ec::decode(&buf), Some(ec));

        vid.encode(&mut buf).unwrap();
        assert_eq!(Vid::decode(&buf), Some(vid));

        let vec = vtbl.clone().into_bytes();
        assert_eq!(VolTableRecord::decode(&vec), Some(vtbl));
    }

    #[test]
    fn test_corrupt_rejected() {
        let mut buf = vec![0u8; EC_HDR_SIZE];
        Ec::default().ec(7).encode(&mut buf).unwrap();
        buf[9] ^= 0x40;
        assert_eq!(Ec::decode(&buf), None);

        let mut buf = vec![0u8; VID_HDR_SIZE];
        Vid::default().sqnum(3).encode(&mut buf).unwrap();
        buf[0] = b'X';
        assert_eq!(Vid::decode(&buf), None);
    }

    #[test]
    fn test_vidbuf_roundtrip() {
        let hdrs: Vec<Vid> = (0..3)
            .map(|i| {
                Vid {
                    vol_id: 4,
                    vol_mode: VolMode::MlcSafe,
                    ..Default::default()
                }
                .lnum(i)
                .sqnum(100 + i as u64)
            })
            .collect();
        let buf = VidBuf::consolidated(hdrs.clone());

        let mut page = vec![0xFFu8; 512];
        buf.encode(&mut page).unwrap();

        let parsed = VidBuf::decode(&page).unwrap();
        assert_eq!(parsed.nhdrs(), 3);
        assert_eq!(parsed.hdrs(), &hdrs[..]);

        // A blank page is not a VID buffer
        assert_eq!(VidBuf::decode(&vec![0xFFu8; 512]), None);
    }
}
