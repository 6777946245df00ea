//! The consolidation worker.
//!
//! On MLC/TLC media operated in SLC mode, every PEB carries a single LEB at
//! half (or a third of) its native capacity. Consolidation packs
//! `bits_per_cell` live SLC-written LEBs of one MLC-safe volume into a
//! single full-density PEB: data slots first, then the combined VID buffer
//! into the tail page.
//!
//! The pack commits by erasing the source PEBs. Until every source is gone,
//! attach arbitration prefers the sources over the copy-flagged pack, so a
//! power cut anywhere in the protocol leaves the previous mapping intact
//! (§ the attach module's duplicate resolution).

use std::sync::atomic::Ordering;

use log::{debug, info, warn};

use crate::eba::LebDesc;
use crate::flash::ReadStatus;
use crate::headers::{Vid, VidBuf, VolMode, VolType, UBI_CRC};
use crate::io::IoMode;
use crate::volumes::Volume;
use crate::work::ALL;
use crate::{wl, UbiDevice};

/// Volumes with fewer live SLC LEBs than this are not worth packing
pub const MIN_SLC_LEBS: usize = 16;

/// Ratio of the rearm policy: packing starts once the SLC backlog exceeds
/// `MIN_SLC_MLC_RATIO`-times fewer LEBs than [MIN_SLC_LEBS] allows
pub const MIN_SLC_MLC_RATIO: usize = 5;

/// Default backlog that re-arms the consolidation worker
pub const CONSO_THRESHOLD: usize = MIN_SLC_LEBS * MIN_SLC_MLC_RATIO;

/// One source LEB selected for packing
struct Source {
    lnum: u32,
    desc: LebDesc,
    data: Vec<u8>,
    vid: Vid,
}

/// The worker body: pick sources, copy them into a reserved full-density
/// PEB, write the VID buffer last, then re-point the map and release the
/// sources.
pub(crate) fn do_consolidate(dev: &UbiDevice, vol_id: u32) {
    let Some(vol) = dev.volumes.get(vol_id) else {
        return;
    };
    vol.conso_take();

    let geo = *dev.io.geometry();
    let r = geo.lebs_per_conso_peb();
    if vol.vol_mode != VolMode::MlcSafe || r < 2 {
        return;
    }

    match pack_once(dev, &vol, r) {
        Ok(true) => {
            // More backlog may remain; let the rearm policy decide
            vol.conso_rearm(dev);
        }
        Ok(false) => {}
        Err(e) => warn!("consolidation of volume {vol_id} failed: {e:?}"),
    }
}

#[derive(Debug)]
enum PackError {
    Cancelled,
    Io(crate::Error),
}

impl From<crate::Error> for PackError {
    fn from(e: crate::Error) -> Self {
        PackError::Io(e)
    }
}

impl std::fmt::Display for PackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackError::Cancelled => write!(f, "cancelled"),
            PackError::Io(e) => write!(f, "{e}"),
        }
    }
}

fn check_cancel(vol: &Volume) -> Result<(), PackError> {
    if vol.conso_cancel.load(Ordering::Acquire) {
        debug!("consolidation of volume {} cancelled", vol.vol_id);
        return Err(PackError::Cancelled);
    }
    Ok(())
}

/// Pack one PEB's worth of LEBs. Returns Ok(false) when there was nothing
/// to pack (not an error: the backlog may simply be short).
fn pack_once(dev: &UbiDevice, vol: &Volume, r: usize) -> Result<bool, PackError> {
    check_cancel(vol)?;

    // Lowest-numbered live SLC singles first
    let candidates: Vec<(u32, LebDesc)> = {
        let tbl = vol.eba_tbl.read().unwrap();
        let mut refs = std::collections::HashMap::new();
        for desc in tbl.iter().flatten() {
            *refs.entry(desc.pnum).or_insert(0usize) += 1;
        }
        tbl.iter()
            .enumerate()
            .filter_map(|(lnum, desc)| desc.map(|d| (lnum as u32, d)))
            .filter(|(_, d)| refs[&d.pnum] == 1 && d.lpos == 0)
            .take(r)
            .collect()
    };
    if candidates.len() < r {
        return Ok(false);
    }

    // Reserve the target and the sequence-number run before touching data
    let (tgt_pnum, _tgt_ec) = wl::get_peb_for_move(dev).map_err(PackError::Io)?;
    let sqnums: Vec<u64> = dev.eba.next_sqnums(r as u64).collect();

    let result = pack_into(dev, vol, &candidates, tgt_pnum, &sqnums);
    match result {
        Ok(()) => Ok(true),
        Err(e) => {
            // Nothing was re-pointed yet: discarding the half-written
            // target undoes the whole pack
            wl::put_peb(dev, tgt_pnum, false, vol.vol_id, ALL);
            match e {
                PackError::Cancelled => Ok(false),
                other => Err(other),
            }
        }
    }
}

fn pack_into(
    dev: &UbiDevice,
    vol: &Volume,
    candidates: &[(u32, LebDesc)],
    tgt_pnum: u32,
    sqnums: &[u64],
) -> Result<(), PackError> {
    let geo = *dev.io.geometry();

    // Exclusive locks in ascending LEB order, held across the whole pack.
    // A contended LEB means a writer is active there right now; the pack
    // gives way and the rearm policy tries again later.
    let mut _guards = Vec::with_capacity(candidates.len());
    for &(lnum, _) in candidates {
        match dev.eba.try_write_guard(vol.vol_id, lnum) {
            Some(guard) => _guards.push(guard),
            None => return Err(PackError::Cancelled),
        }
    }

    // The mappings may have moved while the work sat in the queue
    {
        let tbl = vol.eba_tbl.read().unwrap();
        for &(lnum, desc) in candidates {
            if tbl.get(lnum as usize).copied().flatten() != Some(desc) {
                return Err(PackError::Cancelled);
            }
        }
    }

    // Copy each source into its slot, carrying its identity forward
    let mut sources = Vec::with_capacity(candidates.len());
    for (i, &(lnum, desc)) in candidates.iter().enumerate() {
        check_cancel(vol)?;

        let src_vid = dev
            .io
            .read_vid_hdrs(desc.pnum)
            .map_err(PackError::Io)?
            .into_header()
            .and_then(|b| b.get(desc.lpos as usize).copied())
            .ok_or_else(|| {
                PackError::Io(crate::Error::Corrupted {
                    vol_id: vol.vol_id,
                })
            })?;

        let data_len = match src_vid.vol_type {
            VolType::Static => src_vid.data_size as usize,
            VolType::Dynamic => vol.usable_leb_size,
        };
        let mut data = vec![0u8; data_len];
        dev.io
            .read(desc.pnum, geo.conso_data_offset(desc.lpos as usize), &mut data)
            .map_err(PackError::Io)?;

        let (data_size, data_crc) = match src_vid.vol_type {
            VolType::Static => (src_vid.data_size, src_vid.data_crc),
            VolType::Dynamic => (data.len() as u32, UBI_CRC.checksum(&data)),
        };

        let vid = Vid {
            vol_mode: VolMode::MlcSafe,
            sqnum: sqnums[i],
            ..src_vid
        }
        .lnum(lnum)
        .copy_of(data_size, data_crc);

        let mut padded = data.clone();
        padded.resize(geo.page_align(padded.len()), 0xFF);
        dev.io
            .write(tgt_pnum, geo.conso_data_offset(i), &padded, IoMode::Normal)
            .map_err(PackError::Io)?;

        sources.push(Source {
            lnum,
            desc,
            data,
            vid,
        });
    }

    // Verify every slot before committing to the header write
    for (i, src) in sources.iter().enumerate() {
        let mut readback = vec![0u8; src.data.len()];
        match dev.io.read(tgt_pnum, geo.conso_data_offset(i), &mut readback) {
            Ok(ReadStatus::Clean) if readback == src.data => {}
            _ => {
                return Err(PackError::Io(crate::Error::Flash(
                    crate::flash::FlashError::Program,
                )))
            }
        }
    }

    check_cancel(vol)?;

    // The combined VID buffer lands in the tail page, after all the data
    // it describes
    let vidb = VidBuf::consolidated(sources.iter().map(|s| s.vid).collect());
    dev.io.write_vid_hdrs(tgt_pnum, &vidb).map_err(PackError::Io)?;

    // Re-point the map. From here on the pack is the truth; the source
    // erasures commit it on flash.
    {
        let _fm = dev.eba.freeze.read().unwrap();
        let mut tbl = vol.eba_tbl.write().unwrap();
        for (i, src) in sources.iter().enumerate() {
            tbl[src.lnum as usize] = Some(LebDesc {
                pnum: tgt_pnum,
                lpos: i as u8,
            });
        }
    }
    wl::make_used(dev, tgt_pnum);

    for src in &sources {
        wl::put_peb(dev, src.desc.pnum, false, vol.vol_id, src.lnum);
    }

    info!(
        "consolidated {} LEBs of volume {} into PEB {tgt_pnum}",
        sources.len(),
        vol.vol_id
    );
    Ok(())
}
