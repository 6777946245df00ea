//! The fastmap checkpoint: an on-flash snapshot of the wear-levelling
//! state, the allocation pools, and every volume's EBA table, so that
//! attach can skip the full scan.
//!
//! Layout: one superblock PEB (always within the first [FM_MAX_BLOCKS]
//! eraseblocks, so the attach probe finds it) naming up to
//! `FM_MAX_BLOCKS - 1` data PEBs that carry the CRC-guarded payload.
//! Between two checkpoints every allocation is served from the two pools
//! recorded in the payload; attach therefore re-scans only the pool PEBs,
//! whose contents are the only thing that may have changed since the
//! checkpoint was written.
//!
//! Fastmap failures never propagate: a broken checkpoint downgrades the
//! next attach to a full scan, and a failed checkpoint write downgrades
//! the running instance to scan-style attach by disabling itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use deku::prelude::*;
use log::{debug, info, warn};

use crate::attach::{self, AttachInfo, LebSeed, PebContent};
use crate::headers::{Vid, VidBuf, VolMode, VolType, UBI_CRC};
use crate::io::{HdrRead, Io};
use crate::volumes::LAYOUT_VOLUME_ID;
use crate::work::{Work, WorkItem, ALL};
use crate::{wl, Error, UbiConfig, UbiDevice};

/// The superblock plus its data PEBs never exceed this many eraseblocks,
/// and the superblock always sits below this pnum
pub const FM_MAX_BLOCKS: u32 = 32;

pub const FM_SB_VOLUME_ID: u32 = LAYOUT_VOLUME_ID + 1;
pub const FM_DATA_VOLUME_ID: u32 = LAYOUT_VOLUME_ID + 2;

const FM_SB_MAGIC: u32 = 0x7B11_D69F;
const FM_VERSION: u8 = 1;

/// The checkpoint superblock record, bit-exact as stored on flash
#[derive(Debug, PartialEq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct FmSb {
    magic: u32,
    version: u8,
    padding: [u8; 3],
    image_seq: u32,
    max_sqnum: u64,
    max_ec: u64,
    mean_ec: u64,
    payload_len: u32,
    payload_crc: u32,
    data_count: u32,
    #[deku(count = "data_count")]
    data_pnums: Vec<u32>,
}

#[derive(Debug, PartialEq, Copy, Clone, DekuRead, DekuWrite)]
#[deku(ctx = "endian: deku::ctx::Endian", endian = "endian")]
struct FmPebEc {
    pnum: u32,
    ec: u64,
}

#[derive(Debug, PartialEq, Copy, Clone, DekuRead, DekuWrite)]
#[deku(ctx = "endian: deku::ctx::Endian", endian = "endian")]
struct FmLeb {
    lnum: u32,
    pnum: u32,
    lpos: u8,
}

#[derive(Debug, PartialEq, Clone, DekuRead, DekuWrite)]
#[deku(ctx = "endian: deku::ctx::Endian", endian = "endian")]
struct FmVolume {
    vol_id: u32,
    used_ebs: u32,
    leb_count: u32,
    #[deku(count = "leb_count")]
    lebs: Vec<FmLeb>,
}

/// The checkpoint payload, spanning the data PEBs
#[derive(Debug, PartialEq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct FmPayload {
    free_count: u32,
    #[deku(count = "free_count")]
    free: Vec<FmPebEc>,
    used_count: u32,
    #[deku(count = "used_count")]
    used: Vec<FmPebEc>,
    scrub_count: u32,
    #[deku(count = "scrub_count")]
    scrub: Vec<FmPebEc>,
    erroneous_count: u32,
    #[deku(count = "erroneous_count")]
    erroneous: Vec<FmPebEc>,
    erasing_count: u32,
    #[deku(count = "erasing_count")]
    erasing: Vec<FmPebEc>,
    user_pool_count: u32,
    #[deku(count = "user_pool_count")]
    user_pool: Vec<FmPebEc>,
    wl_pool_count: u32,
    #[deku(count = "wl_pool_count")]
    wl_pool: Vec<FmPebEc>,
    vol_count: u32,
    #[deku(count = "vol_count")]
    volumes: Vec<FmVolume>,
}

#[derive(Default)]
struct FmCurrent {
    /// PEBs of the live checkpoint, superblock first
    pebs: Vec<u32>,
}

/// Per-instance fastmap state
pub struct Fastmap {
    state: Mutex<FmCurrent>,
    enabled: AtomicBool,

    /// A checkpoint work item sits in the queue
    scheduled: AtomicBool,
}

impl Fastmap {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            state: Mutex::new(FmCurrent::default()),
            enabled: AtomicBool::new(enabled),
            scheduled: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn disable(&self) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            warn!("fastmap disabled for this attach; next attach falls back to a full scan");
        }
    }

    /// The worker claimed the queued checkpoint item
    pub(crate) fn take_scheduled(&self) {
        self.scheduled.store(false, Ordering::Release);
    }

    /// Adopt the checkpoint PEBs found at attach
    pub(crate) fn adopt(&self, pebs: Vec<u32>) {
        self.state.lock().unwrap().pebs = pebs;
    }
}

/// Queue one checkpoint write on the background worker. Callers that need
/// the pools refilled wait for the queue afterwards; the item is shared by
/// every waiter that piles up in the meantime.
pub(crate) fn schedule(dev: &UbiDevice) {
    if !dev.fm.is_enabled() {
        return;
    }
    if !dev.fm.scheduled.swap(true, Ordering::AcqRel) {
        dev.work.push(WorkItem {
            kind: Work::FastmapWrite,
            vol_id: ALL,
            lnum: ALL,
        });
    }
}

fn snapshot_payload(dev: &UbiDevice) -> FmPayload {
    let snap = dev.wl.snapshot();
    let to_recs = |v: Vec<(u32, u64)>| -> Vec<FmPebEc> {
        v.into_iter().map(|(pnum, ec)| FmPebEc { pnum, ec }).collect()
    };

    let ec_of = |pnum: u32| dev.wl.ec_of(pnum).unwrap_or(0);
    let pool_recs = |pnums: Vec<u32>| -> Vec<FmPebEc> {
        pnums
            .into_iter()
            .map(|pnum| FmPebEc {
                pnum,
                ec: ec_of(pnum),
            })
            .collect()
    };

    let mut vol_ids = dev.volumes.ids();
    vol_ids.push(LAYOUT_VOLUME_ID);
    let volumes = vol_ids
        .into_iter()
        .filter_map(|vol_id| dev.volumes.get(vol_id))
        .map(|vol| {
            let tbl = vol.eba_tbl.read().unwrap();
            let lebs: Vec<FmLeb> = tbl
                .iter()
                .enumerate()
                .filter_map(|(lnum, desc)| {
                    desc.map(|d| FmLeb {
                        lnum: lnum as u32,
                        pnum: d.pnum,
                        lpos: d.lpos,
                    })
                })
                .collect();
            FmVolume {
                vol_id: vol.vol_id,
                used_ebs: vol.used_ebs.load(Ordering::Relaxed),
                leb_count: lebs.len() as u32,
                lebs,
            }
        })
        .collect::<Vec<_>>();

    FmPayload {
        free_count: snap.free.len() as u32,
        free: to_recs(snap.free),
        used_count: snap.used.len() as u32,
        used: to_recs(snap.used),
        scrub_count: snap.scrub.len() as u32,
        scrub: to_recs(snap.scrub),
        erroneous_count: snap.erroneous.len() as u32,
        erroneous: to_recs(snap.erroneous),
        erasing_count: snap.erasing.len() as u32,
        erasing: to_recs(snap.erasing),
        user_pool_count: snap.user_pool.len() as u32,
        user_pool: pool_recs(snap.user_pool),
        wl_pool_count: snap.wl_pool.len() as u32,
        wl_pool: pool_recs(snap.wl_pool),
        vol_count: volumes.len() as u32,
        volumes,
    }
}

/// Write a fresh checkpoint and refill the allocation pools.
///
/// Called when a pool runs dry (on the allocating thread) and from the
/// background queue. Always leaves the pools refilled, even when the
/// checkpoint itself cannot be written — allocation must not starve
/// because a checkpoint failed.
pub(crate) fn update(dev: &UbiDevice) -> Result<(), Error> {
    if dev.io.is_ro() {
        return Err(Error::ReadOnly);
    }

    let mut current = dev.fm.state.lock().unwrap();

    // Freeze the EBA for the whole checkpoint: the snapshot, the claims
    // and the writes must see one consistent map
    let _frozen = dev.eba.freeze.write().unwrap();

    // Refill first: the checkpoint must record the pools the next attach
    // has to re-scan, which are exactly the ones allocations draw from
    // until the checkpoint after this one.
    wl::refill_pools(dev);

    if !dev.fm.is_enabled() {
        return Ok(());
    }

    let mut payload = snapshot_payload(dev);

    // The checkpoint being superseded is erased right after this one
    // commits; record its PEBs as erase-pending so an attach from the new
    // checkpoint still accounts for them
    for &pnum in &current.pebs {
        payload.erasing.push(FmPebEc {
            pnum,
            ec: dev.wl.ec_of(pnum).unwrap_or(0),
        });
        payload.erasing_count += 1;
    }

    let payload_bytes = payload.to_bytes().map_err(Error::Codec)?;
    let payload_crc = UBI_CRC.checksum(&payload_bytes);

    let geo = *dev.io.geometry();
    let chunk_size = geo.slc_leb_size;
    let chunks: Vec<&[u8]> = payload_bytes.chunks(chunk_size).collect();

    if 1 + chunks.len() > FM_MAX_BLOCKS as usize {
        warn!("fastmap payload of {} bytes does not fit", payload_bytes.len());
        dev.fm.disable();
        return Ok(());
    }

    let mut claimed: Vec<u32> = Vec::with_capacity(1 + chunks.len());
    let result = (|| -> Result<(), Error> {
        let (sb_pnum, _) = wl::claim_fastmap_peb(dev, true)?;
        claimed.push(sb_pnum);
        let mut data_pnums = Vec::with_capacity(chunks.len());
        for _ in 0..chunks.len() {
            let (pnum, _) = wl::claim_fastmap_peb(dev, false)?;
            claimed.push(pnum);
            data_pnums.push(pnum);
        }

        // Data PEBs first, superblock last: the superblock commits the
        // checkpoint
        for (i, chunk) in chunks.iter().enumerate() {
            let vid = Vid {
                vol_id: FM_DATA_VOLUME_ID,
                lnum: i as u32,
                vol_type: VolType::Dynamic,
                vol_mode: if geo.bits_per_cell > 1 {
                    VolMode::Slc
                } else {
                    VolMode::Normal
                },
                compat: crate::volumes::LAYOUT_VOLUME_COMPAT,
                sqnum: dev.eba.next_sqnum(),
                ..Default::default()
            };
            dev.io.write_vid_hdrs(data_pnums[i], &VidBuf::single(vid))?;
            let mut padded = chunk.to_vec();
            padded.resize(geo.page_align(padded.len()), 0xFF);
            dev.io.write(
                data_pnums[i],
                geo.leb_start,
                &padded,
                crate::io::IoMode::Slc,
            )?;
        }

        let sb = FmSb {
            magic: FM_SB_MAGIC,
            version: FM_VERSION,
            padding: Default::default(),
            image_seq: dev.image_seq,
            max_sqnum: dev.eba.next_sqnum(),
            max_ec: dev.wl.ec_bounds().1,
            mean_ec: 0,
            payload_len: payload_bytes.len() as u32,
            payload_crc,
            data_count: data_pnums.len() as u32,
            data_pnums: data_pnums.clone(),
        };
        let vid = Vid {
            vol_id: FM_SB_VOLUME_ID,
            lnum: 0,
            vol_type: VolType::Dynamic,
            vol_mode: if geo.bits_per_cell > 1 {
                VolMode::Slc
            } else {
                VolMode::Normal
            },
            compat: crate::volumes::LAYOUT_VOLUME_COMPAT,
            sqnum: sb.max_sqnum,
            ..Default::default()
        };
        dev.io.write_vid_hdrs(sb_pnum, &VidBuf::single(vid))?;
        let mut sb_bytes = sb.to_bytes().map_err(Error::Codec)?;
        sb_bytes.resize(geo.page_align(sb_bytes.len()), 0xFF);
        dev.io
            .write(sb_pnum, geo.leb_start, &sb_bytes, crate::io::IoMode::Slc)?;

        // Verify before the old checkpoint goes away
        let mut readback = Vec::with_capacity(payload_bytes.len());
        for (i, chunk) in chunks.iter().enumerate() {
            let mut buf = vec![0u8; chunk.len()];
            dev.io.read(data_pnums[i], geo.leb_start, &mut buf)?;
            readback.extend_from_slice(&buf);
        }
        if UBI_CRC.checksum(&readback) != payload_crc {
            return Err(Error::Invalid("fastmap readback mismatch".into()));
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            let old = std::mem::replace(&mut current.pebs, claimed);
            for pnum in old {
                wl::put_peb(dev, pnum, false, ALL, ALL);
            }
            debug!("fastmap checkpoint written ({} PEBs)", current.pebs.len());
            Ok(())
        }
        Err(e) => {
            warn!("fastmap write failed: {e}");
            for pnum in claimed {
                wl::put_peb(dev, pnum, false, ALL, ALL);
            }
            dev.fm.disable();
            // Pools are full; the instance just runs checkpoint-less now
            Ok(())
        }
    }
}

/// Read the EC and single-VID header of a checkpoint candidate PEB
fn peb_headers(io: &Io, pnum: u32) -> Option<(u64, Vid)> {
    let ec = match io.read_ec_hdr(pnum).ok()? {
        HdrRead::Ok(ec) | HdrRead::Bitflips(ec) => ec.ec,
        _ => return None,
    };
    let vid = match io.read_vid_hdrs(pnum).ok()? {
        HdrRead::Ok(vidb) | HdrRead::Bitflips(vidb) => vidb.hdrs().first().copied()?,
        _ => return None,
    };
    Some((ec, vid))
}

/// Attempt to reconstruct the attach picture from the newest checkpoint.
/// Any inconsistency returns `None` and the caller falls back to the full
/// scan; this path never errors out.
pub(crate) fn try_attach(io: &Io, config: &UbiConfig) -> Option<(AttachInfo, Vec<u32>)> {
    let geo = *io.geometry();

    // Probe the low PEBs for the newest superblock
    let mut sb_pick: Option<(u32, u64, u64)> = None; // pnum, ec, sqnum
    for pnum in 0..FM_MAX_BLOCKS.min(geo.peb_count) {
        if io.is_bad(pnum).ok()? {
            continue;
        }
        if let Some((ec, vid)) = peb_headers(io, pnum) {
            if vid.vol_id == FM_SB_VOLUME_ID
                && sb_pick.map(|(_, _, sq)| vid.sqnum > sq).unwrap_or(true)
            {
                sb_pick = Some((pnum, ec, vid.sqnum));
            }
        }
    }
    let (sb_pnum, sb_ec, _) = sb_pick?;

    let mut sb_buf = vec![0u8; geo.min_io_size];
    io.read(sb_pnum, geo.leb_start, &mut sb_buf).ok()?;
    let (_, sb) = FmSb::from_bytes((&sb_buf, 0)).ok()?;
    if sb.magic != FM_SB_MAGIC || sb.version != FM_VERSION {
        warn!("fastmap superblock on PEB {sb_pnum} fails validation");
        return None;
    }

    // Pull the payload out of the data PEBs
    let mut payload_bytes = Vec::with_capacity(sb.payload_len as usize);
    let mut fm_pebs = vec![sb_pnum];
    let mut fm_ecs = HashMap::from([(sb_pnum, sb_ec)]);
    for (i, &pnum) in sb.data_pnums.iter().enumerate() {
        let (ec, vid) = peb_headers(io, pnum)?;
        if vid.vol_id != FM_DATA_VOLUME_ID || vid.lnum != i as u32 {
            warn!("fastmap data PEB {pnum} does not match the superblock");
            return None;
        }
        fm_pebs.push(pnum);
        fm_ecs.insert(pnum, ec);

        let want = (sb.payload_len as usize - payload_bytes.len()).min(geo.slc_leb_size);
        let mut chunk = vec![0u8; want];
        io.read(pnum, geo.leb_start, &mut chunk).ok()?;
        payload_bytes.extend_from_slice(&chunk);
    }
    if UBI_CRC.checksum(&payload_bytes) != sb.payload_crc {
        warn!("fastmap payload CRC mismatch");
        return None;
    }
    let (_, payload) = FmPayload::from_bytes((&payload_bytes, 0)).ok()?;

    // Rebuild the attach picture from the snapshot
    let mut info = AttachInfo {
        image_seq: sb.image_seq,
        max_sqnum: sb.max_sqnum,
        max_ec: sb.max_ec,
        ..Default::default()
    };

    for rec in payload
        .free
        .iter()
        .chain(payload.used.iter())
        .chain(payload.scrub.iter())
        .chain(payload.erroneous.iter())
        .chain(payload.erasing.iter())
    {
        info.ecs.insert(rec.pnum, rec.ec);
        info.max_ec = info.max_ec.max(rec.ec);
    }
    info.free.extend(payload.free.iter().map(|r| r.pnum));
    info.scrub.extend(payload.scrub.iter().map(|r| r.pnum));
    info.erroneous.extend(payload.erroneous.iter().map(|r| r.pnum));
    info.torn.extend(payload.erasing.iter().map(|r| r.pnum));
    for rec in &payload.used {
        info.vid_pebs.insert(rec.pnum);
    }
    for rec in payload.scrub.iter().chain(payload.erroneous.iter()) {
        info.vid_pebs.insert(rec.pnum);
    }

    for vol in &payload.volumes {
        for leb in &vol.lebs {
            info.lebs.insert(
                (vol.vol_id, leb.lnum),
                LebSeed {
                    pnum: leb.pnum,
                    lpos: leb.lpos,
                    // Sequence number zero marks a table entry; any real
                    // header found in a pool PEB outranks it
                    vid: Vid {
                        vol_id: vol.vol_id,
                        lnum: leb.lnum,
                        used_ebs: vol.used_ebs,
                        ..Default::default()
                    },
                },
            );
        }
    }

    // The pools are the only PEBs whose contents may postdate the
    // checkpoint: scan just those and let their headers override the
    // tables.
    for rec in payload.user_pool.iter().chain(payload.wl_pool.iter()) {
        let pnum = rec.pnum;
        match attach::scan_peb(io, pnum).ok()? {
            PebContent::Bad => info.bad.push(pnum),
            PebContent::Empty => info.empty.push(pnum),
            PebContent::Corrupt => info.corrupt.push(pnum),
            PebContent::Torn { ec } => {
                info.ecs.insert(pnum, ec.ec);
                info.torn.push(pnum);
            }
            PebContent::EcOnly { ec, .. } => {
                info.ecs.insert(pnum, ec.ec);
                info.free.push(pnum);
            }
            PebContent::Data {
                ec,
                vidb,
                bitflips,
            } => {
                info.ecs.insert(pnum, ec.ec);
                info.vid_pebs.insert(pnum);
                if bitflips {
                    info.scrub.insert(pnum);
                }
                for (lpos, vid) in vidb.hdrs().iter().enumerate() {
                    info.max_sqnum = info.max_sqnum.max(vid.sqnum);
                    let seed = LebSeed {
                        pnum,
                        lpos: lpos as u8,
                        vid: *vid,
                    };
                    let key = (vid.vol_id, vid.lnum);
                    let winner = match info.lebs.remove(&key) {
                        // Table entries carry sequence number zero; any
                        // real header written after the checkpoint beats
                        // them, and two post-checkpoint claims arbitrate
                        // like a scan would
                        Some(incumbent) if incumbent.vid.sqnum != 0 => {
                            attach::resolve_claims(io, incumbent, seed)
                        }
                        _ => seed,
                    };
                    info.lebs.insert(key, winner);
                }
            }
        }
    }

    info.ecs.extend(fm_ecs.iter().map(|(&p, &e)| (p, e)));
    let (sum, count) = info
        .ecs
        .values()
        .fold((0u64, 0u64), |(s, c), &ec| (s + ec, c + 1));
    info.mean_ec = (sum + count / 2).checked_div(count).unwrap_or(1);

    for pnum in 0..geo.peb_count {
        if io.is_bad(pnum).unwrap_or(false) {
            info.bad.push(pnum);
        }
    }
    info.bad.sort_unstable();
    info.bad.dedup();

    if config.self_check_fastmap && !self_check_eba(io, &info) {
        warn!("fastmap self-check failed, falling back to a full scan");
        return None;
    }

    info!(
        "attached via fastmap on PEB {sb_pnum}: {} LEBs, {} pool PEBs re-scanned",
        info.lebs.len(),
        payload.user_pool.len() + payload.wl_pool.len()
    );
    Some((info, fm_pebs))
}

/// Compare a sample of the checkpoint's EBA view against the medium. Any
/// disagreement is treated as checkpoint corruption.
fn self_check_eba(io: &Io, info: &AttachInfo) -> bool {
    let mut keys: Vec<&(u32, u32)> = info.lebs.keys().collect();
    keys.sort_unstable();

    for key in keys.iter().step_by(8) {
        let seed = &info.lebs[*key];
        let &(vol_id, lnum) = *key;
        match attach::scan_peb(io, seed.pnum) {
            Ok(PebContent::Data { vidb, .. }) => {
                let claims = vidb
                    .get(seed.lpos as usize)
                    .map(|vid| (vid.vol_id, vid.lnum) == (vol_id, lnum))
                    .unwrap_or(false);
                if !claims {
                    warn!(
                        "fastmap says LEB {vol_id}:{lnum} is on PEB {}, the medium disagrees",
                        seed.pnum
                    );
                    return false;
                }
            }
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_payload_roundtrip() {
        let payload = FmPayload {
            free_count: 2,
            free: vec![
                FmPebEc { pnum: 3, ec: 10 },
                FmPebEc { pnum: 9, ec: 11 },
            ],
            used_count: 1,
            used: vec![FmPebEc { pnum: 4, ec: 2 }],
            scrub_count: 0,
            scrub: vec![],
            erroneous_count: 0,
            erroneous: vec![],
            erasing_count: 1,
            erasing: vec![FmPebEc { pnum: 7, ec: 5 }],
            user_pool_count: 1,
            user_pool: vec![FmPebEc { pnum: 12, ec: 1 }],
            wl_pool_count: 0,
            wl_pool: vec![],
            vol_count: 1,
            volumes: vec![FmVolume {
                vol_id: 0,
                used_ebs: 0,
                leb_count: 2,
                lebs: vec![
                    FmLeb {
                        lnum: 0,
                        pnum: 4,
                        lpos: 0,
                    },
                    FmLeb {
                        lnum: 1,
                        pnum: 5,
                        lpos: 1,
                    },
                ],
            }],
        };

        let bytes = payload.to_bytes().unwrap();
        let (_, parsed) = FmPayload::from_bytes((&bytes, 0)).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_sb_roundtrip() {
        let sb = FmSb {
            magic: FM_SB_MAGIC,
            version: FM_VERSION,
            padding: Default::default(),
            image_seq: 0x1234,
            max_sqnum: 99,
            max_ec: 12,
            mean_ec: 6,
            payload_len: 4096,
            payload_crc: 0xABCD_EF01,
            data_count: 2,
            data_pnums: vec![5, 9],
        };
        let bytes = sb.to_bytes().unwrap();
        let (_, parsed) = FmSb::from_bytes((&bytes, 0)).unwrap();
        assert_eq!(parsed, sb);
    }
}
