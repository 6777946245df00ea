//! The volume table: one record per volume, stored twice (LEBs 0 and 1 of
//! the internal layout volume) so that a power cut during an update leaves
//! at least one intact mirror. Mirrors are rewritten with the atomic LEB
//! change protocol, so each generation supersedes the last by sequence
//! number.

use log::{info, warn};

use crate::eba;
use crate::headers::{VolMode, VolTableRecord, VolType, VTBL_RECORD_SIZE};
use crate::volumes::{Volume, LAYOUT_VOLUME_EBS, LAYOUT_VOLUME_ID, MAX_VOLUMES};
use crate::{Error, UbiDevice};

/// The synthetic record the internal layout volume is built from. It is
/// not itself listed in the table.
pub(crate) fn layout_volume_record(bits_per_cell: u32) -> VolTableRecord {
    VolTableRecord {
        reserved_pebs: LAYOUT_VOLUME_EBS,
        alignment: 1,
        data_pad: 0,
        vol_type: VolType::Dynamic,
        // The table must survive power cuts on MLC media, so it is written
        // in SLC mode there
        vol_mode: if bits_per_cell > 1 {
            VolMode::Slc
        } else {
            VolMode::Normal
        },
        upd_marker: false,
        name: "layout volume".to_string(),
        flags: 0,
    }
}

/// Records that fit one mirror LEB
pub(crate) fn record_slots(layout: &Volume) -> usize {
    (layout.usable_leb_size / VTBL_RECORD_SIZE).min(MAX_VOLUMES)
}

fn decode_mirror(buf: &[u8], slots: usize) -> Option<Vec<Option<VolTableRecord>>> {
    let mut records = Vec::with_capacity(slots);
    for chunk in buf.chunks_exact(VTBL_RECORD_SIZE).take(slots) {
        let rec = VolTableRecord::decode(chunk)?;
        if rec.reserved_pebs == 0 && rec.name.is_empty() {
            records.push(None);
        } else {
            records.push(Some(rec));
        }
    }
    Some(records)
}

fn encode_table(records: &[Option<VolTableRecord>]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(records.len() * VTBL_RECORD_SIZE);
    for rec in records {
        match rec {
            Some(rec) => buf.extend(rec.clone().into_bytes()),
            None => buf.extend(VolTableRecord::none_into_bytes()),
        }
    }
    buf
}

/// Read the volume table through the layout volume's mirrors. Either valid
/// mirror serves; both missing on a device that carries data is fatal.
pub(crate) fn read_table(
    dev: &UbiDevice,
    layout: &Volume,
) -> Result<Option<Vec<Option<VolTableRecord>>>, Error> {
    let slots = record_slots(layout);
    let mut buf = vec![0u8; slots * VTBL_RECORD_SIZE];

    for lnum in 0..LAYOUT_VOLUME_EBS {
        if !eba::is_mapped(layout, lnum) {
            continue;
        }
        match eba::read_leb(dev, layout, lnum, &mut buf, 0, false) {
            Ok(()) => {
                if let Some(records) = decode_mirror(&buf, slots) {
                    return Ok(Some(records));
                }
                warn!("volume table mirror {lnum} does not parse");
            }
            Err(e) => warn!("cannot read volume table mirror {lnum}: {e}"),
        }
    }

    if (0..LAYOUT_VOLUME_EBS).any(|lnum| eba::is_mapped(layout, lnum)) {
        return Err(Error::Invalid("no usable volume table mirror".into()));
    }
    Ok(None)
}

/// Write both mirrors of the table. Mirror 0 first; a power cut between
/// the two leaves mirror 1 one generation behind, which attach accepts.
pub(crate) fn write_table(
    dev: &UbiDevice,
    layout: &Volume,
    records: &[Option<VolTableRecord>],
) -> Result<(), Error> {
    let buf = encode_table(records);
    for lnum in 0..LAYOUT_VOLUME_EBS {
        eba::atomic_leb_change(dev, layout, lnum, &buf)?;
    }
    Ok(())
}

/// Create the empty table on virgin media
pub(crate) fn create_empty(dev: &UbiDevice, layout: &Volume) -> Result<Vec<Option<VolTableRecord>>, Error> {
    info!("empty device, creating a blank volume table");
    let records = vec![None; record_slots(layout)];
    write_table(dev, layout, &records)?;
    Ok(records)
}

/// Update one record slot and persist both mirrors
pub(crate) fn write_record(
    dev: &UbiDevice,
    vol_id: u32,
    rec: Option<VolTableRecord>,
) -> Result<(), Error> {
    if vol_id == LAYOUT_VOLUME_ID {
        return Ok(()); // the layout volume describes itself
    }

    let mut table = dev.vtbl.lock().unwrap();
    let slot = table
        .get_mut(vol_id as usize)
        .ok_or_else(|| Error::Invalid(format!("volume ID {vol_id} beyond the table")))?;
    let previous = std::mem::replace(slot, rec);

    let layout = dev.layout.clone();
    match write_table(dev, &layout, &table) {
        Ok(()) => Ok(()),
        Err(e) => {
            // Keep the in-memory table honest about what flash says
            table[vol_id as usize] = previous;
            Err(e)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mirror_codec_roundtrip() {
        let mut records = vec![None; 4];
        records[1] = Some(VolTableRecord {
            reserved_pebs: 7,
            alignment: 1,
            vol_type: VolType::Dynamic,
            name: "logs".into(),
            ..Default::default()
        });
        records[3] = Some(VolTableRecord {
            reserved_pebs: 2,
            alignment: 1,
            vol_type: VolType::Static,
            vol_mode: VolMode::MlcSafe,
            name: "firmware".into(),
            ..Default::default()
        });

        let buf = encode_table(&records);
        assert_eq!(buf.len(), 4 * VTBL_RECORD_SIZE);
        assert_eq!(decode_mirror(&buf, 4), Some(records));
    }

    #[test]
    fn test_corrupt_mirror_rejected() {
        let records = vec![None; 2];
        let mut buf = encode_table(&records);
        buf[10] ^= 1;
        assert_eq!(decode_mirror(&buf, 2), None);
    }
}
