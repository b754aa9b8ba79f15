// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{check_len, NvAvailability, NvError, NvKey, NvStorage, NV_ARENA_SIZE};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc_any::CRCu16;
use log::debug;
use packed_struct::prelude::*;
use std::io::Cursor;
use std::path::{Path, PathBuf};

const IMAGE_SIGNATURE: [u8; 4] = *b"TNVI";
const IMAGE_FORMAT_VERSION: u8 = 1;

const HEADER_SIZE: usize = 10;
// tag u16 + offset u32 + len u32 per region
const TABLE_ENTRY_SIZE: usize = 10;
const TABLE_SIZE: usize = TABLE_ENTRY_SIZE * NvKey::ALL.len();
const IMAGE_SIZE: usize = HEADER_SIZE + TABLE_SIZE + NV_ARENA_SIZE;

#[derive(Debug, PackedStruct)]
#[repr(C)]
#[packed_struct(size_bytes = "10", bit_numbering = "msb0", endian = "msb")]
struct ImageHeader {
    signature: [u8; 4],
    format_version: u8,
    region_count: u8,
    length_low: u8,
    length_high: u8,
    crc16_low: u8,
    crc16_high: u8,
}

impl ImageHeader {
    fn new() -> ImageHeader {
        let len = IMAGE_SIZE as u16;
        ImageHeader {
            signature: IMAGE_SIGNATURE,
            format_version: IMAGE_FORMAT_VERSION,
            region_count: NvKey::ALL.len() as u8,
            length_low: (len & 0xFF) as u8,
            length_high: ((len >> 8) & 0xFF) as u8,
            crc16_low: 0,
            crc16_high: 0,
        }
    }

    fn length(&self) -> u16 {
        u16::from(self.length_low) | (u16::from(self.length_high) << 8)
    }

    fn crc16(&self) -> u16 {
        u16::from(self.crc16_low) | (u16::from(self.crc16_high) << 8)
    }
}

/// Serialized form of the NV arena: a small header, the region table,
/// then the raw arena bytes. The checksum covers everything except the
/// checksum field itself.
pub struct NvImage {
    arena: Vec<u8>,
}

impl NvImage {
    pub fn new() -> NvImage {
        NvImage {
            arena: vec![0xFF; NV_ARENA_SIZE],
        }
    }

    pub fn region(&self, key: NvKey) -> &[u8] {
        &self.arena[key.offset()..key.offset() + key.len()]
    }

    pub fn region_mut(&mut self, key: NvKey) -> &mut [u8] {
        &mut self.arena[key.offset()..key.offset() + key.len()]
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, NvError> {
        let mut table = Vec::with_capacity(TABLE_SIZE);
        for key in NvKey::ALL {
            table.write_u16::<LittleEndian>(key.tag())?;
            table.write_u32::<LittleEndian>(key.offset() as u32)?;
            table.write_u32::<LittleEndian>(key.len() as u32)?;
        }

        let mut header = ImageHeader::new();
        let header_bytes = header.pack()?;

        // Checksum over the header minus its own checksum field, then
        // the table and the arena
        let mut crc = CRCu16::crc16xmodem();
        crc.digest(&header_bytes[..HEADER_SIZE - 2]);
        crc.digest(&table);
        crc.digest(&self.arena);
        let digest = crc.get_crc();

        header.crc16_low = (digest & 0xFF) as u8;
        header.crc16_high = ((digest >> 8) & 0xFF) as u8;

        let mut out = Vec::with_capacity(IMAGE_SIZE);
        out.extend_from_slice(&header.pack()?);
        out.extend_from_slice(&table);
        out.extend_from_slice(&self.arena);

        Ok(out)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<NvImage, NvError> {
        if buf.len() != IMAGE_SIZE {
            return Err(NvError::BadHeader);
        }

        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&buf[..HEADER_SIZE]);
        let header = ImageHeader::unpack(&header_bytes)?;

        if header.signature != IMAGE_SIGNATURE
            || header.format_version != IMAGE_FORMAT_VERSION
            || header.region_count != NvKey::ALL.len() as u8
            || header.length() as usize != IMAGE_SIZE
        {
            return Err(NvError::BadHeader);
        }

        let mut crc = CRCu16::crc16xmodem();
        crc.digest(&buf[..HEADER_SIZE - 2]);
        crc.digest(&buf[HEADER_SIZE..]);
        let expected = crc.get_crc();

        if expected != header.crc16() {
            return Err(NvError::BadChecksum {
                expected,
                got: header.crc16(),
            });
        }

        let mut table = Cursor::new(&buf[HEADER_SIZE..HEADER_SIZE + TABLE_SIZE]);
        for key in NvKey::ALL {
            let entry_key = NvKey::from_tag(table.read_u16::<LittleEndian>()?)?;
            let offset = table.read_u32::<LittleEndian>()? as usize;
            let len = table.read_u32::<LittleEndian>()? as usize;

            // The map is fixed; an image whose table disagrees was not
            // produced for this layout
            if entry_key != key || offset != key.offset() || len != key.len() {
                return Err(NvError::BadRegionEntry { key });
            }
        }

        Ok(NvImage {
            arena: buf[HEADER_SIZE + TABLE_SIZE..].to_vec(),
        })
    }
}

impl Default for NvImage {
    fn default() -> Self {
        Self::new()
    }
}

/// File-backed NV store. Every region write rewrites the image and
/// flushes it, so a write that returned Ok has hit the disk.
pub struct FileNv {
    path: PathBuf,
    image: NvImage,
    availability: NvAvailability,
}

impl FileNv {
    pub fn create(path: &Path) -> Result<FileNv, NvError> {
        let nv = FileNv {
            path: path.to_path_buf(),
            image: NvImage::new(),
            availability: NvAvailability::Available,
        };
        nv.store()?;
        Ok(nv)
    }

    pub fn open(path: &Path) -> Result<FileNv, NvError> {
        let buf = std::fs::read(path)?;
        Ok(FileNv {
            path: path.to_path_buf(),
            image: NvImage::from_bytes(&buf)?,
            availability: NvAvailability::Available,
        })
    }

    pub fn set_availability(&mut self, availability: NvAvailability) {
        self.availability = availability;
    }

    pub fn image(&self) -> &NvImage {
        &self.image
    }

    fn store(&self) -> Result<(), NvError> {
        use std::io::Write;

        let bytes = self.image.to_bytes()?;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .create(true)
            .open(&self.path)?;
        f.write_all(&bytes)?;
        f.sync_all()?;

        Ok(())
    }
}

impl NvStorage for FileNv {
    fn availability(&self) -> NvAvailability {
        self.availability
    }

    fn read(&self, key: NvKey) -> Result<Vec<u8>, NvError> {
        Ok(self.image.region(key).to_vec())
    }

    fn write(&mut self, key: NvKey, data: &[u8]) -> Result<(), NvError> {
        match self.availability {
            NvAvailability::Available => (),
            NvAvailability::Unavailable => return Err(NvError::Unavailable),
            NvAvailability::RateLimited => return Err(NvError::RateLimited),
        }

        check_len(key, data)?;

        self.image.region_mut(key).copy_from_slice(data);
        self.store()?;
        debug!("wrote {:?} ({} bytes)", key, data.len());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_round_trip() {
        let mut image = NvImage::new();
        image.region_mut(NvKey::OrderlyData)[0] = 0x42;
        image.region_mut(NvKey::OrderlyState).copy_from_slice(&[1, 0, 0xFE, 0xFF]);

        let bytes = image.to_bytes().unwrap();
        assert_eq!(bytes.len(), IMAGE_SIZE);

        let back = NvImage::from_bytes(&bytes).unwrap();
        assert_eq!(back.region(NvKey::OrderlyData)[0], 0x42);
        assert_eq!(back.region(NvKey::OrderlyState), &[1, 0, 0xFE, 0xFF]);
    }

    #[test]
    fn checksum_catches_corruption() {
        let image = NvImage::new();
        let mut bytes = image.to_bytes().unwrap();
        // flip one arena byte
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            NvImage::from_bytes(&bytes),
            Err(NvError::BadChecksum { .. })
        ));
    }

    #[test]
    fn truncated_image_is_rejected() {
        let image = NvImage::new();
        let bytes = image.to_bytes().unwrap();
        assert!(matches!(
            NvImage::from_bytes(&bytes[..bytes.len() - 1]),
            Err(NvError::BadHeader)
        ));
    }

    #[test]
    fn file_store_round_trip() {
        let mut path = std::env::temp_dir();
        path.push(format!("tpm-nv-image-{}.bin", std::process::id()));

        let mut nv = FileNv::create(&path).unwrap();
        let data = vec![0x5A; NvKey::StateClear.len()];
        nv.write(NvKey::StateClear, &data).unwrap();

        let back = FileNv::open(&path).unwrap();
        assert_eq!(back.read(NvKey::StateClear).unwrap(), data);
        // untouched regions still read erased
        assert!(back
            .read(NvKey::OrderlyState)
            .unwrap()
            .iter()
            .all(|b| *b == 0xFF));

        std::fs::remove_file(&path).unwrap();
    }
}
