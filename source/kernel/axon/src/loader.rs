// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! NOFF executable images.
//!
//! A NOFF binary is a 40-byte little-endian header followed by raw segment
//! bytes: `magic`, then `(vaddr, file_offset, size)` for the code segment,
//! the initialized-data segment and the uninitialized-data segment. Only
//! segment geometry and block reads are exposed; everything else about the
//! program (instruction set, entry conventions) is the machine's business.

/// Magic number in the first header word.
pub const NOFF_MAGIC: u32 = 0xBADFAD;

const HEADER_LEN: usize = 40;

/// Errors reported while parsing or reading an image.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageError {
    /// File too short for the header or a declared segment.
    Truncated,
    /// First header word is not [`NOFF_MAGIC`].
    BadMagic,
    /// A block read fell outside its segment.
    SegmentOutOfRange,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Segment {
    vaddr: u32,
    file_off: u32,
    size: u32,
}

impl Segment {
    fn parse(bytes: &[u8]) -> Self {
        Self {
            vaddr: le_u32(bytes),
            file_off: le_u32(&bytes[4..]),
            size: le_u32(&bytes[8..]),
        }
    }

    /// Virtual addresses covered by this segment, as an exclusive range.
    fn span(&self) -> (u32, u32) {
        (self.vaddr, self.vaddr.saturating_add(self.size))
    }
}

/// A parsed program image. Owns the raw bytes for the lifetime of the
/// address space so evicted clean pages can be re-read at any time.
#[derive(Clone, Debug)]
pub struct UserImage {
    bytes: Vec<u8>,
    code: Segment,
    init_data: Segment,
    uninit_data: Segment,
}

impl UserImage {
    /// Parses `bytes` as a NOFF binary.
    pub fn parse(bytes: Vec<u8>) -> Result<Self, ImageError> {
        if bytes.len() < HEADER_LEN {
            return Err(ImageError::Truncated);
        }
        if le_u32(&bytes) != NOFF_MAGIC {
            return Err(ImageError::BadMagic);
        }
        let code = Segment::parse(&bytes[4..]);
        let init_data = Segment::parse(&bytes[16..]);
        let uninit_data = Segment::parse(&bytes[28..]);
        for seg in [&code, &init_data] {
            let end = seg
                .file_off
                .checked_add(seg.size)
                .ok_or(ImageError::Truncated)?;
            if end as usize > bytes.len() {
                return Err(ImageError::Truncated);
            }
        }
        Ok(Self { bytes, code, init_data, uninit_data })
    }

    /// Total bytes of address space the program needs, stack excluded.
    /// Saturates on hostile headers; the address-space page bound rejects
    /// anything that large anyway.
    pub fn size(&self) -> u32 {
        self.code
            .size
            .saturating_add(self.init_data.size)
            .saturating_add(self.uninit_data.size)
    }

    /// Address of the first instruction. Classic images link code at zero.
    pub fn entry(&self) -> u32 {
        self.code.vaddr
    }

    pub fn code_size(&self) -> u32 {
        self.code.size
    }

    pub fn code_addr(&self) -> u32 {
        self.code.vaddr
    }

    pub fn init_data_size(&self) -> u32 {
        self.init_data.size
    }

    pub fn init_data_addr(&self) -> u32 {
        self.init_data.vaddr
    }

    pub fn uninit_data_size(&self) -> u32 {
        self.uninit_data.size
    }

    /// Virtual address range of the code segment.
    pub fn code_span(&self) -> (u32, u32) {
        self.code.span()
    }

    /// Virtual address range of the initialized-data segment.
    pub fn init_data_span(&self) -> (u32, u32) {
        self.init_data.span()
    }

    /// Copies `buf.len()` bytes of the code segment starting at `seg_off`.
    pub fn read_code(&self, buf: &mut [u8], seg_off: u32) -> Result<(), ImageError> {
        Self::read_segment(&self.bytes, &self.code, buf, seg_off)
    }

    /// Copies `buf.len()` bytes of the initialized-data segment starting at
    /// `seg_off`.
    pub fn read_init_data(&self, buf: &mut [u8], seg_off: u32) -> Result<(), ImageError> {
        Self::read_segment(&self.bytes, &self.init_data, buf, seg_off)
    }

    fn read_segment(
        bytes: &[u8],
        seg: &Segment,
        buf: &mut [u8],
        seg_off: u32,
    ) -> Result<(), ImageError> {
        let len = buf.len() as u32;
        let end = seg_off.checked_add(len).ok_or(ImageError::SegmentOutOfRange)?;
        if end > seg.size {
            return Err(ImageError::SegmentOutOfRange);
        }
        let start = seg.file_off as usize + seg_off as usize;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    /// Assembles a valid image from raw segment bytes. The data segment is
    /// placed directly after the code segment, the way the toolchain lays
    /// out classic binaries. Used by tests and host tooling.
    pub fn synthesize(code: &[u8], init_data: &[u8], uninit_size: u32) -> Self {
        let mut bytes = Vec::with_capacity(HEADER_LEN + code.len() + init_data.len());
        let code_seg = Segment {
            vaddr: 0,
            file_off: HEADER_LEN as u32,
            size: code.len() as u32,
        };
        let data_seg = Segment {
            vaddr: code.len() as u32,
            file_off: HEADER_LEN as u32 + code.len() as u32,
            size: init_data.len() as u32,
        };
        let uninit_seg = Segment {
            vaddr: data_seg.vaddr + data_seg.size,
            file_off: 0,
            size: uninit_size,
        };
        bytes.extend_from_slice(&NOFF_MAGIC.to_le_bytes());
        for seg in [&code_seg, &data_seg, &uninit_seg] {
            bytes.extend_from_slice(&seg.vaddr.to_le_bytes());
            bytes.extend_from_slice(&seg.file_off.to_le_bytes());
            bytes.extend_from_slice(&seg.size.to_le_bytes());
        }
        bytes.extend_from_slice(code);
        bytes.extend_from_slice(init_data);
        Self {
            bytes,
            code: code_seg,
            init_data: data_seg,
            uninit_data: uninit_seg,
        }
    }

    /// Raw bytes of the whole image, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_input() {
        assert!(matches!(UserImage::parse(vec![0; 10]), Err(ImageError::Truncated)));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = UserImage::synthesize(b"code", b"", 0).as_bytes().to_vec();
        bytes[0] ^= 0xff;
        assert!(matches!(UserImage::parse(bytes), Err(ImageError::BadMagic)));
    }

    #[test]
    fn rejects_segment_past_eof() {
        let mut bytes = UserImage::synthesize(b"code", b"", 0).as_bytes().to_vec();
        // Inflate the declared code size past the end of the file.
        bytes[12..16].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(UserImage::parse(bytes), Err(ImageError::Truncated)));
    }

    #[test]
    fn parses_synthesized_layout() {
        let img = UserImage::synthesize(b"abcdef", b"XYZ", 32);
        let img = UserImage::parse(img.as_bytes().to_vec()).expect("parse");
        assert_eq!(img.code_size(), 6);
        assert_eq!(img.code_addr(), 0);
        assert_eq!(img.init_data_size(), 3);
        assert_eq!(img.init_data_addr(), 6);
        assert_eq!(img.uninit_data_size(), 32);
        assert_eq!(img.size(), 6 + 3 + 32);
        assert_eq!(img.entry(), 0);
    }

    #[test]
    fn block_reads_stay_inside_segments() {
        let img = UserImage::synthesize(b"abcdef", b"XYZ", 0);
        let mut buf = [0u8; 4];
        img.read_code(&mut buf, 2).expect("read");
        assert_eq!(&buf, b"cdef");
        let mut buf = [0u8; 3];
        img.read_init_data(&mut buf, 0).expect("read");
        assert_eq!(&buf, b"XYZ");
        let mut buf = [0u8; 4];
        assert_eq!(img.read_code(&mut buf, 4), Err(ImageError::SegmentOutOfRange));
    }
}
