//! Motion-JPEG AVI writer.
//!
//! Layout written:
//!
//! ```text
//! RIFF 'AVI '
//!   LIST 'hdrl'
//!     'avih'  main header
//!     LIST 'strl'
//!       'strh'  one video stream, fourcc MJPG
//!       'strf'  BITMAPINFOHEADER
//!   LIST 'movi'
//!     '00dc' <jpeg> ...
//!   'idx1'  one keyframe entry per frame
//! ```
//!
//! The header is written with zero counts on open and rewritten on finish,
//! once frame count, sizes and the real frame dimensions are known.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use super::FrameCodec;
use crate::frame::RawFrame;

const HEADER_LEN: usize = 224;
const HDRL_LIST_LEN: u32 = 192;
const STRL_LIST_LEN: u32 = 116;
const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;
const VIDEO_CHUNK_ID: &[u8; 4] = b"00dc";

/// Parameters of a new container file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContainerConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub quality: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContainerStats {
    pub frames: u64,
    pub bytes: u64,
}

#[derive(Clone, Copy, Debug)]
struct IndexEntry {
    /// Offset of the chunk header, relative to the 'movi' fourcc.
    offset: u32,
    len: u32,
}

/// Appends frames to an AVI container in capture order.
pub struct ContainerWriter<W: Write + Seek = BufWriter<File>> {
    out: W,
    codec: FrameCodec,
    fps: u32,
    width: u32,
    height: u32,
    index: Vec<IndexEntry>,
    movi_len: u64,
    max_chunk: u32,
    finished: bool,
}

impl ContainerWriter<BufWriter<File>> {
    /// Create a new file. Fails if the path already exists.
    pub fn create(path: &Path, config: ContainerConfig) -> io::Result<Self> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        Self::new(BufWriter::new(file), config)
    }
}

impl<W: Write + Seek> ContainerWriter<W> {
    pub fn new(out: W, config: ContainerConfig) -> io::Result<Self> {
        let mut writer = Self {
            out,
            codec: FrameCodec::new(config.quality),
            fps: config.fps.max(1),
            width: config.width,
            height: config.height,
            index: Vec::new(),
            movi_len: 0,
            max_chunk: 0,
            finished: false,
        };
        let header = writer.header();
        writer.out.write_all(&header)?;
        writer.out.flush()?;
        Ok(writer)
    }

    /// Encode and append one raw frame.
    pub fn append(&mut self, frame: &RawFrame) -> io::Result<()> {
        let jpeg = self.codec.encode_jpeg(frame).map_err(io::Error::other)?;
        self.append_jpeg(&jpeg, frame.width, frame.height)
    }

    /// Append an already-encoded JPEG frame.
    pub fn append_jpeg(&mut self, jpeg: &[u8], width: u32, height: u32) -> io::Result<()> {
        if self.finished {
            return Err(io::Error::other("container already finished"));
        }
        let len = u32::try_from(jpeg.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large for AVI"))?;
        let offset = u32::try_from(4 + self.movi_len)
            .map_err(|_| io::Error::other("AVI file exceeds the 4 GiB RIFF limit"))?;
        if self.index.is_empty() {
            self.width = width;
            self.height = height;
        }

        self.out.write_all(VIDEO_CHUNK_ID)?;
        self.out.write_all(&len.to_le_bytes())?;
        self.out.write_all(jpeg)?;
        let pad = (len % 2) as u64;
        if pad == 1 {
            self.out.write_all(&[0])?;
        }
        self.out.flush()?;

        self.index.push(IndexEntry { offset, len });
        self.movi_len += 8 + len as u64 + pad;
        self.max_chunk = self.max_chunk.max(len);
        Ok(())
    }

    pub fn frames(&self) -> u64 {
        self.index.len() as u64
    }

    /// Write the index and final header. The container is playable afterwards.
    pub fn finish(mut self) -> io::Result<ContainerStats> {
        self.finalize()
    }

    fn finalize(&mut self) -> io::Result<ContainerStats> {
        if self.finished {
            return Ok(self.stats());
        }
        self.finished = true;

        let mut idx = Vec::with_capacity(8 + self.index.len() * 16);
        idx.extend_from_slice(b"idx1");
        put_u32(&mut idx, (self.index.len() * 16) as u32);
        for entry in &self.index {
            idx.extend_from_slice(VIDEO_CHUNK_ID);
            put_u32(&mut idx, AVIIF_KEYFRAME);
            put_u32(&mut idx, entry.offset);
            put_u32(&mut idx, entry.len);
        }
        self.out.write_all(&idx)?;

        let header = self.header();
        self.out.seek(SeekFrom::Start(0))?;
        self.out.write_all(&header)?;
        self.out.seek(SeekFrom::End(0))?;
        self.out.flush()?;
        Ok(self.stats())
    }

    fn stats(&self) -> ContainerStats {
        ContainerStats {
            frames: self.index.len() as u64,
            bytes: self.total_len(),
        }
    }

    fn idx_len(&self) -> u64 {
        if self.finished {
            8 + self.index.len() as u64 * 16
        } else {
            0
        }
    }

    fn total_len(&self) -> u64 {
        HEADER_LEN as u64 + self.movi_len + self.idx_len()
    }

    fn header(&self) -> Vec<u8> {
        let frames = self.index.len() as u32;
        let riff_len = (self.total_len() - 8) as u32;
        let movi_list_len = (4 + self.movi_len) as u32;
        let suggested = self.max_chunk + 8;
        let image_size = self.width.saturating_mul(self.height).saturating_mul(3);

        let mut h = Vec::with_capacity(HEADER_LEN);
        h.extend_from_slice(b"RIFF");
        put_u32(&mut h, riff_len);
        h.extend_from_slice(b"AVI ");

        h.extend_from_slice(b"LIST");
        put_u32(&mut h, HDRL_LIST_LEN);
        h.extend_from_slice(b"hdrl");

        h.extend_from_slice(b"avih");
        put_u32(&mut h, 56);
        put_u32(&mut h, 1_000_000 / self.fps);
        put_u32(&mut h, self.max_chunk.saturating_mul(self.fps));
        put_u32(&mut h, 0);
        put_u32(&mut h, AVIF_HASINDEX);
        put_u32(&mut h, frames);
        put_u32(&mut h, 0);
        put_u32(&mut h, 1);
        put_u32(&mut h, suggested);
        put_u32(&mut h, self.width);
        put_u32(&mut h, self.height);
        h.extend_from_slice(&[0u8; 16]);

        h.extend_from_slice(b"LIST");
        put_u32(&mut h, STRL_LIST_LEN);
        h.extend_from_slice(b"strl");

        h.extend_from_slice(b"strh");
        put_u32(&mut h, 56);
        h.extend_from_slice(b"vids");
        h.extend_from_slice(b"MJPG");
        put_u32(&mut h, 0);
        put_u16(&mut h, 0);
        put_u16(&mut h, 0);
        put_u32(&mut h, 0);
        put_u32(&mut h, 1);
        put_u32(&mut h, self.fps);
        put_u32(&mut h, 0);
        put_u32(&mut h, frames);
        put_u32(&mut h, suggested);
        put_u32(&mut h, u32::MAX);
        put_u32(&mut h, 0);
        put_u16(&mut h, 0);
        put_u16(&mut h, 0);
        put_u16(&mut h, self.width.min(u16::MAX as u32) as u16);
        put_u16(&mut h, self.height.min(u16::MAX as u32) as u16);

        h.extend_from_slice(b"strf");
        put_u32(&mut h, 40);
        put_u32(&mut h, 40);
        put_u32(&mut h, self.width);
        put_u32(&mut h, self.height);
        put_u16(&mut h, 1);
        put_u16(&mut h, 24);
        h.extend_from_slice(b"MJPG");
        put_u32(&mut h, image_size);
        h.extend_from_slice(&[0u8; 16]);

        h.extend_from_slice(b"LIST");
        put_u32(&mut h, movi_list_len);
        h.extend_from_slice(b"movi");

        debug_assert_eq!(h.len(), HEADER_LEN);
        h
    }
}

impl<W: Write + Seek> Drop for ContainerWriter<W> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.finalize() {
                log::warn!("avi: could not finalize container on drop: {}", err);
            }
        }
    }
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}
