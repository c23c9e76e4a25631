//! CRC-checked segment files backing the storage drivers
//!
//! A segment is a short header followed by length-prefixed entries:
//! `[length: u32][crc32: u32][payload]`. Readers verify every checksum and
//! stop cleanly at end of file, so a torn tail write surfaces as a checksum
//! error rather than garbage data.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use tracing::{debug, trace};

const SEGMENT_MAGIC: u32 = 0x5446_5347; // "TFSG"
const SEGMENT_VERSION: u32 = 1;
const SEGMENT_HEADER_SIZE: u64 = 8;

/// A single append-only segment file
pub struct Segment {
    path: PathBuf,
    file: BufWriter<File>,
    size: u64,
    max_size: u64,
}

impl Segment {
    /// Create a fresh segment file at `path`
    pub fn create(path: &Path, max_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut writer = BufWriter::with_capacity(64 * 1024, file);
        writer.write_u32::<LittleEndian>(SEGMENT_MAGIC)?;
        writer.write_u32::<LittleEndian>(SEGMENT_VERSION)?;
        writer.flush()?;

        Ok(Self {
            path: path.to_path_buf(),
            file: writer,
            size: SEGMENT_HEADER_SIZE,
            max_size,
        })
    }

    /// Reopen an existing segment for appending
    pub fn open_for_append(path: &Path, max_size: u64) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header = BufReader::new(&mut file);
        let magic = header.read_u32::<LittleEndian>()?;
        if magic != SEGMENT_MAGIC {
            return Err(anyhow!("invalid segment magic {:#x} in {}", magic, path.display()));
        }
        let version = header.read_u32::<LittleEndian>()?;
        if version != SEGMENT_VERSION {
            return Err(anyhow!("unsupported segment version {}", version));
        }

        let size = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::with_capacity(64 * 1024, file),
            size,
            max_size,
        })
    }

    /// Append one entry
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.is_full(data.len()) {
            return Err(anyhow!("segment {} is full", self.path.display()));
        }

        let mut hasher = Hasher::new();
        hasher.update(data);
        let crc = hasher.finalize();

        self.file.write_u32::<LittleEndian>(data.len() as u32)?;
        self.file.write_u32::<LittleEndian>(crc)?;
        self.file.write_all(data)?;

        self.size += 8 + data.len() as u64;
        trace!("appended {} bytes to {}", data.len(), self.path.display());
        Ok(())
    }

    /// Whether the next entry of `next_entry_size` bytes would overflow
    pub fn is_full(&self, next_entry_size: usize) -> bool {
        self.size
            .saturating_add(8)
            .saturating_add(next_entry_size as u64)
            > self.max_size
    }

    /// Flush buffered entries and fsync
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_mut().sync_all()?;
        Ok(())
    }

    /// Current on-disk size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Reader over one segment's entries
pub struct SegmentReader {
    reader: BufReader<File>,
}

impl SegmentReader {
    /// Open a segment for sequential reading
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::with_capacity(64 * 1024, file);

        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != SEGMENT_MAGIC {
            return Err(anyhow!("invalid segment magic {:#x} in {}", magic, path.display()));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != SEGMENT_VERSION {
            return Err(anyhow!("unsupported segment version {}", version));
        }

        Ok(Self { reader })
    }

    /// Read the next entry, or `None` at end of file
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>> {
        let length = match self.reader.read_u32::<LittleEndian>() {
            Ok(length) => length as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let expected_crc = self.reader.read_u32::<LittleEndian>()?;

        let mut data = vec![0u8; length];
        self.reader.read_exact(&mut data)?;

        let mut hasher = Hasher::new();
        hasher.update(&data);
        let actual_crc = hasher.finalize();
        if actual_crc != expected_crc {
            return Err(anyhow!(
                "segment checksum mismatch: expected {:#x}, got {:#x}",
                expected_crc,
                actual_crc
            ));
        }

        Ok(Some(data))
    }
}

/// Rotating writer over numbered segments in one directory
pub struct SegmentLog {
    dir: PathBuf,
    extension: &'static str,
    segment_size: u64,
    current: Option<Segment>,
    counter: u64,
}

impl SegmentLog {
    /// Open (or initialize) a segment directory
    pub fn open(dir: &Path, extension: &'static str, segment_size: u64) -> Result<Self> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        let counter = Self::list(dir, extension)?
            .iter()
            .filter_map(|path| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.parse::<u64>().ok())
            })
            .max()
            .unwrap_or(0);

        Ok(Self {
            dir: dir.to_path_buf(),
            extension,
            segment_size,
            current: None,
            counter,
        })
    }

    /// Append one serialized entry, rotating segments as needed
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if self
            .current
            .as_ref()
            .map_or(true, |segment| segment.is_full(data.len()))
        {
            self.rotate()?;
        }

        match &mut self.current {
            Some(segment) => segment.append(data),
            None => Err(anyhow!("no writable segment in {}", self.dir.display())),
        }
    }

    /// Flush and fsync the current segment
    pub fn flush(&mut self) -> Result<()> {
        if let Some(segment) = &mut self.current {
            segment.flush()?;
        }
        Ok(())
    }

    /// All segment paths in write order
    pub fn segments(&self) -> Result<Vec<PathBuf>> {
        Self::list(&self.dir, self.extension)
    }

    fn rotate(&mut self) -> Result<()> {
        if let Some(mut segment) = self.current.take() {
            segment.flush()?;
        }

        // Resume the newest existing segment before opening a fresh one.
        if self.counter > 0 && self.current.is_none() {
            let path = self.segment_path(self.counter);
            if path.exists() {
                if let Ok(segment) = Segment::open_for_append(&path, self.segment_size) {
                    if !segment.is_full(0) {
                        self.current = Some(segment);
                        return Ok(());
                    }
                }
            }
        }

        self.counter += 1;
        let path = self.segment_path(self.counter);
        self.current = Some(Segment::create(&path, self.segment_size)?);
        debug!("rotated to segment {}", path.display());
        Ok(())
    }

    fn segment_path(&self, counter: u64) -> PathBuf {
        self.dir.join(format!("{counter:010}.{}", self.extension))
    }

    fn list(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
        let mut segments: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some(extension))
            .collect();
        segments.sort();
        Ok(segments)
    }
}
