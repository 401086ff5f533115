//! File recorder sink: writes raw pages to disk, optionally prefixed
//! with a small self-describing block header, with file splitting by
//! size or page count and per-source file separation.

use super::{Consumer, ConsumerError};
use crate::block::{BlockHeader, DataBlockRef, DataSet};
use crate::config::{ConfigError, ConfigMap};
use crate::pipeline::PipelineContext;
use crate::stats::DaqStats;
use crate::util::format_bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

/// Magic marking one recorded block when headers are enabled.
pub const RECORD_MAGIC: u32 = 0x4851_4144; // "DAQH"
pub const RECORD_VERSION: u32 = 1;

/// Self-describing per-block file header (bincode, fixed width LE).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecordedHeader {
    pub magic: u32,
    pub version: u32,
    pub block_id: u64,
    pub timeframe_id: u64,
    pub equipment_id: u16,
    pub link_id: u8,
    pub system_id: u8,
    pub fee_id: u16,
    pub run_number: u32,
    pub is_rdh_format: bool,
    pub end_of_timeframe: bool,
    pub payload_size: u32,
    /// CRC32 of the payload bytes.
    pub payload_crc32: u32,
}

impl RecordedHeader {
    fn for_block(block: &DataBlockRef) -> Self {
        let h: &BlockHeader = block.header();
        Self {
            magic: RECORD_MAGIC,
            version: RECORD_VERSION,
            block_id: h.block_id,
            timeframe_id: h.timeframe_id,
            equipment_id: h.equipment_id,
            link_id: h.link_id,
            system_id: h.system_id,
            fee_id: h.fee_id,
            run_number: h.run_number,
            is_rdh_format: h.is_rdh_format,
            end_of_timeframe: block.end_of_timeframe(),
            payload_size: h.data_size,
            payload_crc32: crc32fast::hash(block.payload()),
        }
    }
}

struct OutputFile {
    writer: BufWriter<File>,
    path: PathBuf,
    bytes_written: u64,
    pages_written: u64,
    chunk_index: u64,
}

/// Records raw pages to files.
///
/// The file name template accepts `%t` (record start timestamp), `%i`
/// (chunk index, required when splitting is enabled) and `%e` (source
/// equipment id, one file per source).
pub struct FileRecorder {
    name: String,
    template: String,
    header_enabled: bool,
    max_file_bytes: u64,
    max_file_pages: u64,
    max_files: u64,
    per_source: bool,
    stats: Arc<DaqStats>,
    /// Key is the equipment id, or a single 0 entry without `%e`.
    files: BTreeMap<u16, OutputFile>,
    start_stamp: String,
    recording_enabled: bool,
    total_bytes: u64,
    total_blocks: u64,
}

impl FileRecorder {
    pub fn from_config(cfg: &ConfigMap, section: &str, ctx: &PipelineContext) -> Result<Self, ConsumerError> {
        let template = cfg.get_str_or(section, "fileName", "data.raw");
        let max_file_bytes = cfg.get_bytes_or(section, "bytesMax", 0)?;
        let max_file_pages = cfg.get_i64_or(section, "pagesMax", 0)?.max(0) as u64;
        let max_files = cfg.get_i64_or(section, "filesMax", 1)?.max(1) as u64;
        let splitting = max_file_bytes > 0 || max_file_pages > 0;
        if splitting && !template.contains("%i") {
            return Err(ConsumerError::Config(ConfigError::BadValue {
                section: section.into(),
                key: "fileName".into(),
                value: template,
                expected: "a %i token when file splitting is enabled",
            }));
        }
        Ok(Self {
            name: cfg.get_str_or(section, "name", section),
            per_source: template.contains("%e"),
            template,
            header_enabled: cfg.get_bool_or(section, "dataBlockHeaderEnabled", false)?,
            max_file_bytes,
            max_file_pages,
            max_files,
            stats: ctx.stats.clone(),
            files: BTreeMap::new(),
            start_stamp: String::new(),
            recording_enabled: true,
            total_bytes: 0,
            total_blocks: 0,
        })
    }

    fn file_path(&self, source: u16, chunk: u64) -> PathBuf {
        let mut name = self.template.clone();
        name = name.replace("%t", &self.start_stamp);
        name = name.replace("%i", &chunk.to_string());
        name = name.replace("%e", &source.to_string());
        PathBuf::from(name)
    }

    fn open_file(&self, source: u16, chunk: u64) -> io::Result<OutputFile> {
        let path = self.file_path(source, chunk);
        let file = File::create(&path)?;
        info!("{}: recording to {}", self.name, path.display());
        Ok(OutputFile {
            writer: BufWriter::new(file),
            path,
            bytes_written: 0,
            pages_written: 0,
            chunk_index: chunk,
        })
    }

    /// Whether writing `more` bytes would exceed the per-file limits.
    fn needs_rotation(&self, file: &OutputFile, more: u64) -> bool {
        (self.max_file_bytes > 0 && file.bytes_written + more > self.max_file_bytes && file.bytes_written > 0)
            || (self.max_file_pages > 0 && file.pages_written >= self.max_file_pages)
    }

    /// Writes one block; returns false when recording shut down instead.
    fn write_block(&mut self, block: &DataBlockRef) -> Result<bool, ConsumerError> {
        let source = if self.per_source { block.header().equipment_id } else { 0 };
        let payload = block.payload();
        let header_bytes = if self.header_enabled {
            bincode::serialize(&RecordedHeader::for_block(block)).expect("fixed-layout header serializes")
        } else {
            Vec::new()
        };
        let write_size = (header_bytes.len() + payload.len()) as u64;

        if !self.files.contains_key(&source) {
            let file = self.open_file(source, 0)?;
            self.files.insert(source, file);
        }
        let needs_rotation = {
            let file = &self.files[&source];
            self.needs_rotation(file, write_size)
        };
        if needs_rotation {
            let next_chunk = self.files[&source].chunk_index + 1;
            if next_chunk >= self.max_files {
                info!("{}: maximum number of files reached, recording stopped", self.name);
                self.recording_enabled = false;
                return Ok(false);
            }
            let file = self.open_file(source, next_chunk)?;
            self.files.insert(source, file);
        }

        let file = self.files.get_mut(&source).expect("file just inserted");
        file.writer.write_all(&header_bytes)?;
        file.writer.write_all(payload)?;
        file.bytes_written += write_size;
        file.pages_written += 1;
        self.total_bytes += write_size;
        self.total_blocks += 1;
        self.stats.bytes_recorded.fetch_add(write_size, Ordering::Relaxed);
        Ok(true)
    }
}

impl Consumer for FileRecorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<(), ConsumerError> {
        self.files.clear();
        self.recording_enabled = true;
        self.total_bytes = 0;
        self.total_blocks = 0;
        self.start_stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
        Ok(())
    }

    fn stop(&mut self) {
        for file in self.files.values_mut() {
            if let Err(e) = file.writer.flush() {
                warn!("{}: flush of {} failed: {}", self.name, file.path.display(), e);
            }
        }
        info!(
            "{}: recorded {} blocks, {}",
            self.name,
            self.total_blocks,
            format_bytes(self.total_bytes as f64, "B")
        );
        self.files.clear();
    }

    fn push_set(&mut self, set: &DataSet) -> Result<usize, ConsumerError> {
        if !self.recording_enabled {
            return Ok(0);
        }
        let mut written = 0;
        for block in set {
            if !self.recording_enabled {
                break;
            }
            if self.write_block(block)? {
                written += 1;
            }
        }
        Ok(written)
    }
}

/// Reads back a file written with `dataBlockHeaderEnabled=1`, verifying
/// payload checksums. Used by tooling and tests.
pub fn read_recorded(path: &Path) -> io::Result<Vec<(RecordedHeader, Vec<u8>)>> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    let header_size = bincode::serialized_size(&RecordedHeader {
        magic: RECORD_MAGIC,
        version: RECORD_VERSION,
        block_id: 0,
        timeframe_id: 0,
        equipment_id: 0,
        link_id: 0,
        system_id: 0,
        fee_id: 0,
        run_number: 0,
        is_rdh_format: false,
        end_of_timeframe: false,
        payload_size: 0,
        payload_crc32: 0,
    })
    .expect("fixed-layout header serializes") as usize;

    let mut blocks = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        if offset + header_size > data.len() {
            return Err(io::Error::other("truncated block header"));
        }
        let header: RecordedHeader =
            bincode::deserialize(&data[offset..offset + header_size]).map_err(io::Error::other)?;
        if header.magic != RECORD_MAGIC {
            return Err(io::Error::other("bad record magic"));
        }
        offset += header_size;
        let end = offset + header.payload_size as usize;
        if end > data.len() {
            return Err(io::Error::other("truncated payload"));
        }
        let payload = data[offset..end].to_vec();
        if crc32fast::hash(&payload) != header.payload_crc32 {
            return Err(io::Error::other(format!("payload checksum mismatch for block {}", header.block_id)));
        }
        blocks.push((header, payload));
        offset = end;
    }
    Ok(blocks)
}
