//! Block data files (`blkNNNNN.dat`) and the frame scanner over them.
//!
//! A file is a concatenation of `magic | len (u32 LE) | payload` frames with
//! no other framing. Files written by a node that is still running may end in
//! a partial frame and may contain zero-filled or garbage regions; the scanner
//! resynchronizes on the magic marker and never fails the overall scan.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const BLOCK_FILE_PREFIX: &str = "blk";
/// Bytes of each frame payload kept in a [`FrameMark`]; enough for a block header.
pub const FRAME_MARK_HEAD: usize = 80;

const READ_BUFFER: usize = 1 << 20;

pub fn block_file_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("{BLOCK_FILE_PREFIX}{index:05}.dat"))
}

/// Consecutive block files starting at `from`, up to the first missing index.
pub fn list_block_files(dir: &Path, from: u32) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut index = from;
    loop {
        let path = block_file_path(dir, index);
        if !path.is_file() {
            break;
        }
        files.push(path);
        index = match index.checked_add(1) {
            Some(next) => next,
            None => break,
        };
    }
    files
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawFrame {
    pub source_file: Arc<Path>,
    /// Position of the length field, i.e. just past the magic marker.
    pub byte_offset: u64,
    pub payload: Vec<u8>,
}

/// Where a frame sits inside its file, plus the start of its payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FrameMark {
    pub offset: u64,
    pub len: u32,
    pub head: Vec<u8>,
}

impl FrameMark {
    fn of(frame: &RawFrame) -> Self {
        let head_len = frame.payload.len().min(FRAME_MARK_HEAD);
        Self {
            offset: frame.byte_offset,
            len: frame.payload.len() as u32,
            head: frame.payload[..head_len].to_vec(),
        }
    }
}

/// Invoked once per file after the scanner is done with it, with the first
/// and last frame that file produced.
pub type FileCompletion = Box<dyn FnMut(&Path, Option<&FrameMark>, Option<&FrameMark>) + Send>;

/// Scan position, readable from other threads while the scanner runs.
#[derive(Debug, Default)]
pub struct ScanCounters {
    files_total: AtomicU64,
    files_opened: AtomicU64,
    completed_bytes: AtomicU64,
    current_position: AtomicU64,
    frames: AtomicU64,
    spurious_lengths: AtomicU64,
    truncated_files: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ScanSnapshot {
    pub files_total: u64,
    pub files_opened: u64,
    pub parsed_bytes: u64,
    pub frames: u64,
    pub spurious_lengths: u64,
    pub truncated_files: u64,
}

impl ScanCounters {
    pub fn snapshot(&self) -> ScanSnapshot {
        ScanSnapshot {
            files_total: self.files_total.load(Ordering::Relaxed),
            files_opened: self.files_opened.load(Ordering::Relaxed),
            parsed_bytes: self.completed_bytes.load(Ordering::Relaxed)
                + self.current_position.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            spurious_lengths: self.spurious_lengths.load(Ordering::Relaxed),
            truncated_files: self.truncated_files.load(Ordering::Relaxed),
        }
    }
}

struct OpenFile {
    path: Arc<Path>,
    len: u64,
    reader: BufReader<File>,
    /// Bytes handed back after a spurious length, popped from the end.
    pushback: Vec<u8>,
    position: u64,
}

impl OpenFile {
    fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata().map(|meta| meta.len()).unwrap_or(0);
        Ok(Self {
            path: Arc::from(path),
            len,
            reader: BufReader::with_capacity(READ_BUFFER, file),
            pushback: Vec::new(),
            position: 0,
        })
    }

    fn next_byte(&mut self) -> io::Result<Option<u8>> {
        if let Some(byte) = self.pushback.pop() {
            self.position += 1;
            return Ok(Some(byte));
        }
        let buf = self.reader.fill_buf()?;
        let Some(&byte) = buf.first() else {
            return Ok(None);
        };
        self.reader.consume(1);
        self.position += 1;
        Ok(Some(byte))
    }

    /// Fills `buf` completely, or returns `false` at end of file.
    fn read_full(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.pushback.pop() {
                Some(byte) => {
                    buf[filled] = byte;
                    filled += 1;
                    self.position += 1;
                }
                None => break,
            }
        }
        match self.reader.read_exact(&mut buf[filled..]) {
            Ok(()) => {
                self.position += (buf.len() - filled) as u64;
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn unread(&mut self, bytes: &[u8]) {
        self.pushback.extend(bytes.iter().rev());
        self.position -= bytes.len() as u64;
    }

    /// Advances past the next magic marker. `false` at end of file.
    fn seek_magic(&mut self, magic: &[u8; 4]) -> io::Result<bool> {
        let mut matched = 0usize;
        while let Some(byte) = self.next_byte()? {
            if byte == magic[matched] {
                matched += 1;
                if matched == magic.len() {
                    return Ok(true);
                }
            } else if byte == magic[0] {
                matched = 1;
            } else {
                matched = 0;
            }
        }
        Ok(false)
    }
}

enum Step {
    Frame(RawFrame),
    Spurious,
    Truncated,
    Exhausted,
}

/// Lazily yields every frame of an ordered list of files. At most one file
/// is open at a time; it is closed before the next one is opened.
pub struct FrameScanner {
    files: Vec<PathBuf>,
    next_file: usize,
    current: Option<OpenFile>,
    magic: [u8; 4],
    max_frame_len: u64,
    counters: Arc<ScanCounters>,
    on_file_complete: Option<FileCompletion>,
    first: Option<FrameMark>,
    last: Option<FrameMark>,
}

impl FrameScanner {
    /// `max_frame_len` is the hard ceiling; longer declared lengths are
    /// treated as garbage that happened to follow a magic marker.
    pub fn new(files: Vec<PathBuf>, magic: [u8; 4], max_frame_len: u64) -> Self {
        let counters = Arc::new(ScanCounters::default());
        counters
            .files_total
            .store(files.len() as u64, Ordering::Relaxed);
        Self {
            files,
            next_file: 0,
            current: None,
            magic,
            max_frame_len,
            counters,
            on_file_complete: None,
            first: None,
            last: None,
        }
    }

    pub fn with_file_completion(mut self, callback: FileCompletion) -> Self {
        self.on_file_complete = Some(callback);
        self
    }

    pub fn counters(&self) -> Arc<ScanCounters> {
        Arc::clone(&self.counters)
    }

    pub fn current_file(&self) -> Option<&Path> {
        self.current.as_ref().map(|file| file.path.as_ref())
    }

    fn open_next(&mut self) -> bool {
        while self.next_file < self.files.len() {
            let path = self.files[self.next_file].clone();
            self.next_file += 1;
            self.counters.files_opened.fetch_add(1, Ordering::Relaxed);
            self.counters.current_position.store(0, Ordering::Relaxed);
            match OpenFile::open(&path) {
                Ok(file) => {
                    blkgraph_log::log_debug!("scanning {}", path.display());
                    self.current = Some(file);
                    return true;
                }
                Err(err) => {
                    blkgraph_log::log_warn!("cannot open {}: {err}", path.display());
                    if let Some(callback) = self.on_file_complete.as_mut() {
                        callback(&path, None, None);
                    }
                }
            }
        }
        false
    }

    fn finish_current(&mut self) {
        let Some(file) = self.current.take() else {
            return;
        };
        let consumed = file.len.max(file.position);
        let path = Arc::clone(&file.path);
        drop(file);
        self.counters
            .completed_bytes
            .fetch_add(consumed, Ordering::Relaxed);
        self.counters.current_position.store(0, Ordering::Relaxed);
        let first = self.first.take();
        let last = self.last.take();
        if let Some(callback) = self.on_file_complete.as_mut() {
            callback(&path, first.as_ref(), last.as_ref());
        }
    }

    fn step(&mut self) -> io::Result<Step> {
        let magic = self.magic;
        let max_frame_len = self.max_frame_len;
        let Some(file) = self.current.as_mut() else {
            return Ok(Step::Exhausted);
        };
        if !file.seek_magic(&magic)? {
            return Ok(Step::Exhausted);
        }
        let byte_offset = file.position;
        let mut len_bytes = [0u8; 4];
        if !file.read_full(&mut len_bytes)? {
            return Ok(Step::Truncated);
        }
        let len = u64::from(u32::from_le_bytes(len_bytes));
        if len == 0 || len > max_frame_len {
            file.unread(&len_bytes);
            return Ok(Step::Spurious);
        }
        let mut payload = vec![0u8; len as usize];
        if !file.read_full(&mut payload)? {
            return Ok(Step::Truncated);
        }
        Ok(Step::Frame(RawFrame {
            source_file: Arc::clone(&file.path),
            byte_offset,
            payload,
        }))
    }
}

impl Iterator for FrameScanner {
    type Item = RawFrame;

    fn next(&mut self) -> Option<RawFrame> {
        loop {
            if self.current.is_none() && !self.open_next() {
                return None;
            }
            let step = self.step();
            if let Some(file) = self.current.as_ref() {
                self.counters
                    .current_position
                    .store(file.position, Ordering::Relaxed);
            }
            match step {
                Ok(Step::Frame(frame)) => {
                    self.counters.frames.fetch_add(1, Ordering::Relaxed);
                    let mark = FrameMark::of(&frame);
                    if self.first.is_none() {
                        self.first = Some(mark.clone());
                    }
                    self.last = Some(mark);
                    return Some(frame);
                }
                Ok(Step::Spurious) => {
                    self.counters
                        .spurious_lengths
                        .fetch_add(1, Ordering::Relaxed);
                }
                Ok(Step::Truncated) => {
                    self.counters
                        .truncated_files
                        .fetch_add(1, Ordering::Relaxed);
                    if let Some(path) = self.current_file() {
                        blkgraph_log::log_debug!("truncated frame at end of {}", path.display());
                    }
                    self.finish_current();
                }
                Ok(Step::Exhausted) => self.finish_current(),
                Err(err) => {
                    if let Some(path) = self.current_file() {
                        blkgraph_log::log_warn!("read error in {}: {err}", path.display());
                    }
                    self.finish_current();
                }
            }
        }
    }
}
