// Single-file durable FIFO: length-prefixed records appended to a data file,
// consumed through a persisted read cursor.
use crate::{BackendQueue, Result, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const RECORD_HEADER_LEN: u64 = 4;

/// File-backed queue for one channel. Records survive process restarts; the
/// cursor metadata is written through on every mutation so a reopened queue
/// resumes where the previous instance stopped.
#[derive(Debug)]
pub struct FileBackend {
    name: String,
    data_path: PathBuf,
    meta_path: PathBuf,
    min_record_size: usize,
    max_record_size: usize,
    state: Mutex<FileState>,
}

#[derive(Debug)]
struct FileState {
    file: Option<File>,
    read_pos: u64,
    write_pos: u64,
    depth: i64,
    closed: bool,
}

impl FileBackend {
    /// Opens (or creates) the queue named `name` under `dir`. Record sizes
    /// outside `[min_record_size, max_record_size]` are rejected on append
    /// and treated as corruption on read.
    pub fn new(
        name: impl Into<String>,
        dir: impl AsRef<Path>,
        min_record_size: usize,
        max_record_size: usize,
    ) -> Result<Self> {
        let name = name.into();
        let data_path = dir.as_ref().join(format!("{name}.dat"));
        let meta_path = dir.as_ref().join(format!("{name}.meta"));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&data_path)?;
        let (read_pos, write_pos, depth) = load_meta(&meta_path)?;

        Ok(Self {
            name,
            data_path,
            meta_path,
            min_record_size,
            max_record_size,
            state: Mutex::new(FileState {
                file: Some(file),
                read_pos,
                write_pos,
                depth,
                closed: false,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn persist_meta(&self, state: &FileState) -> Result<()> {
        let contents = format!("{}\n{}\n{}\n", state.depth, state.read_pos, state.write_pos);
        std::fs::write(&self.meta_path, contents)?;
        Ok(())
    }
}

fn load_meta(path: &Path) -> Result<(u64, u64, i64)> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok((0, 0, 0));
        }
        Err(err) => return Err(err.into()),
    };
    let mut lines = contents.lines();
    let depth = lines.next().and_then(|l| l.parse::<i64>().ok());
    let read_pos = lines.next().and_then(|l| l.parse::<u64>().ok());
    let write_pos = lines.next().and_then(|l| l.parse::<u64>().ok());
    match (depth, read_pos, write_pos) {
        (Some(depth), Some(read_pos), Some(write_pos)) => Ok((read_pos, write_pos, depth)),
        _ => Err(StorageError::Corruption {
            offset: 0,
            reason: format!("unreadable metadata in {}", path.display()),
        }),
    }
}

#[async_trait]
impl BackendQueue for FileBackend {
    async fn put(&self, data: Bytes) -> Result<()> {
        if data.len() < self.min_record_size || data.len() > self.max_record_size {
            return Err(StorageError::InvalidRecordSize {
                size: data.len(),
                min: self.min_record_size,
                max: self.max_record_size,
            });
        }

        let mut state = self.state.lock().expect("file state lock");
        if state.closed {
            return Err(StorageError::Closed);
        }
        let write_pos = state.write_pos;
        let file = state.file.as_mut().ok_or(StorageError::Closed)?;
        file.seek(SeekFrom::Start(write_pos))?;
        file.write_all(&(data.len() as u32).to_be_bytes())?;
        file.write_all(&data)?;
        file.flush()?;

        state.write_pos += RECORD_HEADER_LEN + data.len() as u64;
        state.depth += 1;
        self.persist_meta(&state)
    }

    async fn read_next(&self) -> Result<Option<Bytes>> {
        let mut state = self.state.lock().expect("file state lock");
        if state.closed {
            return Err(StorageError::Closed);
        }
        if state.depth <= 0 || state.read_pos >= state.write_pos {
            return Ok(None);
        }

        let read_pos = state.read_pos;
        let file = state.file.as_mut().ok_or(StorageError::Closed)?;
        file.seek(SeekFrom::Start(read_pos))?;
        let mut header = [0u8; RECORD_HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        let len = u32::from_be_bytes(header) as usize;
        if len < self.min_record_size || len > self.max_record_size {
            return Err(StorageError::Corruption {
                offset: read_pos,
                reason: format!("record length {len} outside configured bounds"),
            });
        }
        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)?;

        state.read_pos += RECORD_HEADER_LEN + len as u64;
        state.depth -= 1;
        self.persist_meta(&state)?;
        Ok(Some(Bytes::from(payload)))
    }

    fn depth(&self) -> i64 {
        self.state.lock().expect("file state lock").depth
    }

    async fn empty(&self) -> Result<()> {
        let mut state = self.state.lock().expect("file state lock");
        if state.closed {
            return Err(StorageError::Closed);
        }
        if let Some(file) = state.file.as_mut() {
            file.set_len(0)?;
        }
        state.read_pos = 0;
        state.write_pos = 0;
        state.depth = 0;
        self.persist_meta(&state)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().expect("file state lock");
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        self.persist_meta(&state)?;
        state.file = None;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let mut state = self.state.lock().expect("file state lock");
        state.closed = true;
        state.file = None;
        for path in [&self.data_path, &self.meta_path] {
            if let Err(err) = std::fs::remove_file(path)
                && err.kind() != std::io::ErrorKind::NotFound
            {
                tracing::error!(path = %path.display(), error = %err, "failed to remove backend file");
                return Err(err.into());
            }
        }
        Ok(())
    }
}
