// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Single-file [`OrderedStore`].
//!
//! Each commit is one frame appended to the file:
//!
//! ``MAGIC(4) || VERSION(2) || LENGTH(4) || PAYLOAD || CHECKSUM(32)``
//!
//! * PAYLOAD is the CBOR encoding of the commit's `Vec<WriteOp>`
//! * CHECKSUM = blake3-256 over HEADER (first 10 bytes) || PAYLOAD
//!
//! A frame cut short by a crash (or whose checksum fails and which is the
//! last thing in the file) is a torn tail: it is truncated away on open and
//! the commit it carried never happened. A bad frame followed by more data is
//! corruption and refuses to open. Commits containing [`WriteOp::Clear`] are
//! written as a compacted image to a sibling file and renamed over the log.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use blake3::Hasher;
use tracing::{debug, warn};

use crate::memory::Entries;
use crate::store::{OrderedStore, StoreError, StoreKey, WriteOp};

/// Frame magic "BNTO".
pub const MAGIC: [u8; 4] = *b"BNTO";
/// Frame format version (big-endian u16).
pub const VERSION: u16 = 0x0001;

const HEADER_LEN: usize = 10;
const CHECKSUM_LEN: usize = 32;

enum FrameError {
    Torn(&'static str),
    Corrupt(String),
}

fn checksum(header: &[u8], payload: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    *hasher.finalize().as_bytes()
}

fn encode_frame(ops: &[WriteOp]) -> Result<Vec<u8>, StoreError> {
    let mut payload = Vec::new();
    ciborium::into_writer(ops, &mut payload).map_err(|e| StoreError::Encode(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| StoreError::Encode(format!("frame of {} bytes is too large", payload.len())))?;

    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_be_bytes());
    header[6..10].copy_from_slice(&len.to_be_bytes());

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + CHECKSUM_LEN);
    out.extend_from_slice(&header);
    out.extend_from_slice(&payload);
    out.extend_from_slice(&checksum(&header, &payload));
    Ok(out)
}

fn decode_frame(bytes: &[u8]) -> Result<(Vec<WriteOp>, usize), FrameError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::Torn("incomplete header"));
    }
    if bytes[0..4] != MAGIC {
        return Err(FrameError::Corrupt("bad magic".into()));
    }
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(FrameError::Corrupt(format!("unsupported frame version {version}")));
    }
    let len = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
    let len = usize::try_from(len).map_err(|_| FrameError::Corrupt("frame length overflows".into()))?;
    let end = HEADER_LEN + len + CHECKSUM_LEN;
    if bytes.len() < end {
        return Err(FrameError::Torn("incomplete frame"));
    }

    let header = &bytes[..HEADER_LEN];
    let payload = &bytes[HEADER_LEN..HEADER_LEN + len];
    if checksum(header, payload)[..] != bytes[HEADER_LEN + len..end] {
        return if end == bytes.len() {
            Err(FrameError::Torn("checksum mismatch in final frame"))
        } else {
            Err(FrameError::Corrupt("checksum mismatch".into()))
        };
    }

    let ops = ciborium::from_reader(payload).map_err(|e| FrameError::Corrupt(e.to_string()))?;
    Ok((ops, end))
}

/// Append-only framed log file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    file: File,
    len: u64,
    entries: Entries,
}

impl FileStore {
    /// Opens (creating if needed) the log at `path`, replaying every frame
    /// into memory and truncating a torn tail.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut entries = Entries::default();
        let mut offset = 0usize;
        let mut frames = 0usize;
        while offset < bytes.len() {
            match decode_frame(&bytes[offset..]) {
                Ok((ops, used)) => {
                    entries.apply(ops);
                    offset += used;
                    frames += 1;
                }
                Err(FrameError::Torn(reason)) => {
                    warn!(
                        path = %path.display(),
                        offset,
                        dropped = bytes.len() - offset,
                        reason,
                        "truncating torn tail of patch log"
                    );
                    file.set_len(offset as u64)?;
                    file.sync_all()?;
                    break;
                }
                Err(FrameError::Corrupt(reason)) => {
                    return Err(StoreError::Corrupt {
                        offset: offset as u64,
                        reason,
                    });
                }
            }
        }
        debug!(path = %path.display(), frames, bytes = offset, "opened file store");

        Ok(Self {
            path,
            file,
            len: offset as u64,
            entries,
        })
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append_frame(&mut self, frame: &[u8]) -> Result<(), StoreError> {
        if let Err(err) = self.file.write_all(frame).and_then(|()| self.file.sync_data()) {
            // Roll back a partial write so later frames stay contiguous.
            let _ = self.file.set_len(self.len);
            return Err(err.into());
        }
        self.len += frame.len() as u64;
        Ok(())
    }

    fn rewrite(&mut self, entries: &Entries) -> Result<(), StoreError> {
        let image = entries.image();
        let frame = if image.is_empty() {
            Vec::new()
        } else {
            encode_frame(&image)?
        };

        let mut name = self
            .path
            .file_name()
            .map_or_else(|| OsString::from("patchlog"), OsString::from);
        name.push(".compact");
        let tmp = self.path.with_file_name(name);
        {
            let mut out = File::create(&tmp)?;
            out.write_all(&frame)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        sync_parent(&self.path);

        self.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        self.len = frame.len() as u64;
        debug!(path = %self.path.display(), bytes = self.len, "compacted file store");
        Ok(())
    }
}

#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(err) = File::open(dir).and_then(|d| d.sync_all()) {
            debug!(dir = %dir.display(), error = %err, "directory sync failed");
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}

impl OrderedStore for FileStore {
    fn get(&self, key: StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.get(key))
    }

    fn range_from(&self, start: u64) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        Ok(self.entries.range_from(start))
    }

    fn last_seq(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.entries.last_seq())
    }

    fn commit(&mut self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        if ops.iter().any(|op| matches!(op, WriteOp::Clear)) {
            let mut next = self.entries.clone();
            next.apply(ops);
            self.rewrite(&next)?;
            self.entries = next;
        } else {
            let frame = encode_frame(&ops)?;
            self.append_frame(&frame)?;
            self.entries.apply(ops);
        }
        Ok(())
    }
}
