//! Uniform read-only handles over the places captured bytes live: plain
//! files, zip members, byte ranges inside a web archive, or memory.
//!
//! The core is single-threaded (ingestion is one sequential pass), so shared
//! backing handles are `Rc<RefCell<..>>`; a zip or web-archive file stays
//! open for as long as any blob references it.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::error::{Error, Result};

pub type SharedZip = Rc<RefCell<zip::ZipArchive<File>>>;
pub type SharedFile = Rc<RefCell<File>>;

/// Transport encoding of a byte range inside a web archive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Identity,
    Gzip,
    Brotli,
    /// Chunked transfer is not reassembled; opening such a blob fails.
    Chunked,
}

#[derive(Clone)]
pub enum BlobKind {
    OnDisk { path: PathBuf },
    InZip { archive: SharedZip, name: String },
    InMemory { data: Rc<Vec<u8>> },
    InWarc {
        file: SharedFile,
        offset: u64,
        len: u64,
        transport: Transport,
    },
}

#[derive(Clone)]
pub struct Blob {
    pub kind: BlobKind,
    pub mime: Option<String>,
}

impl Blob {
    pub fn on_disk(path: impl Into<PathBuf>) -> Self {
        Blob {
            kind: BlobKind::OnDisk { path: path.into() },
            mime: None,
        }
    }

    pub fn in_memory(data: Vec<u8>) -> Self {
        Blob {
            kind: BlobKind::InMemory {
                data: Rc::new(data),
            },
            mime: None,
        }
    }

    pub fn with_mime(mut self, mime: Option<String>) -> Self {
        self.mime = mime;
        self
    }

    /// Path of an on-disk blob, for consumers that can read the file
    /// themselves (the video muxer).
    pub fn disk_path(&self) -> Option<&Path> {
        match &self.kind {
            BlobKind::OnDisk { path } => Some(path),
            _ => None,
        }
    }

    pub fn read(&self) -> Result<Vec<u8>> {
        match &self.kind {
            BlobKind::OnDisk { path } => Ok(std::fs::read(path)?),
            BlobKind::InZip { archive, name } => {
                let mut archive = archive.borrow_mut();
                let mut member = archive.by_name(name)?;
                let mut data = Vec::with_capacity(member.size() as usize);
                member.read_to_end(&mut data)?;
                Ok(data)
            }
            BlobKind::InMemory { data } => Ok(data.as_ref().clone()),
            BlobKind::InWarc {
                file,
                offset,
                len,
                transport,
            } => {
                let mut f = file.borrow_mut();
                f.seek(SeekFrom::Start(*offset))?;
                let mut raw = vec![0u8; *len as usize];
                f.read_exact(&mut raw)?;
                drop(f);
                match transport {
                    Transport::Identity => Ok(raw),
                    Transport::Gzip => {
                        let mut out = Vec::new();
                        flate2::read::GzDecoder::new(raw.as_slice()).read_to_end(&mut out)?;
                        Ok(out)
                    }
                    Transport::Brotli => {
                        let mut out = Vec::new();
                        brotli::Decompressor::new(raw.as_slice(), 4096).read_to_end(&mut out)?;
                        Ok(out)
                    }
                    Transport::Chunked => Err(Error::corrupt(
                        "chunked transfer encoding is not supported",
                    )),
                }
            }
        }
    }

    pub fn open(&self) -> Result<Box<dyn Read>> {
        match &self.kind {
            BlobKind::OnDisk { path } => Ok(Box::new(File::open(path)?)),
            _ => Ok(Box::new(Cursor::new(self.read()?))),
        }
    }

    pub fn read_to_string(&self) -> Result<String> {
        String::from_utf8(self.read()?).map_err(|err| Error::corrupt(format!("not utf-8: {err}")))
    }
}

/// Filesystem-like view over a native directory or a zip archive, addressed
/// with `/`-separated relative paths either way.
pub enum Vfs {
    Native { root: PathBuf },
    Zip { path: PathBuf, archive: SharedZip },
}

impl Vfs {
    pub fn native(root: impl Into<PathBuf>) -> Self {
        Vfs::Native { root: root.into() }
    }

    pub fn open_zip(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let archive = zip::ZipArchive::new(File::open(&path)?)?;
        Ok(Vfs::Zip {
            path,
            archive: Rc::new(RefCell::new(archive)),
        })
    }

    pub fn exists(&self, rel: &str) -> bool {
        match self {
            Vfs::Native { root } => root.join(rel).exists(),
            Vfs::Zip { archive, .. } => {
                archive.borrow().file_names().any(|name| name == rel)
            }
        }
    }

    pub fn read(&self, rel: &str) -> Result<Vec<u8>> {
        self.blob(rel).read()
    }

    pub fn read_to_string(&self, rel: &str) -> Result<String> {
        self.blob(rel).read_to_string()
    }

    /// Immediate and nested names under `rel`, with the prefix stripped.
    pub fn list_dir(&self, rel: &str) -> Vec<String> {
        match self {
            Vfs::Native { root } => std::fs::read_dir(root.join(rel))
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok())
                        .filter_map(|e| e.file_name().into_string().ok())
                        .collect()
                })
                .unwrap_or_default(),
            Vfs::Zip { archive, .. } => {
                let prefix = if rel.ends_with('/') {
                    rel.to_owned()
                } else {
                    format!("{rel}/")
                };
                archive
                    .borrow()
                    .file_names()
                    .filter(|name| name.starts_with(&prefix) && name.len() > prefix.len())
                    .map(|name| name[prefix.len()..].to_owned())
                    .collect()
            }
        }
    }

    /// Modification time of the backing directory or zip file, unix millis.
    pub fn mtime_ms(&self) -> Option<i64> {
        let path = match self {
            Vfs::Native { root } => root,
            Vfs::Zip { path, .. } => path,
        };
        let modified = std::fs::metadata(path).ok()?.modified().ok()?;
        let since = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
        Some(since.as_millis() as i64)
    }

    pub fn blob(&self, rel: &str) -> Blob {
        let mime = mime_for_path(rel).map(str::to_owned);
        match self {
            Vfs::Native { root } => Blob::on_disk(root.join(rel)).with_mime(mime),
            Vfs::Zip { archive, .. } => Blob {
                kind: BlobKind::InZip {
                    archive: archive.clone(),
                    name: rel.to_owned(),
                },
                mime,
            },
        }
    }
}

pub fn mime_for_path(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?;
    Some(match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "m3u8" => "application/vnd.apple.mpegurl",
        "m4s" => "video/iso.segment",
        "ts" => "video/mp2t",
        "json" | "js" => "application/json",
        "txt" => "text/plain",
        _ => return None,
    })
}
