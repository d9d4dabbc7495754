use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use imgbundle_core::error::{BundleError, Result};

use super::{chunk_name, MANIFEST_CHUNK};
use crate::imagedesc::{BlobSource, DescribedImages, DescribedReader, ImageRefDescriptors};

/// Byte range of one chunk inside the archive.
#[derive(Debug, Clone, Copy)]
struct Chunk {
    offset: u64,
    size: u64,
}

/// A tar archive indexed by chunk name.
///
/// Indexing reads headers only; each open seeks straight to the chunk and
/// streams just its bytes through a fresh file handle, so opens are
/// independent of each other.
#[derive(Debug)]
pub struct TarFile {
    path: PathBuf,
    chunks: HashMap<String, Chunk>,
}

impl TarFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            BundleError::Format(format!("Opening tar {}: {}", path.display(), e))
        })?;

        let mut archive = tar::Archive::new(file);
        let mut chunks = HashMap::new();
        for entry in archive.entries_with_seek()? {
            let entry = entry.map_err(|e| bad_tar(path, e))?;
            let name = entry.path().map_err(|e| bad_tar(path, e))?;
            let name = name.to_string_lossy().trim_start_matches("./").to_string();
            chunks.insert(
                name,
                Chunk {
                    offset: entry.raw_file_position(),
                    size: entry.size(),
                },
            );
        }

        tracing::debug!(path = %path.display(), chunks = chunks.len(), "Indexed tar");
        Ok(Self {
            path: path.to_path_buf(),
            chunks,
        })
    }

    pub fn has_chunk(&self, name: &str) -> bool {
        self.chunks.contains_key(name)
    }

    /// Stream chunk `name`.
    pub fn open_chunk(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let chunk = self.chunks.get(name).copied().ok_or_else(|| {
            BundleError::Format(format!(
                "Expected to find chunk '{}' in tar {}",
                name,
                self.path.display()
            ))
        })?;

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(chunk.offset))?;
        Ok(Box::new(file.take(chunk.size)))
    }
}

impl BlobSource for TarFile {
    fn open_blob(&self, digest: &str) -> Result<Box<dyn Read + Send + '_>> {
        self.open_chunk(&chunk_name(digest))
    }

    fn blob_size(&self, digest: &str) -> Option<u64> {
        self.chunks.get(&chunk_name(digest)).map(|c| c.size)
    }
}

/// Reads images back out of a tar written by [`super::TarWriter`].
pub struct TarReader {
    file: Arc<TarFile>,
}

impl TarReader {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            file: Arc::new(TarFile::open(path)?),
        })
    }

    /// The descriptor record, validated.
    pub fn descriptors(&self) -> Result<ImageRefDescriptors> {
        if !self.file.has_chunk(MANIFEST_CHUNK) {
            return Err(BundleError::Format(format!(
                "Expected to find {} in tar {}",
                MANIFEST_CHUNK,
                self.file.path.display()
            )));
        }

        let mut data = Vec::new();
        self.file.open_chunk(MANIFEST_CHUNK)?.read_to_end(&mut data)?;
        ImageRefDescriptors::from_bytes(&data)
    }

    /// Described images and indexes, in record order. Fails up front if any
    /// described blob is missing from the archive.
    pub fn read(&self) -> Result<DescribedImages> {
        let reader = DescribedReader::new(self.descriptors()?, Arc::clone(&self.file) as Arc<dyn BlobSource>);
        reader.verify_complete()?;
        Ok(reader.read())
    }
}

fn bad_tar(path: &Path, e: std::io::Error) -> BundleError {
    BundleError::Format(format!("Reading tar {}: {}", path.display(), e))
}
