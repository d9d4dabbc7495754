use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use imgbundle_core::error::Result;

use super::{chunk_name, MANIFEST_CHUNK};
use crate::imagedesc::{BlobSource, ImageRefDescriptors};

/// Packs described images into a tar archive: the descriptor record first,
/// then each blob once.
pub struct TarWriter {
    descs: ImageRefDescriptors,
    source: Arc<dyn BlobSource>,
}

impl TarWriter {
    pub fn new(descs: ImageRefDescriptors, source: Arc<dyn BlobSource>) -> Self {
        Self { descs, source }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.write_to(&mut out)?;
        out.flush()?;
        tracing::info!(path = %path.display(), images = self.descs.descriptors().len(), "Wrote tar");
        Ok(())
    }

    pub fn write_to<W: Write>(&self, out: W) -> Result<()> {
        let mut builder = tar::Builder::new(out);
        builder.mode(tar::HeaderMode::Deterministic);

        let record = self.descs.to_bytes()?;
        builder.append_data(&mut chunk_header(record.len() as u64), MANIFEST_CHUNK, record.as_slice())?;

        for (digest, size) in self.descs.blob_digests() {
            let reader = ExactLength {
                inner: self.source.open_blob(&digest)?,
                remaining: size,
                digest: &digest,
            };
            builder.append_data(&mut chunk_header(size), chunk_name(&digest), reader)?;
            tracing::debug!(digest = %digest, size, "Wrote chunk");
        }

        builder.into_inner()?.flush()?;
        Ok(())
    }
}

fn chunk_header(size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    header
}

/// Yields exactly `remaining` bytes, failing if the blob is shorter or longer
/// than its descriptor says. A mismatch would otherwise corrupt the archive.
struct ExactLength<'a, R> {
    inner: R,
    remaining: u64,
    digest: &'a str,
}

impl<R: Read> Read for ExactLength<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            let mut peek = [0u8; 1];
            return match self.inner.read(&mut peek)? {
                0 => Ok(0),
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("blob {} is larger than described", self.digest),
                )),
            };
        }

        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("blob {} is shorter than described", self.digest),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}
