//! Deterministic layer packer.
//!
//! Identical directory contents always produce byte-identical tarballs:
//! entries are sorted by name, mtime/uid/gid are zeroed and the gzip header
//! carries no timestamp or file name.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use berth_shared::errors::{BerthError, BerthResult};
use flate2::{Compression, GzBuilder};
use sha2::{Digest, Sha256};
use tar::{Builder, EntryType, Header};
use walkdir::WalkDir;

/// A packed layer blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedLayer {
    /// `sha256:<hex>` of the compressed bytes.
    pub digest: String,
    /// Compressed size in bytes.
    pub size: u64,
}

/// Writer adapter that hashes everything passing through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (W, String, u64) {
        let digest = format!("sha256:{}", hex::encode(self.hasher.finalize()));
        (self.inner, digest, self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Pack the contents of `src` into a gzip tarball at `out`.
///
/// Paths inside the archive are relative to `src`. Only directories, regular
/// files and symlinks are packed; anything else is rejected.
pub fn pack_layer(src: &Path, out: &Path) -> BerthResult<PackedLayer> {
    let file = File::create(out).map_err(|e| {
        BerthError::Storage(format!("Failed to create layer {}: {}", out.display(), e))
    })?;

    let hashing = HashingWriter::new(BufWriter::new(file));
    let gz = GzBuilder::new()
        .mtime(0)
        .write(hashing, Compression::default());
    let mut builder = Builder::new(gz);
    builder.follow_symlinks(false);

    let mut entries = 0usize;
    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            BerthError::Storage(format!("Failed to walk {}: {}", src.display(), e))
        })?;
        let path = entry.path();
        let rel = path.strip_prefix(src).map_err(|e| {
            BerthError::Internal(format!("walk escaped {}: {}", src.display(), e))
        })?;

        let metadata = fs::symlink_metadata(path).map_err(|e| {
            BerthError::Storage(format!("Failed to stat {}: {}", path.display(), e))
        })?;
        let file_type = metadata.file_type();

        let mut header = Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(metadata.permissions().mode() & 0o7777);

        let result = if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, rel, io::empty())
        } else if file_type.is_file() {
            header.set_entry_type(EntryType::Regular);
            header.set_size(metadata.len());
            let data = File::open(path).map_err(|e| {
                BerthError::Storage(format!("Failed to open {}: {}", path.display(), e))
            })?;
            builder.append_data(&mut header, rel, data)
        } else if file_type.is_symlink() {
            let target = fs::read_link(path).map_err(|e| {
                BerthError::Storage(format!("Failed to read link {}: {}", path.display(), e))
            })?;
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            builder.append_link(&mut header, rel, &target)
        } else {
            return Err(BerthError::Unsupported(format!(
                "cannot pack special file {}",
                path.display()
            )));
        };

        result.map_err(|e| {
            BerthError::Storage(format!("Failed to append {}: {}", rel.display(), e))
        })?;
        entries += 1;
    }

    let gz = builder
        .into_inner()
        .map_err(|e| BerthError::Storage(format!("Failed to finish tar stream: {}", e)))?;
    let hashing = gz
        .finish()
        .map_err(|e| BerthError::Storage(format!("Failed to finish gzip stream: {}", e)))?;
    let (mut writer, digest, size) = hashing.finish();
    writer
        .flush()
        .map_err(|e| BerthError::Storage(format!("Failed to flush layer: {}", e)))?;

    tracing::debug!(
        layer = %out.display(),
        digest = %digest,
        entries,
        size,
        "Packed layer"
    );

    Ok(PackedLayer { digest, size })
}
