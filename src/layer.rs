//! Applying downloaded layer blobs onto a sandbox root.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;

use crate::error::{Result, SandboxError};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Filesystem-safe file name for a blob: the digest without its
/// `algorithm:` prefix.
pub fn blob_file_name(digest: &str) -> &str {
    digest.split_once(':').map_or(digest, |(_, hex)| hex)
}

/// Where the blob for `digest` is downloaded to before extraction.
pub fn blob_path(target_dir: &Path, digest: &str) -> PathBuf {
    target_dir.join(blob_file_name(digest))
}

/// Unpacks the tar (optionally gzip-compressed) archive at `blob` into
/// `target_dir`, keeping entry permissions and overwriting files laid down by
/// earlier layers, then deletes the blob.
pub fn materialize(blob: &Path, target_dir: &Path) -> Result<()> {
    let extraction_err = |source| SandboxError::Extraction {
        blob: blob.to_path_buf(),
        source,
    };

    unpack(blob, target_dir).map_err(extraction_err)?;
    std::fs::remove_file(blob).map_err(extraction_err)?;

    tracing::debug!(blob = %blob.display(), target = %target_dir.display(), "layer applied");
    Ok(())
}

fn unpack(blob: &Path, target_dir: &Path) -> io::Result<()> {
    let mut file = File::open(blob)?;

    let mut magic = [0u8; 2];
    let is_gzip = match file.read_exact(&mut magic) {
        Ok(()) => magic == GZIP_MAGIC,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => false,
        Err(e) => return Err(e),
    };
    file.seek(SeekFrom::Start(0))?;

    let reader = BufReader::new(file);
    if is_gzip {
        unpack_archive(Archive::new(GzDecoder::new(reader)), target_dir)
    } else {
        unpack_archive(Archive::new(reader), target_dir)
    }
}

fn unpack_archive<R: Read>(mut archive: Archive<R>, target_dir: &Path) -> io::Result<()> {
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);
    archive.unpack(target_dir)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tar::{Builder, Header};

    use super::*;

    fn append_file<W: std::io::Write>(builder: &mut Builder<W>, path: &str, mode: u32, data: &[u8]) {
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(mode);
        header.set_cksum();
        builder.append_data(&mut header, path, data).unwrap();
    }

    fn write_gz_layer(path: &Path, files: &[(&str, u32, &[u8])]) {
        let encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
        let mut builder = Builder::new(encoder);
        for (name, mode, data) in files {
            append_file(&mut builder, name, *mode, data);
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn write_plain_layer(path: &Path, files: &[(&str, u32, &[u8])]) {
        let mut builder = Builder::new(File::create(path).unwrap());
        for (name, mode, data) in files {
            append_file(&mut builder, name, *mode, data);
        }
        builder.finish().unwrap();
    }

    #[test]
    fn blob_file_name_strips_algorithm() {
        assert_eq!(blob_file_name("sha256:4abcf2066143"), "4abcf2066143");
        assert_eq!(blob_file_name("4abcf2066143"), "4abcf2066143");
    }

    #[test]
    fn materialize_preserves_permissions_and_removes_blob() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let blob = blob_path(&root, "sha256:deadbeef");
        write_gz_layer(&blob, &[("bin/true", 0o755, b"\x7fELF")]);

        materialize(&blob, &root).unwrap();

        let extracted = root.join("bin/true");
        assert_eq!(std::fs::read(&extracted).unwrap(), b"\x7fELF");
        let mode = std::fs::metadata(&extracted).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(!blob.exists());

        let entries: Vec<_> = std::fs::read_dir(&root).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn materialize_accepts_uncompressed_tar() {
        let dir = tempfile::tempdir().unwrap();
        let blob = dir.path().join("layer");
        write_plain_layer(&blob, &[("etc/hostname", 0o644, b"sandbox\n")]);

        let root = dir.path().join("root");
        materialize(&blob, &root).unwrap();

        assert_eq!(std::fs::read_to_string(root.join("etc/hostname")).unwrap(), "sandbox\n");
    }

    #[test]
    fn later_layers_overwrite_earlier_ones() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir(&root).unwrap();

        let apply = |digest: &str, data: &[u8]| {
            let blob = blob_path(&root, digest);
            write_gz_layer(&blob, &[("etc/motd", 0o644, data)]);
            materialize(&blob, &root).unwrap();
        };

        apply("sha256:a", b"from a");
        apply("sha256:b", b"from b");
        assert_eq!(std::fs::read(root.join("etc/motd")).unwrap(), b"from b");

        apply("sha256:a", b"from a");
        assert_eq!(std::fs::read(root.join("etc/motd")).unwrap(), b"from a");
    }

    #[test]
    fn malformed_blob_is_extraction_error() {
        let dir = tempfile::tempdir().unwrap();
        let blob = dir.path().join("garbage");
        std::fs::write(&blob, [0x1f, 0x8b, 0x00, 0x01, 0x02]).unwrap();

        let err = materialize(&blob, dir.path()).unwrap_err();
        assert!(matches!(err, SandboxError::Extraction { .. }));
    }

    #[test]
    fn missing_blob_is_extraction_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = materialize(&dir.path().join("absent"), dir.path()).unwrap_err();
        assert!(matches!(err, SandboxError::Extraction { .. }));
    }
}
