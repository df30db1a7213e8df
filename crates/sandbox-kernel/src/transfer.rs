//! File Transfer Service: moves a single file in or out of a sandbox
//! container by wrapping it in a minimal tar archive, since the Docker
//! Engine API only exposes tar-stream based copy endpoints.

use std::{io::Read, path::Path};

use anyhow::{Context, Result};
use tar::{Archive, Builder, Header};

/// Packs `contents` as a single-entry tar archive named `file_name`, ready
/// to be uploaded via `Docker::upload_to_container`.
pub fn pack_single_file(file_name: &str, contents: &[u8]) -> Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    let mut header = Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, file_name, contents)
        .context("appending file to tar archive")?;
    builder.into_inner().context("finalizing tar archive")
}

/// Unpacks a single named file out of a tar archive byte stream, returning
/// its contents. Used after downloading a file from a container.
pub fn unpack_single_file(archive_bytes: &[u8], file_name: &str) -> Result<Vec<u8>> {
    let mut archive = Archive::new(archive_bytes);
    for entry in archive.entries().context("reading tar entries")? {
        let mut entry = entry.context("reading tar entry")?;
        let path = entry.path().context("reading tar entry path")?;
        if path.file_name().and_then(|n| n.to_str()) == Some(file_name) {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            return Ok(buf);
        }
    }
    anyhow::bail!("file {file_name} not present in archive")
}

/// Packs an entire directory tree into a tar archive, for use as a Docker
/// image build context.
pub fn pack_dir(dir: &Path) -> Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    builder
        .append_dir_all(".", dir)
        .with_context(|| format!("packing build context {}", dir.display()))?;
    builder.into_inner().context("finalizing build context tar archive")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_then_unpack_roundtrips_contents() {
        let archive = pack_single_file("out.txt", b"hello world").unwrap();
        let recovered = unpack_single_file(&archive, "out.txt").unwrap();
        assert_eq!(recovered, b"hello world");
    }

    #[test]
    fn unpack_missing_file_errors() {
        let archive = pack_single_file("out.txt", b"hello world").unwrap();
        assert!(unpack_single_file(&archive, "missing.txt").is_err());
    }
}
