//! Upload algorithms - direct copy, checksum-differential copy, atomic
//! archive copy. All three ride on [`SshClient::send_file`].

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use walkdir::WalkDir;

use super::client::SshClient;
use crate::error::{Error, Result};

/// Remote prefix for archive uploads; digest-discriminated so concurrent
/// invocations cannot collide
const ARCHIVE_PREFIX: &str = "/tmp/fleetrun-";

const FILE_MODE: u32 = 0o644;

/// Result of a differential directory upload
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub uploaded: usize,
    pub skipped: usize,
}

/// Result of a differential single-file upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Uploaded,
    Skipped,
}

impl SshClient {
    /// Direct copy: no checksums, no verification. Returns the number of
    /// files sent. Directories are recursed depth-first, creating each
    /// remote subdirectory before copying its files.
    pub fn copy(&self, local: &Path, remote: &str) -> Result<usize> {
        if local.is_dir() {
            self.ensure_remote_dir(remote)?;
            let mut files = 0;
            for entry in WalkDir::new(local).min_depth(1) {
                let entry = entry.map_err(std::io::Error::from)?;
                let rel = match entry.path().strip_prefix(local) {
                    Ok(rel) => rel,
                    Err(_) => continue,
                };
                let remote_path = remote_join(remote, rel);
                if entry.file_type().is_dir() {
                    self.ensure_remote_dir(&remote_path)?;
                } else {
                    let content = std::fs::read(entry.path())?;
                    self.send_file(&content, &remote_path, FILE_MODE)?;
                    files += 1;
                }
            }
            Ok(files)
        } else {
            self.ensure_parent_dir(remote)?;
            let content = std::fs::read(local)?;
            self.send_file(&content, remote, FILE_MODE)?;
            Ok(1)
        }
    }

    /// Differential upload of a single file.
    ///
    /// Skips the transfer entirely when the remote digest already matches;
    /// otherwise uploads and re-verifies.
    pub fn sync_file(&self, local: &Path, remote: &str) -> Result<SyncOutcome> {
        let content = std::fs::read(local)?;
        let local_digest = sha256_hex(&content);

        if let Ok(remote_digest) = self.remote_checksum(remote) {
            if remote_digest == local_digest {
                if self.verbose() {
                    log::info!("[{}] up to date: {}", self.host(), remote);
                }
                return Ok(SyncOutcome::Skipped);
            }
        }

        self.upload_verified(&content, &local_digest, remote)?;
        Ok(SyncOutcome::Uploaded)
    }

    /// Differential upload of a directory.
    ///
    /// Fetches every remote file digest with a single `find` command (an
    /// empty map when the directory does not exist yet), then walks the
    /// local tree depth-first, creating remote directories as encountered
    /// and uploading only files whose digest is absent or differs.
    pub fn sync_dir(&self, local: &Path, remote: &str) -> Result<SyncStats> {
        self.ensure_remote_dir(remote)?;
        let remote_digests = self.remote_dir_checksums(remote);

        let mut stats = SyncStats::default();
        for entry in WalkDir::new(local).min_depth(1) {
            let entry = entry.map_err(std::io::Error::from)?;
            let rel = match entry.path().strip_prefix(local) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let remote_path = remote_join(remote, rel);

            if entry.file_type().is_dir() {
                self.ensure_remote_dir(&remote_path)?;
                continue;
            }

            let content = std::fs::read(entry.path())?;
            let local_digest = sha256_hex(&content);
            let rel_key = rel.to_string_lossy();
            if remote_digests.get(rel_key.as_ref()) == Some(&local_digest) {
                stats.skipped += 1;
                if self.verbose() {
                    log::info!("[{}] skip (unchanged): {}", self.host(), rel_key);
                }
                continue;
            }

            if self.verbose() {
                log::info!("[{}] upload: {}", self.host(), rel_key);
            }
            self.upload_verified(&content, &local_digest, &remote_path)?;
            stats.uploaded += 1;
        }

        Ok(stats)
    }

    /// Atomic archive upload: gzip tarball built in memory, shipped to a
    /// digest-named temp path, then extracted and removed in one remote
    /// command. Returns the archive size in bytes.
    ///
    /// The replace is best-effort atomic: extraction failures abort the
    /// `&&` chain before cleanup, but a crash mid-extraction can leave a
    /// partially replaced tree.
    pub fn upload_archive(&self, local: &Path, remote: &str) -> Result<u64> {
        let archive = build_archive(local)?;
        let digest = sha256_hex(&archive);
        let temp_path = archive_temp_path(&digest);

        if self.verbose() {
            log::info!(
                "[{}] archive {} bytes, sha256 {}",
                self.host(),
                archive.len(),
                digest
            );
        }

        self.send_file(&archive, &temp_path, FILE_MODE)?;

        let extract = format!(
            "mkdir -p {dest} && tar -xzf {tmp} -C {dest} && rm -f {tmp}",
            dest = remote,
            tmp = temp_path
        );
        self.output(&extract).map_err(|e| match e {
            Error::RemoteExec { stderr, .. } => Error::Transfer {
                path: remote.to_string(),
                detail: stderr,
            },
            other => other,
        })?;

        Ok(archive.len() as u64)
    }

    /// Upload pre-read content and verify the remote digest afterwards
    fn upload_verified(&self, content: &[u8], local_digest: &str, remote: &str) -> Result<()> {
        self.ensure_parent_dir(remote)?;
        self.send_file(content, remote, FILE_MODE)?;

        let remote_digest = self.remote_checksum(remote)?;
        if remote_digest != local_digest {
            return Err(Error::Integrity {
                path: remote.to_string(),
                local: local_digest.to_string(),
                remote: remote_digest,
            });
        }
        Ok(())
    }

    /// Digest of a single remote file, via `sha256sum` with a `shasum`
    /// fallback
    fn remote_checksum(&self, remote: &str) -> Result<String> {
        let cmd = format!(
            "sha256sum {p} 2>/dev/null || shasum -a 256 {p} 2>/dev/null",
            p = remote
        );
        let output = self.output(&cmd)?;
        output
            .split_whitespace()
            .next()
            .map(str::to_string)
            .ok_or_else(|| Error::Transfer {
                path: remote.to_string(),
                detail: format!("unexpected checksum output: {}", output.trim()),
            })
    }

    /// Digests of every file below a remote directory, keyed by relative
    /// path. One remote command; an empty map when the directory does not
    /// exist.
    fn remote_dir_checksums(&self, remote_dir: &str) -> HashMap<String, String> {
        let cmd = format!(
            "find {d} -type f -exec sha256sum {{}} \\; 2>/dev/null || \
             find {d} -type f -exec shasum -a 256 {{}} \\; 2>/dev/null",
            d = remote_dir
        );
        match self.output(&cmd) {
            Ok(listing) => parse_checksum_listing(&listing, remote_dir),
            Err(_) => {
                log::debug!("[{}] no existing files under {}", self.host(), remote_dir);
                HashMap::new()
            }
        }
    }

    fn ensure_remote_dir(&self, dir: &str) -> Result<()> {
        self.output(&format!("mkdir -p {}", dir)).map(|_| ())
    }

    fn ensure_parent_dir(&self, remote_path: &str) -> Result<()> {
        if let Some((dir, _)) = remote_path.rsplit_once('/') {
            if !dir.is_empty() {
                self.ensure_remote_dir(dir)?;
            }
        }
        Ok(())
    }
}

/// Hex SHA-256 of a byte slice
pub fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Hex SHA-256 of a local file
pub fn file_sha256(path: &Path) -> Result<String> {
    let content = std::fs::read(path)?;
    Ok(sha256_hex(&content))
}

/// Temp path for an archive upload, discriminated by the first 8 digest
/// hex chars
pub fn archive_temp_path(digest: &str) -> String {
    format!("{}{}.tar.gz", ARCHIVE_PREFIX, &digest[..8])
}

/// Build a gzip tarball of a file or directory entirely in memory.
///
/// File mode and mtime come from the local metadata; directory entries
/// are included; the root itself is not an entry.
pub fn build_archive(local: &Path) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    if local.is_dir() {
        for entry in WalkDir::new(local).min_depth(1) {
            let entry = entry.map_err(std::io::Error::from)?;
            let rel = match entry.path().strip_prefix(local) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            if entry.file_type().is_dir() {
                builder.append_dir(rel, entry.path())?;
            } else {
                builder.append_path_with_name(entry.path(), rel)?;
            }
        }
    } else {
        let name = local.file_name().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name")
        })?;
        builder.append_path_with_name(local, Path::new(name))?;
    }

    let encoder = builder.into_inner()?;
    let archive = encoder.finish()?;
    Ok(archive)
}

/// Parse `digest  /abs/path` lines into a relative-path → digest map
pub(crate) fn parse_checksum_listing(listing: &str, remote_dir: &str) -> HashMap<String, String> {
    let prefix = format!("{}/", remote_dir.trim_end_matches('/'));
    let mut digests = HashMap::new();
    for line in listing.lines() {
        let mut fields = line.split_whitespace();
        let (Some(digest), Some(path)) = (fields.next(), fields.next()) else {
            continue;
        };
        let rel = path.strip_prefix(&prefix).unwrap_or(path);
        digests.insert(rel.to_string(), digest.to_string());
    }
    digests
}

fn remote_join(remote: &str, rel: &Path) -> String {
    format!("{}/{}", remote.trim_end_matches('/'), rel.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::fs;

    #[test]
    fn sha256_hex_matches_known_digest() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn file_digest_matches_content_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, b"hello fleet").unwrap();
        assert_eq!(file_sha256(&path).unwrap(), sha256_hex(b"hello fleet"));
    }

    #[test]
    fn archive_temp_path_uses_first_eight_hex_chars() {
        let digest = "deadbeefcafe0123456789";
        assert_eq!(archive_temp_path(digest), "/tmp/fleetrun-deadbeef.tar.gz");
    }

    #[test]
    fn checksum_listing_maps_relative_paths() {
        let listing = "\
abc123  /srv/app/index.html
def456  /srv/app/static/main.js
not-a-valid-line
";
        let digests = parse_checksum_listing(listing, "/srv/app/");
        assert_eq!(digests.len(), 2);
        assert_eq!(digests["index.html"], "abc123");
        assert_eq!(digests["static/main.js"], "def456");
    }

    #[test]
    fn archive_contains_nested_entries_with_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a");
        fs::create_dir(&nested).unwrap();
        let file = nested.join("b.txt");
        fs::write(&file, b"payload").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o755)).unwrap();

        let bytes = build_archive(dir.path()).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(&bytes[..]));

        let mut names = Vec::new();
        let mut file_mode = None;
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let path = entry
                .path()
                .unwrap()
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string();
            if path == "a/b.txt" {
                file_mode = Some(entry.header().mode().unwrap() & 0o777);
            }
            names.push(path);
        }

        // Root is not an entry; the directory and the file are
        names.sort();
        assert_eq!(names, vec!["a", "a/b.txt"]);
        assert_eq!(file_mode, Some(0o755));
    }

    #[test]
    fn archive_of_single_file_uses_basename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.bin");
        fs::write(&path, b"binary").unwrap();

        let bytes = build_archive(&path).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(&bytes[..]));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["app.bin"]);
    }
}
