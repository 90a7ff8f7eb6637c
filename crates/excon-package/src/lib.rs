//! Content-addressed packaging: bytes in, a single-entry gzip-wrapped tar
//! out, keyed by the SHA-256 digest of the pre-archive bytes.

use std::collections::BTreeMap;
use std::io::Write;

use chrono::Utc;
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};

/// Errors from [`package`].
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    /// `destinationPath` contained a `..` segment.
    #[error("invalid destination path {path:?}: contains a `..` segment")]
    InvalidPath {
        /// The offending path.
        path: String,
    },
    /// Building the tar/gzip stream failed.
    #[error("failed to build archive: {0}")]
    ArchiveBuild(String),
}

/// The packaged artifact: the archive bytes plus the metadata recorded
/// alongside it.
#[derive(Debug, Clone)]
pub struct Package {
    /// Gzip-wrapped tar bytes.
    pub data: Vec<u8>,
    /// The normalised path of the single entry inside the archive.
    pub path: String,
    /// `hex(SHA-256(pre-archive bytes))`.
    pub revision: String,
    /// `created` (RFC 3339), `size` (archive byte length), `contentHash`
    /// (mirrors `revision`).
    pub metadata: BTreeMap<String, String>,
}

/// Normalise a `destinationPath`: `""`/`"."` becomes `"data"`, a leading
/// `/` is stripped, and any `..` segment is rejected.
pub fn normalize_destination_path(raw: &str) -> Result<String, PackageError> {
    let stripped = raw.strip_prefix('/').unwrap_or(raw);

    if stripped.is_empty() || stripped == "." {
        return Ok("data".to_string());
    }

    if stripped.split('/').any(|segment| segment == "..") {
        return Err(PackageError::InvalidPath {
            path: raw.to_string(),
        });
    }

    Ok(stripped.to_string())
}

/// Package `data` under `destination_path` into a content-addressed,
/// gzip-wrapped tar archive.
pub fn package(data: &[u8], destination_path: &str) -> Result<Package, PackageError> {
    let path = normalize_destination_path(destination_path)?;
    let revision = hex::encode(Sha256::digest(data));

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut header = tar::Header::new_gnu();
    header.set_path(&path).map_err(|e| PackageError::ArchiveBuild(e.to_string()))?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    builder
        .append(&header, data)
        .map_err(|e| PackageError::ArchiveBuild(e.to_string()))?;

    let encoder = builder
        .into_inner()
        .map_err(|e| PackageError::ArchiveBuild(e.to_string()))?;
    let archive = encoder
        .finish()
        .map_err(|e| PackageError::ArchiveBuild(e.to_string()))?;

    let mut metadata = BTreeMap::new();
    metadata.insert("created".to_string(), Utc::now().to_rfc3339());
    metadata.insert("size".to_string(), archive.len().to_string());
    metadata.insert("contentHash".to_string(), revision.clone());

    Ok(Package {
        data: archive,
        path,
        revision,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn empty_and_dot_paths_normalize_to_data() {
        assert_eq!(normalize_destination_path("").unwrap(), "data");
        assert_eq!(normalize_destination_path(".").unwrap(), "data");
    }

    #[test]
    fn leading_slash_is_stripped() {
        assert_eq!(normalize_destination_path("/foo/bar").unwrap(), "foo/bar");
    }

    #[test]
    fn dotdot_segment_is_rejected() {
        assert!(normalize_destination_path("../etc/passwd").is_err());
        assert!(normalize_destination_path("foo/../bar").is_err());
    }

    #[test]
    fn revision_is_sha256_of_pre_archive_bytes() {
        let data = br#"["A"]"#;
        let pkg = package(data, "data.json").unwrap();
        let expected = hex::encode(Sha256::digest(data));
        assert_eq!(pkg.revision, expected);
        assert_eq!(pkg.metadata["contentHash"], expected);
    }

    #[test]
    fn archive_contains_single_entry_with_expected_bytes() {
        let data = b"hello world";
        let pkg = package(data, "greeting.txt").unwrap();

        let decoder = flate2::read::GzDecoder::new(&pkg.data[..]);
        let mut archive = tar::Archive::new(decoder);
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();

        assert_eq!(entry.path().unwrap().to_str().unwrap(), "greeting.txt");
        assert_eq!(entry.header().mode().unwrap(), 0o644);

        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, data);

        assert!(entries.next().is_none());
    }

    #[test]
    fn metadata_size_matches_archive_length() {
        let pkg = package(b"abc", "data").unwrap();
        assert_eq!(pkg.metadata["size"], pkg.data.len().to_string());
    }
}
