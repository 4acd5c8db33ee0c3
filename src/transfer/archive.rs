use super::TransferError;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use zip::ZipArchive;

/// One file slated for extraction, with its path relative to the
/// archive's top-level `data/` directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub relative_path: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    pub files: Vec<ArchiveEntry>,
    pub total_uncompressed: u64,
}

/// Validate an uploaded archive before anything touches the target: it
/// must be a readable zip, every file must live under a top-level `data/`
/// directory, no entry may escape it, and the uncompressed total must stay
/// under the ceiling.
pub fn validate_archive(path: &Path, max_uncompressed: u64) -> Result<ArchiveSummary, TransferError> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| TransferError::InvalidArchive(format!("not a valid archive: {}", e)))?;

    let mut files = Vec::new();
    let mut total_uncompressed = 0u64;
    let mut saw_data_root = false;

    for index in 0..archive.len() {
        let entry = archive.by_index(index).map_err(|e| {
            TransferError::InvalidArchive(format!("unreadable archive entry: {}", e))
        })?;
        let name = entry.name().to_string();

        if name.contains("..") || name.starts_with('/') {
            return Err(TransferError::InvalidArchive(format!(
                "archive structure invalid: entry '{}' escapes the archive root",
                name
            )));
        }
        if name == "data/" || name.starts_with("data/") {
            saw_data_root = true;
        } else {
            return Err(TransferError::InvalidArchive(format!(
                "archive structure invalid: entry '{}' is outside the top-level data/ directory",
                name
            )));
        }

        if entry.is_file() {
            total_uncompressed += entry.size();
            let relative = name.trim_start_matches("data/").to_string();
            if !relative.is_empty() {
                files.push(ArchiveEntry {
                    relative_path: relative,
                    size: entry.size(),
                });
            }
        }
    }

    if !saw_data_root {
        return Err(TransferError::InvalidArchive(
            "archive structure invalid: missing top-level data/ directory".to_string(),
        ));
    }
    if total_uncompressed > max_uncompressed {
        return Err(TransferError::TooLarge {
            size: total_uncompressed,
            max: max_uncompressed,
        });
    }

    Ok(ArchiveSummary {
        files,
        total_uncompressed,
    })
}

/// Read one file out of the archive. Separate open per call keeps the
/// blocking section short.
pub fn read_archive_file(path: &Path, relative_path: &str) -> Result<Vec<u8>, TransferError> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| TransferError::InvalidArchive(format!("not a valid archive: {}", e)))?;
    let name = format!("data/{}", relative_path);
    let mut entry = archive
        .by_name(&name)
        .map_err(|e| TransferError::InvalidArchive(format!("missing entry '{}': {}", name, e)))?;
    let mut content = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut content)?;
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn build_zip(dir: &TempDir, entries: &[(&str, &[u8])]) -> std::path::PathBuf {
        let path = dir.path().join("upload.zip");
        let mut writer = ZipWriter::new(File::create(&path).unwrap());
        for (name, content) in entries {
            if name.ends_with('/') {
                writer
                    .add_directory(name.trim_end_matches('/'), SimpleFileOptions::default())
                    .unwrap();
            } else {
                writer
                    .start_file(*name, SimpleFileOptions::default())
                    .unwrap();
                writer.write_all(content).unwrap();
            }
        }
        writer.finish().unwrap();
        path
    }

    #[test]
    fn well_formed_archive_passes() {
        let dir = TempDir::new().unwrap();
        let path = build_zip(
            &dir,
            &[
                ("data/", b""),
                ("data/settings.json", b"{}"),
                ("data/chats/log.jsonl", b"line"),
            ],
        );
        let summary = validate_archive(&path, 1024 * 1024).unwrap();
        assert_eq!(summary.files.len(), 2);
        assert_eq!(summary.total_uncompressed, 6);
        assert!(summary
            .files
            .iter()
            .any(|f| f.relative_path == "chats/log.jsonl"));
    }

    #[test]
    fn missing_data_root_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = build_zip(&dir, &[("settings.json", b"{}")]);
        match validate_archive(&path, 1024) {
            Err(TransferError::InvalidArchive(msg)) => {
                assert!(msg.contains("archive structure invalid"));
            }
            other => panic!("expected invalid archive, got {:?}", other),
        }
    }

    #[test]
    fn escaping_entries_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = build_zip(&dir, &[("data/../../etc/passwd", b"root")]);
        assert!(matches!(
            validate_archive(&path, 1024),
            Err(TransferError::InvalidArchive(_))
        ));
    }

    #[test]
    fn oversize_archive_is_rejected() {
        let dir = TempDir::new().unwrap();
        let big = vec![b'x'; 2048];
        let path = build_zip(&dir, &[("data/big.bin", big.as_slice())]);
        assert!(matches!(
            validate_archive(&path, 1024),
            Err(TransferError::TooLarge { .. })
        ));
    }

    #[test]
    fn non_zip_input_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.zip");
        std::fs::write(&path, b"definitely not a zip").unwrap();
        assert!(matches!(
            validate_archive(&path, 1024),
            Err(TransferError::InvalidArchive(_))
        ));
    }

    #[test]
    fn archive_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = build_zip(&dir, &[("data/settings.json", b"{\"a\":1}")]);
        let content = read_archive_file(&path, "settings.json").unwrap();
        assert_eq!(content, b"{\"a\":1}");
    }
}
