//! Small filesystem helpers shared by every on-disk component: atomic
//! single-file JSON persistence (write-to-temp + rename) and directory
//! creation.

use crate::error::RalphResult;
use serde::Serialize;
use std::path::Path;

/// Serialize `value` as pretty JSON and write it to `path` atomically: the
/// bytes land in a sibling temp file first, then `rename` swaps it into
/// place. A reader never observes a partially-written file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> RalphResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_string_pretty(value)?;
    let tmp_path = tmp_sibling(path);
    std::fs::write(&tmp_path, body)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Read and parse a JSON file.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> RalphResult<T> {
    let body = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&body)?)
}

fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tmp".to_string());
    let pid = std::process::id();
    let nonce: u32 = rand::random();
    path.with_file_name(format!(".{file_name}.{pid}.{nonce:08x}.tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn round_trips_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        let value = Sample {
            a: 7,
            b: "hi".into(),
        };
        write_json_atomic(&path, &value).unwrap();
        let loaded: Sample = read_json(&path).unwrap();
        assert_eq!(loaded, value);

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("sample.json")]);
    }

    #[test]
    fn creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deep/sample.json");
        write_json_atomic(&path, &Sample { a: 1, b: "x".into() }).unwrap();
        assert!(path.exists());
    }
}
