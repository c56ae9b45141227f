use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};

/// SHA256 of the file at `path` as lowercase hex, read in chunks.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let read = reader
            .read(&mut buffer)
            .with_context(|| format!("Failed to read file for hashing: {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Writes `<digest>  <path>` (sha256sum format) into `output`.
pub fn write_sha256(path: &Path, output: &Path) -> Result<String> {
    let digest = compute_sha256(path)?;
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create digest directory: {}", parent.display()))?;
    }
    let mut file = File::create(output)
        .with_context(|| format!("Failed to create digest file: {}", output.display()))?;
    writeln!(file, "{}  {}", digest, path.display()).with_context(|| {
        format!(
            "Failed to write digest for '{}' into '{}'",
            path.display(),
            output.display()
        )
    })?;
    Ok(digest)
}

pub fn verify_sha256(path: &Path, expected: &str) -> Result<String> {
    let actual = compute_sha256(path)?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        bail!(
            "Checksum mismatch for {}: expected {}, found {}",
            path.display(),
            expected.trim(),
            actual
        );
    }
    Ok(actual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn compute_sha256_matches_known_vector() {
        let temp = tempdir().unwrap();
        let file_path = temp.path().join("abc.bin");
        std::fs::write(&file_path, b"abc").unwrap();

        let digest = compute_sha256(&file_path).unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn write_sha256_uses_sha256sum_layout() {
        let temp = tempdir().unwrap();
        let file_path = temp.path().join("empty.bin");
        std::fs::write(&file_path, b"").unwrap();
        let output = temp.path().join("out").join("empty.sha256");

        let digest = write_sha256(&file_path, &output).unwrap();
        let written = std::fs::read_to_string(&output).unwrap();
        assert_eq!(
            written,
            format!("{digest}  {}\n", file_path.display())
        );
        assert!(digest.starts_with("e3b0c442"));
    }

    #[test]
    fn verify_rejects_mismatch() {
        let temp = tempdir().unwrap();
        let file_path = temp.path().join("abc.bin");
        std::fs::write(&file_path, b"abc").unwrap();

        assert!(verify_sha256(&file_path, "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD").is_ok());
        let err = verify_sha256(&file_path, "00").unwrap_err();
        assert!(err.to_string().contains("Checksum mismatch"));
    }
}
