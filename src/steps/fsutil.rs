use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rand::Rng;
use rand::distributions::Alphanumeric;

pub fn ensure_dir(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("directory path is empty");
    }
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))
}

pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("Failed to remove directory: {}", path.display()))
        }
    }
}

pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent()
        && !parent.as_os_str().is_empty()
    {
        ensure_dir(parent)?;
    }
    fs::copy(src, dst).with_context(|| {
        format!("Failed to copy {} to {}", src.display(), dst.display())
    })?;
    Ok(())
}

/// Recursively copies `src` into `dst`, skipping symlinks. Returns the number
/// of files copied.
pub fn copy_dir(src: &Path, dst: &Path) -> Result<u64> {
    ensure_dir(dst)?;
    let mut copied = 0;
    let entries = fs::read_dir(src)
        .with_context(|| format!("Failed to read directory: {}", src.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to read entry in {}", src.display()))?;
        let file_type = entry
            .file_type()
            .with_context(|| format!("Failed to inspect {}", entry.path().display()))?;
        let target = dst.join(entry.file_name());
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            copied += copy_dir(&entry.path(), &target)?;
        } else {
            copy_file(&entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Archives usually wrap their payload in one top-level folder; descend into
/// it when that is the only entry.
pub fn single_root(dir: &Path) -> Result<PathBuf> {
    let entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read extracted directory: {}", dir.display()))?
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("Failed to list extracted directory: {}", dir.display()))?;
    if let [only] = entries.as_slice()
        && only.path().is_dir()
    {
        return Ok(only.path());
    }
    Ok(dir.to_path_buf())
}

pub fn replace_first(contents: &str, from: &str, to: &str) -> Option<String> {
    let idx = contents.find(from)?;
    let mut replaced = String::with_capacity(contents.len() + to.len());
    replaced.push_str(&contents[..idx]);
    replaced.push_str(to);
    replaced.push_str(&contents[idx + from.len()..]);
    Some(replaced)
}

/// Sets every `key = value` / `key=value` line to `key = value`, appending the
/// setting when no line matches. Commented lines are left alone.
pub fn set_ini_value(contents: &str, key: &str, value: &str) -> String {
    let spaced = format!("{key} =");
    let tight = format!("{key}=");
    let mut replaced = false;
    let mut lines: Vec<String> = contents
        .split('\n')
        .map(|line| {
            let trimmed = line.trim();
            if trimmed.starts_with(&spaced) || trimmed.starts_with(&tight) {
                replaced = true;
                format!("{key} = {value}")
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(format!("{key} = {value}"));
    }
    lines.join("\n")
}

/// Uncomments `;extension=<name>` lines, appending the directive for any
/// extension that has no line at all.
pub fn enable_extensions(ini: &str, extensions: &[&str]) -> String {
    let mut ini = ini.to_string();
    for ext in extensions {
        let directive = format!("extension={ext}");
        if let Some(updated) = replace_first(&ini, &format!(";{directive}"), &directive) {
            ini = updated;
        } else if !ini.contains(&directive) {
            if !ini.ends_with('\n') {
                ini.push('\n');
            }
            ini.push_str(&directive);
            ini.push('\n');
        }
    }
    ini
}

pub fn random_secret(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub fn program_files_roots() -> Vec<PathBuf> {
    ["ProgramFiles", "ProgramFiles(x86)"]
        .into_iter()
        .filter_map(std::env::var_os)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .collect()
}

/// Finds `<root>/MariaDB*/bin` holding `mysql.exe`, newest directory name first.
pub fn find_mariadb_bin_dir(roots: &[PathBuf]) -> Option<PathBuf> {
    let mut candidates = Vec::new();
    for root in roots {
        let pattern = root.join("MariaDB*").join("bin").join("mysql.exe");
        let Ok(matches) = glob::glob(&pattern.to_string_lossy()) else {
            continue;
        };
        candidates.extend(matches.flatten());
    }
    candidates.sort();
    candidates
        .pop()
        .and_then(|mysql| mysql.parent().map(Path::to_path_buf))
}

pub fn find_mariadb_config(bin_dir: &Path) -> Option<PathBuf> {
    let install_dir = bin_dir.parent()?;
    let mut candidates = vec![
        install_dir.join("data").join("my.ini"),
        install_dir.join("my.ini"),
        install_dir.join("my-default.ini"),
    ];
    if let Some(outer) = install_dir.parent() {
        candidates.insert(0, outer.join("data").join("my.ini"));
    }
    candidates.into_iter().find(|candidate| candidate.is_file())
}
