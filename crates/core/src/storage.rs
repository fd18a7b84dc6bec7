use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{StationError, StationResult};
use crate::model::StoredFile;
use crate::settings::Settings;

const EXPORTABLE_EXTENSIONS: &[&str] = &["jpg", "jpeg"];

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
    allowed_extensions: Vec<String>,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>, allowed_extensions: &[String]) -> Self {
        Self {
            root: root.into(),
            allowed_extensions: allowed_extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.storage_dir, &settings.allowed_extensions)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self) -> StationResult<()> {
        fs::create_dir_all(&self.root).map_err(|err| StationError::storage(&self.root, err))
    }

    pub fn list_files(&self) -> StationResult<Vec<StoredFile>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|err| walk_error(&self.root, err))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(extension) = lowercase_extension(entry.path()) else {
                continue;
            };
            if !self.allowed_extensions.contains(&extension) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    debug!(path = %entry.path().display(), error = %err, "skipping unreadable file");
                    continue;
                }
            };
            let modified_time = metadata
                .modified()
                .map(|time| {
                    DateTime::<Local>::from(time)
                        .format("%Y-%m-%d %H:%M:%S")
                        .to_string()
                })
                .unwrap_or_default();

            files.push(StoredFile {
                name: entry.file_name().to_string_lossy().to_string(),
                size: metadata.len(),
                modified_time,
                extension: format!(".{extension}"),
            });
        }
        files.sort_by(|a, b| natural_cmp(&a.name, &b.name));
        Ok(files)
    }

    pub fn has_files(&self) -> StationResult<bool> {
        Ok(!self.list_files()?.is_empty())
    }

    pub fn captured_images(&self) -> StationResult<Vec<PathBuf>> {
        let mut images = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.map_err(|err| walk_error(&self.root, err))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let exportable = lowercase_extension(entry.path())
                .is_some_and(|ext| EXPORTABLE_EXTENSIONS.contains(&ext.as_str()));
            if exportable {
                images.push(entry.into_path());
            }
        }
        images.sort_by(|a, b| {
            natural_cmp(&file_name(a), &file_name(b)).then_with(|| a.cmp(b))
        });
        Ok(images)
    }

    pub fn resolve(&self, name: &str) -> StationResult<PathBuf> {
        let trimmed = name.trim();
        if trimmed.is_empty()
            || trimmed == "."
            || trimmed == ".."
            || trimmed.contains('/')
            || trimmed.contains('\\')
            || trimmed.contains('\0')
        {
            return Err(StationError::InvalidFileName {
                name: name.to_string(),
            });
        }
        let path = self.root.join(trimmed);
        if !path.is_file() {
            return Err(StationError::FileNotFound {
                name: trimmed.to_string(),
            });
        }
        Ok(path)
    }

    pub fn delete(&self, name: &str) -> StationResult<()> {
        let path = self.resolve(name)?;
        fs::remove_file(&path).map_err(|err| StationError::storage(&path, err))?;
        debug!(path = %path.display(), "deleted stored file");
        Ok(())
    }
}

fn walk_error(root: &Path, err: walkdir::Error) -> StationError {
    let path = err.path().unwrap_or(root).to_path_buf();
    let source = err
        .into_io_error()
        .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
    StationError::storage(path, source)
}

fn lowercase_extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

// Orders names so embedded numbers compare by value: `scan_2.jpg` sorts before `scan_10.jpg`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let l_digits = take_digits(&mut left);
                let r_digits = take_digits(&mut right);
                let l_trimmed = l_digits.trim_start_matches('0');
                let r_trimmed = r_digits.trim_start_matches('0');
                let ordering = l_trimmed
                    .len()
                    .cmp(&r_trimmed.len())
                    .then_with(|| l_trimmed.cmp(r_trimmed));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(l), Some(r)) => {
                let ordering = l.cmp(&r);
                if ordering != Ordering::Equal {
                    return ordering;
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(ch) = chars.peek().copied().filter(char::is_ascii_digit) {
        digits.push(ch);
        chars.next();
    }
    digits
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;
    use std::fs;

    use tempfile::TempDir;

    use super::{natural_cmp, Storage};
    use crate::error::StationError;
    use crate::settings::Settings;

    fn storage_in(temp: &TempDir) -> Storage {
        let settings = Settings {
            storage_dir: temp.path().to_path_buf(),
            ..Settings::default()
        };
        Storage::from_settings(&settings)
    }

    #[test]
    fn natural_order_compares_numbers_by_value() {
        assert_eq!(natural_cmp("scan_2.jpg", "scan_10.jpg"), Ordering::Less);
        assert_eq!(natural_cmp("scan_10.jpg", "scan_9.jpg"), Ordering::Greater);
        assert_eq!(natural_cmp("a", "a"), Ordering::Equal);
        assert_eq!(natural_cmp("scan_1_back.jpg", "scan_1_front.jpg"), Ordering::Less);
    }

    #[test]
    fn lists_only_allowed_extensions() {
        let temp = TempDir::new().expect("tempdir");
        fs::write(temp.path().join("scan_10.jpg"), b"x").expect("write");
        fs::write(temp.path().join("scan_2.JPG"), b"xy").expect("write");
        fs::write(temp.path().join("notes.txt"), b"ignored").expect("write");
        fs::write(temp.path().join("scan_1.dcm"), b"ignored").expect("write");

        let files = storage_in(&temp).list_files().expect("list");
        let names = files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["scan_2.JPG", "scan_10.jpg"]);
        assert_eq!(files[0].extension, ".jpg");
        assert_eq!(files[0].size, 2);
    }

    #[test]
    fn captured_images_recurse_and_keep_page_order() {
        let temp = TempDir::new().expect("tempdir");
        fs::create_dir(temp.path().join("batch")).expect("mkdir");
        fs::write(temp.path().join("scan_5_10.jpg"), b"x").expect("write");
        fs::write(temp.path().join("scan_5_2.jpg"), b"x").expect("write");
        fs::write(temp.path().join("batch").join("scan_5_3.jpeg"), b"x").expect("write");
        fs::write(temp.path().join("scan_5_1.png"), b"x").expect("write");

        let images = storage_in(&temp).captured_images().expect("images");
        let names = images
            .iter()
            .map(|p| p.file_name().expect("name").to_string_lossy().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["scan_5_2.jpg", "scan_5_3.jpeg", "scan_5_10.jpg"]);
    }

    #[test]
    fn resolve_rejects_traversal_and_reports_missing_files() {
        let temp = TempDir::new().expect("tempdir");
        let storage = storage_in(&temp);
        assert!(matches!(
            storage.resolve("../etc/passwd"),
            Err(StationError::InvalidFileName { .. })
        ));
        assert!(matches!(
            storage.resolve("scan_1.jpg"),
            Err(StationError::FileNotFound { .. })
        ));

        fs::write(temp.path().join("scan_1.jpg"), b"x").expect("write");
        storage.delete("scan_1.jpg").expect("delete");
        assert!(!temp.path().join("scan_1.jpg").exists());
    }
}
