//! Dataset directory layout.
//!
//! One subdirectory per person, named `{reg_no}_{name}_{cohort}_{phone}`,
//! holding that person's sample images.

use crate::types::Profile;
use std::io;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Parse a person directory name. `None` unless it has exactly four
/// underscore-separated fields and a non-empty key.
pub fn parse_person_dir_name(name: &str) -> Option<Profile> {
    let fields: Vec<&str> = name.split('_').collect();
    let [reg_no, person, cohort, phone] = fields.as_slice() else {
        return None;
    };
    if reg_no.is_empty() {
        return None;
    }
    Some(Profile {
        reg_no: reg_no.to_string(),
        name: person.to_string(),
        cohort: cohort.to_string(),
        phone: phone.to_string(),
    })
}

/// Directory name for a profile, the inverse of [`parse_person_dir_name`].
pub fn person_dir_name(profile: &Profile) -> String {
    format!(
        "{}_{}_{}_{}",
        profile.reg_no, profile.name, profile.cohort, profile.phone
    )
}

/// Check that `profile` survives a round trip through [`person_dir_name`].
///
/// The key must be non-empty and must not start with `.`; no field may
/// contain `_` or a path separator.
pub fn validate_profile(profile: &Profile) -> Result<(), String> {
    if profile.reg_no.trim().is_empty() {
        return Err("registration number is empty".into());
    }
    if profile.reg_no.starts_with('.') {
        return Err(format!("registration number {:?} starts with '.'", profile.reg_no));
    }
    let fields = [
        ("reg_no", &profile.reg_no),
        ("name", &profile.name),
        ("cohort", &profile.cohort),
        ("phone", &profile.phone),
    ];
    for (field, value) in fields {
        if let Some(c) = value.chars().find(|c| matches!(*c, '_' | '/' | '\\' | '\0')) {
            return Err(format!("{field} {value:?} contains {c:?}"));
        }
    }
    Ok(())
}

/// A well-formed person directory and its sample images, in name order.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonDir {
    pub profile: Profile,
    pub path: PathBuf,
    pub images: Vec<PathBuf>,
}

/// A subdirectory that was not imported, and why.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SkippedDir {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub people: Vec<PersonDir>,
    pub skipped: Vec<SkippedDir>,
}

/// Walk the immediate subdirectories of `root` in name order.
///
/// Loose files and hidden directories (archive staging leftovers) in `root`
/// are ignored. Directories with a malformed name or without any image are
/// reported as skipped.
pub fn scan(root: &Path) -> io::Result<ScanReport> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();

    let mut report = ScanReport::default();
    for path in dirs {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let Some(profile) = parse_person_dir_name(&name) else {
            tracing::warn!(dir = %name, "skipping directory: expected reg_no_name_cohort_phone");
            report.skipped.push(SkippedDir {
                name,
                reason: "name is not reg_no_name_cohort_phone".into(),
            });
            continue;
        };

        let images = list_images(&path)?;
        if images.is_empty() {
            tracing::warn!(dir = %name, "skipping directory: no images");
            report.skipped.push(SkippedDir {
                name,
                reason: "no images".into(),
            });
            continue;
        }

        report.people.push(PersonDir {
            profile,
            path,
            images,
        });
    }
    Ok(report)
}

fn list_images(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_image(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|ext| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}
