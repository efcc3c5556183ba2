use std::path::{Path, PathBuf};

use time::Date;

use crate::core::{format_day, parse_day, Error, Result};

/// Paths of the day-partitioned archive: `<root>/<YYYY-MM-DD>/<tag>`.
#[derive(Debug, Clone)]
pub struct DayLayout {
    root: PathBuf,
}

impl DayLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn day_dir(&self, day: &str) -> Result<PathBuf> {
        validate_date(day)?;
        Ok(self.root.join(day))
    }

    pub fn tag_path(&self, day: &str, tag: &str) -> Result<PathBuf> {
        validate_component("tag", tag)?;
        Ok(self.day_dir(day)?.join(tag))
    }

    pub fn tag_path_for(&self, day: Date, tag: &str) -> Result<PathBuf> {
        self.tag_path(&format_day(day), tag)
    }

    /// Day directories present under the root, oldest first. Entries that
    /// are not dates are ignored.
    pub fn days(&self) -> Result<Vec<Date>> {
        let mut days = Vec::new();
        if !self.root.exists() {
            return Ok(days);
        }
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Ok(day) = parse_day(name) {
                days.push(day);
            }
        }
        days.sort_unstable();
        Ok(days)
    }

    /// Tag files of one day, sorted. Leftover `.tmp` files are skipped.
    pub fn tags_of(&self, day: Date) -> Result<Vec<String>> {
        let dir = self.day_dir(&format_day(day))?;
        let mut tags = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(tags),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(".tmp") {
                    tags.push(name.to_string());
                }
            }
        }
        tags.sort_unstable();
        Ok(tags)
    }
}

pub fn validate_component(field: &'static str, value: &str) -> Result<()> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.contains('/')
        || value.contains('\\')
        || value.contains('\0')
    {
        return Err(Error::InvalidComponent {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

fn validate_date(value: &str) -> Result<()> {
    if value.len() != 10 {
        return Err(Error::InvalidComponent {
            field: "day",
            value: value.to_string(),
        });
    }
    parse_day(value).map(|_| ())
}
