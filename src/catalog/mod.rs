//! Tag catalog.
//!
//! The catalog is produced by a [`CatalogBuilder`] and cached as a JSON
//! artifact. It is regenerated only when the artifact is missing or a rebuild
//! is requested, then stays read-only for the life of the process.

mod csv_builder;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::fs::write_atomic;
use crate::core::{DataType, Error, Result};
use crate::protocol::registers::{RegisterFormat, RegisterKind, RegisterRow};
use crate::store::layout::validate_component;

pub use csv_builder::CsvCatalogBuilder;

/// Protocol-specific location of a tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum TagAddress {
    Modbus {
        address: u16,
        kind: RegisterKind,
        format: RegisterFormat,
        scale: f64,
        unit_id: u8,
    },
    /// Symbolic address for protocols that read by name (node ids, ADS
    /// symbols, JSON paths).
    Symbol { symbol: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub unit: String,
    pub datatype: DataType,
    pub frequency_secs: u64,
    pub device: String,
    pub address: TagAddress,
}

impl Tag {
    /// Register row for block-protocol devices; `None` for symbolic tags.
    pub fn register_row(&self, id: usize) -> Option<RegisterRow> {
        match &self.address {
            TagAddress::Modbus {
                address,
                kind,
                format,
                scale,
                unit_id,
            } => Some(RegisterRow {
                id,
                address: *address,
                kind: *kind,
                format: *format,
                scale: *scale,
                unit_id: *unit_id,
            }),
            TagAddress::Symbol { .. } => None,
        }
    }
}

/// Produces the catalog rows. Implementations typically parse a vendor
/// export or a hand-maintained sheet.
pub trait CatalogBuilder {
    fn build(&self) -> Result<Vec<Tag>>;
}

#[derive(Debug, Clone, Default)]
pub struct TagCatalog {
    tags: Vec<Tag>,
    by_name: HashMap<String, usize>,
}

impl TagCatalog {
    pub fn new(tags: Vec<Tag>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(tags.len());
        for (idx, tag) in tags.iter().enumerate() {
            validate_component("tag", &tag.name)
                .map_err(|err| Error::Catalog(format!("tag {:?}: {err}", tag.name)))?;
            if tag.device.is_empty() {
                return Err(Error::Catalog(format!("tag {:?} has no device", tag.name)));
            }
            if tag.frequency_secs == 0 {
                return Err(Error::Catalog(format!(
                    "tag {:?} has a zero sampling frequency",
                    tag.name
                )));
            }
            if let TagAddress::Modbus { scale, .. } = tag.address {
                if !scale.is_finite() || scale == 0.0 {
                    return Err(Error::Catalog(format!(
                        "tag {:?} has an unusable scale {scale}",
                        tag.name
                    )));
                }
            }
            if by_name.insert(tag.name.clone(), idx).is_some() {
                return Err(Error::Catalog(format!("duplicate tag {:?}", tag.name)));
            }
        }
        Ok(Self { tags, by_name })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let tags: Vec<Tag> = serde_json::from_slice(&bytes)
            .map_err(|err| Error::Catalog(format!("{}: {err}", path.display())))?;
        Self::new(tags)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.tags)?;
        write_atomic(path, &bytes)
    }

    /// Load the cached artifact, building and caching it first when it is
    /// missing or `regenerate` is set.
    pub fn load_or_build(
        path: &Path,
        builder: &dyn CatalogBuilder,
        regenerate: bool,
    ) -> Result<Self> {
        if regenerate || !path.exists() {
            let catalog = Self::new(builder.build()?)?;
            catalog.save(path)?;
            log::info!(
                "catalog regenerated: {} tags cached at {}",
                catalog.len(),
                path.display()
            );
            return Ok(catalog);
        }
        Self::load(path)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn get(&self, name: &str) -> Option<&Tag> {
        self.by_name.get(name).map(|idx| &self.tags[*idx])
    }

    /// Look up a tag that must exist.
    pub fn require(&self, name: &str) -> Result<&Tag> {
        self.get(name)
            .ok_or_else(|| Error::Catalog(format!("unknown tag {name:?}")))
    }

    pub fn devices(&self) -> BTreeSet<String> {
        self.tags.iter().map(|tag| tag.device.clone()).collect()
    }

    /// Every (device, frequency) pair present in the catalog.
    pub fn job_keys(&self) -> BTreeSet<(String, u64)> {
        self.tags
            .iter()
            .map(|tag| (tag.device.clone(), tag.frequency_secs))
            .collect()
    }

    pub fn tags_for(&self, device: &str, frequency_secs: u64) -> Vec<Tag> {
        self.tags
            .iter()
            .filter(|tag| tag.device == device && tag.frequency_secs == frequency_secs)
            .cloned()
            .collect()
    }
}
