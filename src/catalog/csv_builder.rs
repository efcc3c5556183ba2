use std::path::PathBuf;

use serde::Deserialize;

use crate::catalog::{CatalogBuilder, Tag, TagAddress};
use crate::core::{DataType, Error, Result};
use crate::protocol::registers::{RegisterFormat, RegisterKind};

/// Builds the catalog from a CSV sheet with the header
/// `name,description,unit,datatype,frequency,device,address,register,format,scale,unit_id`.
///
/// Rows with a `register` column (`holding`/`input`) are Modbus tags; the
/// others keep `address` as a protocol symbol. Only `name`, `datatype`,
/// `frequency` and `device` are mandatory.
#[derive(Debug, Clone)]
pub struct CsvCatalogBuilder {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct CatalogRecord {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    unit: String,
    datatype: String,
    frequency: u64,
    device: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    register: String,
    #[serde(default)]
    format: String,
    #[serde(default)]
    scale: Option<f64>,
    #[serde(default)]
    unit_id: Option<u8>,
}

impl CsvCatalogBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CatalogBuilder for CsvCatalogBuilder {
    fn build(&self) -> Result<Vec<Tag>> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(&self.path)?;
        let mut tags = Vec::new();
        for (line, record) in reader.deserialize::<CatalogRecord>().enumerate() {
            let record = record?;
            let tag = to_tag(record)
                .map_err(|err| Error::Catalog(format!("{} row {}: {err}", self.path.display(), line + 2)))?;
            tags.push(tag);
        }
        Ok(tags)
    }
}

fn to_tag(record: CatalogRecord) -> Result<Tag> {
    let datatype: DataType = record.datatype.parse()?;
    let address = if record.register.is_empty() {
        let symbol = if record.address.is_empty() {
            record.name.clone()
        } else {
            record.address
        };
        TagAddress::Symbol { symbol }
    } else {
        let kind: RegisterKind = record.register.parse()?;
        let format = if record.format.is_empty() {
            RegisterFormat::default_for(datatype).ok_or_else(|| {
                Error::Catalog(format!("{datatype} tags need an explicit register format"))
            })?
        } else {
            record.format.parse()?
        };
        let address: u16 = record
            .address
            .parse()
            .map_err(|_| Error::Catalog(format!("invalid register address {:?}", record.address)))?;
        TagAddress::Modbus {
            address,
            kind,
            format,
            scale: record.scale.unwrap_or(1.0),
            unit_id: record.unit_id.unwrap_or(1),
        }
    };

    Ok(Tag {
        name: record.name,
        description: record.description,
        unit: record.unit,
        datatype,
        frequency_secs: record.frequency,
        device: record.device,
        address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SHEET: &str = "\
name,description,unit,datatype,frequency,device,address,register,format,scale,unit_id
P_MAIN,main power,kW,REAL,5,plc,100,holding,,0.1,
E_TOTAL,energy,kWh,DINT,60,plc,102,input,uint32,,3
STATE,state word,,STRING(40),10,ads,MAIN.state,,,,
";

    #[test]
    fn parses_modbus_and_symbolic_rows() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tags.csv");
        std::fs::write(&path, SHEET).expect("write sheet");

        let tags = CsvCatalogBuilder::new(&path).build().expect("build");
        assert_eq!(tags.len(), 3);

        assert_eq!(tags[0].datatype, DataType::Float);
        assert_eq!(
            tags[0].address,
            TagAddress::Modbus {
                address: 100,
                kind: RegisterKind::Holding,
                format: RegisterFormat::Float32,
                scale: 0.1,
                unit_id: 1,
            }
        );
        assert!(matches!(
            tags[1].address,
            TagAddress::Modbus {
                kind: RegisterKind::Input,
                format: RegisterFormat::Uint32,
                unit_id: 3,
                ..
            }
        ));
        assert_eq!(
            tags[2].address,
            TagAddress::Symbol {
                symbol: "MAIN.state".to_string()
            }
        );
    }

    #[test]
    fn unknown_datatype_is_a_catalog_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tags.csv");
        std::fs::write(
            &path,
            "name,datatype,frequency,device\nX,complex,5,plc\n",
        )
        .expect("write sheet");
        let err = CsvCatalogBuilder::new(&path).build().unwrap_err();
        assert!(matches!(err, Error::Catalog(msg) if msg.contains("row 2")));
    }
}
