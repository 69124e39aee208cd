//! Variant reference data.
//!
//! Each virus variant is measured on two replicate plates. The `variants`
//! table maps a variant name to the ids of those plates, either with the role
//! character (`S01`) or as bare digits (`01`).

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::core::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VariantLookupError {
    #[error("cannot find variant from plate name {0}")]
    NoMatch(String),
    #[error("unknown variant '{0}'")]
    UnknownVariant(String),
    #[error("variant '{variant}' has an unreadable plate id '{plate_id}'")]
    BadPlateId { variant: String, plate_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VariantMappingError {
    #[error("plate id '{0}' does not contain a plate number")]
    InvalidPlateId(String),
    #[error("variant '{variant}' uses plate number {number} twice")]
    SamePlateNumber { variant: String, number: u8 },
    #[error("plate number {number} already belongs to variant '{existing}'")]
    PlateNumberTaken { number: u8, existing: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VariantMapping {
    pub variant_name: String,
    pub plate_id_1: String,
    pub plate_id_2: String,
}

impl VariantMapping {
    pub fn new(
        variant_name: impl Into<String>,
        plate_id_1: impl Into<String>,
        plate_id_2: impl Into<String>,
    ) -> Self {
        Self {
            variant_name: variant_name.into(),
            plate_id_1: plate_id_1.into(),
            plate_id_2: plate_id_2.into(),
        }
    }

    /// Sorted plate numbers of both replicates.
    pub fn plate_numbers(&self) -> Result<[u8; 2], VariantMappingError> {
        let a = plate_id_number(&self.plate_id_1)?;
        let b = plate_id_number(&self.plate_id_2)?;
        if a == b {
            return Err(VariantMappingError::SamePlateNumber {
                variant: self.variant_name.clone(),
                number: a,
            });
        }
        Ok(if a < b { [a, b] } else { [b, a] })
    }
}

/// `"S03"` and `"03"` both give 3.
pub fn plate_id_number(plate_id: &str) -> Result<u8, VariantMappingError> {
    let digits: String = plate_id.chars().filter(|c| c.is_ascii_digit()).collect();
    digits
        .parse()
        .map_err(|_| VariantMappingError::InvalidPlateId(plate_id.to_string()))
}

/// Import file layout for `variants import`.
#[derive(Debug, Deserialize)]
struct VariantFile {
    #[serde(default)]
    variant: Vec<VariantEntry>,
}

#[derive(Debug, Deserialize)]
struct VariantEntry {
    name: String,
    plate_ids: [String; 2],
}

pub struct VariantRegistry {
    db: Arc<Mutex<Connection>>,
    retry: RetryPolicy,
}

impl VariantRegistry {
    pub async fn open<P: AsRef<Path>>(db_path: P, retry: RetryPolicy) -> Result<Self> {
        let db_path = db_path.as_ref();
        crate::core::config::ensure_parent_dir(db_path).await?;
        let db = Connection::open(db_path)
            .with_context(|| format!("opening variant table in {}", db_path.display()))?;
        Self::from_connection(db, retry)
    }

    pub fn from_connection(db: Connection, retry: RetryPolicy) -> Result<Self> {
        db.busy_timeout(std::time::Duration::from_secs(5))?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS variants (
                variant_name TEXT PRIMARY KEY,
                plate_id_1 TEXT NOT NULL,
                plate_id_2 TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            retry,
        })
    }

    /// Variant measured on the plate called `plate_name`.
    ///
    /// The three character prefix is normalised to the assay role (`T01` and
    /// `A01` are looked up as `S01`). When no row uses that id the lookup is
    /// repeated with the bare digits (`01`).
    pub async fn resolve_variant(&self, plate_name: &str, is_titration: bool) -> Result<String> {
        let prefix = match plate_name.get(..3) {
            Some(p) => p,
            None => return Err(VariantLookupError::NoMatch(plate_name.to_string()).into()),
        };
        let bare: String = prefix.chars().skip(1).collect();
        let prefix = if is_titration {
            prefix.replace('T', "S")
        } else if !prefix.starts_with('S') {
            format!("S{}", bare)
        } else {
            prefix.to_string()
        };

        if let Some(variant) = self.variant_for_plate_id(&prefix).await? {
            return Ok(variant);
        }
        debug!("No variant for '{}', retrying with '{}'", prefix, bare);
        if let Some(variant) = self.variant_for_plate_id(&bare).await? {
            return Ok(variant);
        }
        Err(VariantLookupError::NoMatch(plate_name.to_string()).into())
    }

    async fn variant_for_plate_id(&self, plate_id: &str) -> Result<Option<String>> {
        let this = self;
        self.retry
            .run("variants.lookup", move || async move {
                let db = this.db.lock().await;
                let variant = db
                    .query_row(
                        "SELECT variant_name FROM variants
                         WHERE plate_id_1 = ?1 OR plate_id_2 = ?1
                         ORDER BY variant_name LIMIT 1",
                        params![plate_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(variant)
            })
            .await
    }

    /// Sorted plate numbers of the two replicate plates of a variant.
    pub async fn variant_plate_numbers(&self, variant_name: &str) -> Result<[u8; 2]> {
        let mapping = self
            .get(variant_name)
            .await?
            .ok_or_else(|| VariantLookupError::UnknownVariant(variant_name.to_string()))?;
        mapping.plate_numbers().map_err(|e| {
            let plate_id = match e {
                VariantMappingError::InvalidPlateId(id) => id,
                _ => format!("{}/{}", mapping.plate_id_1, mapping.plate_id_2),
            };
            VariantLookupError::BadPlateId {
                variant: variant_name.to_string(),
                plate_id,
            }
            .into()
        })
    }

    pub async fn get(&self, variant_name: &str) -> Result<Option<VariantMapping>> {
        let this = self;
        self.retry
            .run("variants.get", move || async move {
                let db = this.db.lock().await;
                let mapping = db
                    .query_row(
                        "SELECT variant_name, plate_id_1, plate_id_2 FROM variants
                         WHERE variant_name = ?1",
                        params![variant_name],
                        |row| {
                            Ok(VariantMapping {
                                variant_name: row.get(0)?,
                                plate_id_1: row.get(1)?,
                                plate_id_2: row.get(2)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(mapping)
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<VariantMapping>> {
        let this = self;
        self.retry
            .run("variants.list", move || async move {
                let db = this.db.lock().await;
                let mut stmt = db.prepare(
                    "SELECT variant_name, plate_id_1, plate_id_2 FROM variants
                     ORDER BY variant_name",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(VariantMapping {
                        variant_name: row.get(0)?,
                        plate_id_1: row.get(1)?,
                        plate_id_2: row.get(2)?,
                    })
                })?;
                let mut mappings = Vec::new();
                for row in rows {
                    mappings.push(row?);
                }
                Ok(mappings)
            })
            .await
    }

    /// Insert or replace one mapping.
    pub async fn add(&self, mapping: VariantMapping) -> Result<()> {
        self.add_all(vec![mapping]).await.map(|_| ())
    }

    /// Insert or replace a batch of mappings in one transaction. The whole
    /// batch is rejected if any plate number would belong to two variants.
    pub async fn add_all(&self, mappings: Vec<VariantMapping>) -> Result<usize> {
        let mut owners: HashMap<u8, String> = HashMap::new();
        for existing in self.list().await? {
            if mappings.iter().any(|m| m.variant_name == existing.variant_name) {
                continue;
            }
            // Rows with unreadable ids predate validation; they cannot clash.
            if let Ok(numbers) = existing.plate_numbers() {
                for n in numbers {
                    owners.insert(n, existing.variant_name.clone());
                }
            }
        }
        for mapping in &mappings {
            for n in mapping.plate_numbers()? {
                if let Some(existing) = owners.get(&n)
                    && existing != &mapping.variant_name
                {
                    return Err(VariantMappingError::PlateNumberTaken {
                        number: n,
                        existing: existing.clone(),
                    }
                    .into());
                }
                owners.insert(n, mapping.variant_name.clone());
            }
        }

        let this = self;
        let batch = &mappings;
        self.retry
            .run("variants.add", move || async move {
                let mut db = this.db.lock().await;
                let tx = db.transaction()?;
                {
                    let mut insert = tx.prepare(
                        "INSERT INTO variants (variant_name, plate_id_1, plate_id_2)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT(variant_name) DO UPDATE SET
                            plate_id_1 = excluded.plate_id_1,
                            plate_id_2 = excluded.plate_id_2",
                    )?;
                    for m in batch {
                        insert.execute(params![m.variant_name, m.plate_id_1, m.plate_id_2])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        info!("Stored {} variant mapping(s)", mappings.len());
        Ok(mappings.len())
    }

    /// Load mappings from a TOML file of `[[variant]]` tables.
    pub async fn import<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let mappings = parse_variant_file(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        self.add_all(mappings).await
    }
}

pub fn parse_variant_file(content: &str) -> Result<Vec<VariantMapping>> {
    let file: VariantFile = toml::from_str(content)?;
    Ok(file
        .variant
        .into_iter()
        .map(|e| {
            let [a, b] = e.plate_ids;
            VariantMapping::new(e.name, a, b)
        })
        .collect())
}

#[cfg(test)]
pub(crate) async fn test_registry(mappings: &[(&str, &str, &str)]) -> VariantRegistry {
    let registry =
        VariantRegistry::from_connection(Connection::open_in_memory().unwrap(), RetryPolicy::none())
            .unwrap();
    let batch = mappings
        .iter()
        .map(|(name, a, b)| VariantMapping::new(*name, *a, *b))
        .collect();
    registry.add_all(batch).await.unwrap();
    registry
}
