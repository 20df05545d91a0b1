//! Resource catalog
//!
//! One record per (host, file_hash) pair: the same content hash listed by
//! several hosts means the same logical file replicated at several
//! locations, and consumers fold those rows into one item carrying the
//! union of hosting peers. Merge upserts run inside a sled transaction so
//! the check-then-write sequence is serialized, and they never touch
//! counters or status on conflict.

use serde::{Deserialize, Serialize};
use sled::transaction::ConflictableTransactionError;
use sled::Transactional;
use std::collections::HashMap;
use tracing::warn;

use super::{now_epoch_secs, StoreError};
use crate::crypto::is_valid_hash;
use crate::net::host::normalize_host;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Verified,
    Pending,
    Unlisted,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: u64,
    pub host: String,
    pub file_hash: String,
    /// On-disk reference name; may differ from the content hash.
    pub hash_ref: String,
    pub size_bytes: u64,
    pub storage_type: StorageType,
    pub status: ResourceStatus,
    pub mime: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub copy_count: u64,
    pub view_count: u64,
    pub report_count: u64,
    pub download_count: u64,
    pub created_at: u64,
}

/// Fields a catalog entry arrives with, before storage classification.
#[derive(Debug, Clone)]
pub struct NewResource {
    pub host: String,
    pub file_hash: String,
    pub hash_ref: String,
    pub size_bytes: u64,
    pub mime: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(u64),
    Updated(u64),
    Unchanged(u64),
}

/// One logical file, folded across every host that lists it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogItem {
    #[serde(default)]
    pub file_hash: String,
    #[serde(default)]
    pub hash_ref: Option<String>,
    #[serde(rename = "type", default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CatalogPage {
    pub items: Vec<CatalogItem>,
    pub more_data: bool,
    /// Highest row id in the page; pass back as the next cursor.
    pub index: u64,
}

pub struct ResourceCatalog {
    db: sled::Db,
    by_key: sled::Tree,
    by_id: sled::Tree,
    self_host: String,
}

const PAGE_LIMIT_MAX: usize = 500;

impl ResourceCatalog {
    pub fn open(db: &sled::Db, self_host: &str) -> Result<Self, StoreError> {
        let self_host =
            normalize_host(self_host).ok_or_else(|| StoreError::InvalidHost(self_host.into()))?;
        Ok(Self {
            db: db.clone(),
            by_key: db.open_tree("resources")?,
            by_id: db.open_tree("resource_ids")?,
            self_host,
        })
    }

    /// Insert or refresh a catalog entry keyed by (normalized host,
    /// file_hash). On conflict only the display fields (`mime`, `title`)
    /// change, and only when `update_display` is set; counters and status
    /// are never touched.
    pub fn upsert(
        &self,
        new: NewResource,
        update_display: bool,
    ) -> Result<UpsertOutcome, StoreError> {
        let host =
            normalize_host(&new.host).ok_or_else(|| StoreError::InvalidHost(new.host.clone()))?;
        let file_hash = new.file_hash.to_ascii_lowercase();
        if !is_valid_hash(&file_hash) {
            return Err(StoreError::InvalidHash(new.file_hash));
        }

        let key = record_key(&host, &file_hash);
        let storage_type = if host == self.self_host {
            StorageType::Local
        } else {
            StorageType::Remote
        };
        let id = self.db.generate_id()?;
        let record = ResourceRecord {
            id,
            host,
            file_hash,
            hash_ref: new.hash_ref,
            size_bytes: new.size_bytes,
            storage_type,
            status: ResourceStatus::Unlisted,
            mime: new.mime,
            title: new.title,
            description: None,
            tags: None,
            copy_count: 1,
            view_count: 0,
            report_count: 0,
            download_count: 0,
            created_at: now_epoch_secs(),
        };

        let outcome = (&self.by_key, &self.by_id)
            .transaction(|(by_key, by_id)| {
                match by_key.get(key.as_slice())? {
                    Some(raw) => {
                        let mut existing = decode(&raw)
                            .map_err(ConflictableTransactionError::Abort)?;
                        let changed = update_display
                            && (existing.mime != record.mime || existing.title != record.title);
                        if changed {
                            existing.mime = record.mime.clone();
                            existing.title = record.title.clone();
                            by_key.insert(key.as_slice(), encode(&existing)?)?;
                            Ok(UpsertOutcome::Updated(existing.id))
                        } else {
                            Ok(UpsertOutcome::Unchanged(existing.id))
                        }
                    }
                    None => {
                        by_key.insert(key.as_slice(), encode(&record)?)?;
                        by_id.insert(&record.id.to_be_bytes(), key.as_slice())?;
                        Ok(UpsertOutcome::Inserted(record.id))
                    }
                }
            })
            .map_err(|err: sled::transaction::TransactionError<StoreError>| match err {
                sled::transaction::TransactionError::Abort(e) => e,
                sled::transaction::TransactionError::Storage(e) => StoreError::Database(e),
            })?;
        Ok(outcome)
    }

    pub fn get(&self, host: &str, file_hash: &str) -> Result<Option<ResourceRecord>, StoreError> {
        let host = normalize_host(host).ok_or_else(|| StoreError::InvalidHost(host.into()))?;
        let key = record_key(&host, &file_hash.to_ascii_lowercase());
        self.by_key.get(key)?.map(|raw| decode(&raw)).transpose()
    }

    pub fn get_by_id(&self, id: u64) -> Result<Option<ResourceRecord>, StoreError> {
        let Some(key) = self.by_id.get(id.to_be_bytes())? else {
            return Ok(None);
        };
        self.by_key.get(key)?.map(|raw| decode(&raw)).transpose()
    }

    /// Distinct hosts listing a content hash, any status.
    pub fn hosts_for_hash(&self, file_hash: &str) -> Result<Vec<String>, StoreError> {
        let wanted = file_hash.to_ascii_lowercase();
        let mut hosts = Vec::new();
        for record in self.iter_all()? {
            if record.file_hash == wanted && !hosts.contains(&record.host) {
                hosts.push(record.host);
            }
        }
        Ok(hosts)
    }

    /// Verified entries with id greater than `after_id`, folded into
    /// logical items. Fetches one extra row to detect whether more data
    /// remains past the page.
    pub fn page(&self, after_id: u64, limit: usize) -> Result<CatalogPage, StoreError> {
        let limit = limit.clamp(1, PAGE_LIMIT_MAX);
        let fetch_limit = limit + 1;

        let mut rows = Vec::new();
        let start = after_id.saturating_add(1).to_be_bytes();
        for item in self.by_id.range(start.as_slice()..) {
            let (_, key) = item?;
            let Some(raw) = self.by_key.get(&key)? else {
                continue;
            };
            let record = decode(&raw)?;
            if record.status != ResourceStatus::Verified {
                continue;
            }
            rows.push(record);
            if rows.len() == fetch_limit {
                break;
            }
        }

        let more_data = rows.len() == fetch_limit;
        if more_data {
            rows.pop();
        }
        let index = rows.iter().map(|r| r.id).max().unwrap_or(after_id);

        Ok(CatalogPage {
            items: fold_rows(rows),
            more_data,
            index,
        })
    }

    /// One logical item for a hash, from verified or unlisted rows.
    pub fn lookup_hash(&self, file_hash: &str) -> Result<Option<CatalogItem>, StoreError> {
        let wanted = file_hash.to_ascii_lowercase();
        let mut rows: Vec<ResourceRecord> = self
            .iter_all()?
            .into_iter()
            .filter(|r| r.file_hash == wanted)
            .filter(|r| {
                matches!(
                    r.status,
                    ResourceStatus::Verified | ResourceStatus::Unlisted
                )
            })
            .collect();
        if rows.is_empty() {
            return Ok(None);
        }
        rows.sort_by(|a, b| a.host.cmp(&b.host));
        Ok(fold_rows(rows).into_iter().next())
    }

    /// Status transitions are policy-driven, never part of a merge.
    pub fn set_status(&self, id: u64, status: ResourceStatus) -> Result<bool, StoreError> {
        let Some(mut record) = self.get_by_id(id)? else {
            return Ok(false);
        };
        record.status = status;
        let key = record_key(&record.host, &record.file_hash);
        self.by_key.insert(key, encode_plain(&record)?)?;
        Ok(true)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        Ok(self.by_key.len())
    }

    fn iter_all(&self) -> Result<Vec<ResourceRecord>, StoreError> {
        let mut records = Vec::new();
        for item in self.by_key.iter() {
            let (_, raw) = item?;
            match decode(&raw) {
                Ok(record) => records.push(record),
                Err(err) => warn!("skipping undecodable resource record: {err}"),
            }
        }
        Ok(records)
    }
}

fn record_key(host: &str, file_hash: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(host.len() + 1 + file_hash.len());
    key.extend_from_slice(host.as_bytes());
    key.push(0);
    key.extend_from_slice(file_hash.as_bytes());
    key
}

/// Group rows by file_hash: first row wins the display fields, later rows
/// fill gaps and contribute their host to the union.
fn fold_rows(rows: Vec<ResourceRecord>) -> Vec<CatalogItem> {
    let mut order: Vec<String> = Vec::new();
    let mut folded: HashMap<String, CatalogItem> = HashMap::new();

    for row in rows {
        let item = folded.entry(row.file_hash.clone()).or_insert_with(|| {
            order.push(row.file_hash.clone());
            CatalogItem {
                file_hash: row.file_hash.clone(),
                hash_ref: None,
                mime: None,
                title: None,
                description: None,
                size_bytes: None,
                hosts: Vec::new(),
            }
        });
        if item.hash_ref.is_none() {
            item.hash_ref = Some(row.hash_ref);
        }
        if item.mime.is_none() {
            item.mime = Some(row.mime);
        }
        if item.title.is_none() {
            item.title = row.title;
        }
        if item.description.is_none() {
            item.description = row.description;
        }
        if item.size_bytes.is_none() {
            item.size_bytes = Some(row.size_bytes);
        }
        if !item.hosts.contains(&row.host) {
            item.hosts.push(row.host);
        }
    }

    order
        .into_iter()
        .filter_map(|hash| folded.remove(&hash))
        .collect()
}

fn encode(record: &ResourceRecord) -> Result<Vec<u8>, ConflictableTransactionError<StoreError>> {
    encode_plain(record).map_err(ConflictableTransactionError::Abort)
}

fn encode_plain(record: &ResourceRecord) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(record).map_err(|err| StoreError::Codec(err.to_string()))
}

fn decode(raw: &[u8]) -> Result<ResourceRecord, StoreError> {
    serde_json::from_slice(raw).map_err(|err| StoreError::Codec(err.to_string()))
}
