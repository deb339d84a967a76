//! The group catalogue: the index of known groups, their domains,
//! forwarders, and the path to their record blob, persisted as
//! `groups.yaml`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, RwLock};

use crate::error::Error;
use crate::normalize::{is_default_group_domain, normalize_identifier, DEFAULT_GROUP_NAME};
use crate::record::{Forwarder, RecordStore};

const CATALOGUE_FILE: &str = "groups.yaml";

/// A single group's catalogue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    #[serde(skip)]
    pub id: String,
    pub name: String,
    pub file: String,
    #[serde(rename = "numberOfRecords")]
    pub num_records: usize,
    pub domains: Vec<String>,
    pub forwarders: Vec<Forwarder>,
}

impl Group {
    fn new(id: &str, domains: Vec<String>, forwarders: Vec<Forwarder>) -> Self {
        Group {
            id: id.to_string(),
            name: id.to_string(),
            file: format!("gob-{id}.dat"),
            num_records: 0,
            domains,
            forwarders,
        }
    }
}

/// On-disk shape of `groups.yaml`: a map from identifier to catalogue
/// entry.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogueFile {
    groups: HashMap<String, Group>,
}

/// The catalogue of groups and the entry point for persisting them.
///
/// Concurrency: a reader/writer lock guards the in-memory catalogue
/// map; a plain async mutex serializes on-disk store operations
/// (reads and writes of per-group blobs) since the critical section
/// spans file I/O. All mutating operations that touch both take the
/// catalogue lock first, to prevent deadlock.
pub struct GroupIndex {
    data_dir: PathBuf,
    catalogue: RwLock<HashMap<String, Group>>,
    store_mutex: AsyncMutex<()>,
}

impl GroupIndex {
    fn catalogue_path(&self) -> PathBuf {
        self.data_dir.join(CATALOGUE_FILE)
    }

    fn blob_path(&self, group: &Group) -> PathBuf {
        self.data_dir.join(&group.file)
    }

    /// Read the catalogue from `groups.yaml` in `data_dir`. If the
    /// file is absent, create a `default` group with the given
    /// forwarders, persist its empty store, and write the catalogue.
    ///
    /// # Errors
    ///
    /// If the data directory, catalogue file, or default group's blob
    /// cannot be read or written.
    pub async fn load(data_dir: PathBuf, default_forwarders: Vec<Forwarder>) -> Result<Self, Error> {
        tokio::fs::create_dir_all(&data_dir).await?;
        let index = GroupIndex {
            data_dir,
            catalogue: RwLock::new(HashMap::new()),
            store_mutex: AsyncMutex::new(()),
        };

        let path = index.catalogue_path();
        if tokio::fs::try_exists(&path).await? {
            index.reload().await?;
        } else {
            let group = Group::new(DEFAULT_GROUP_NAME, Vec::new(), default_forwarders);
            let store = RecordStore::new(DEFAULT_GROUP_NAME, group.domains.clone(), group.forwarders.clone());
            store.save_to_file(&index.blob_path(&group)).await?;
            index
                .catalogue
                .write()
                .await
                .insert(group.id.clone(), group);
            index.save_meta().await?;
        }

        Ok(index)
    }

    /// Rebuild the in-memory catalogue from disk without touching any
    /// per-group caches.
    ///
    /// # Errors
    ///
    /// If the catalogue file cannot be read or parsed.
    pub async fn reload(&self) -> Result<(), Error> {
        let path = self.catalogue_path();
        let text = tokio::fs::read_to_string(&path).await?;
        let mut parsed: CatalogueFile = serde_yaml::from_str(&text)?;
        for (id, group) in &mut parsed.groups {
            group.id = id.clone();
        }
        *self.catalogue.write().await = parsed.groups;
        Ok(())
    }

    /// Marshal the catalogue to disk.
    ///
    /// # Errors
    ///
    /// If the catalogue cannot be serialised or written.
    pub async fn save_meta(&self) -> Result<(), Error> {
        let groups = self.catalogue.read().await.clone();
        let file = CatalogueFile { groups };
        let text = serde_yaml::to_string(&file)?;
        let path = self.catalogue_path();
        let tmp_path = path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp_path, text).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    pub async fn list_groups(&self) -> Vec<Group> {
        self.catalogue.read().await.values().cloned().collect()
    }

    pub async fn get_by_id(&self, id: &str) -> Option<Group> {
        self.catalogue.read().await.get(id).cloned()
    }

    pub async fn get_by_name(&self, name: &str) -> Option<Group> {
        self.catalogue
            .read()
            .await
            .values()
            .find(|g| g.name == name)
            .cloned()
    }

    /// Every group whose domain list contains `domain` (case
    /// insensitive), plus the `default` group iff `domain` is a
    /// trivial sentinel.
    pub async fn get_by_domain(&self, domain: &str) -> Vec<Group> {
        let catalogue = self.catalogue.read().await;
        let is_default = is_default_group_domain(domain);
        catalogue
            .values()
            .filter(|g| {
                (is_default && g.id == DEFAULT_GROUP_NAME)
                    || g.domains.iter().any(|d| d.eq_ignore_ascii_case(domain))
            })
            .cloned()
            .collect()
    }

    /// Create a new group. The identifier is derived from `name` by
    /// normalization.
    ///
    /// # Errors
    ///
    /// `Error::AlreadyExists` if the normalized identifier is taken,
    /// or an I/O error if the new store/catalogue cannot be written.
    pub async fn create(
        &self,
        name: &str,
        domains: Vec<String>,
        forwarders: Vec<Forwarder>,
    ) -> Result<(Group, RecordStore), Error> {
        let id = normalize_identifier(name);
        let mut catalogue = self.catalogue.write().await;
        if catalogue.contains_key(&id) {
            return Err(Error::AlreadyExists(id));
        }

        let mut group = Group::new(&id, domains, forwarders);
        group.name = name.to_string();
        let store = RecordStore::new(id.clone(), group.domains.clone(), group.forwarders.clone());

        {
            let _guard = self.store_mutex.lock().await;
            store.save_to_file(&self.blob_path(&group)).await?;
        }

        catalogue.insert(id.clone(), group.clone());
        drop(catalogue);
        self.save_meta().await?;

        Ok((group, store))
    }

    /// Write a store's blob and persist its (possibly updated) group
    /// metadata, such as the record count.
    ///
    /// # Errors
    ///
    /// If the blob cannot be written.
    pub async fn save_group(&self, store: &RecordStore, mut group: Group) -> Result<Group, Error> {
        group.num_records = store.record_count();

        {
            let _guard = self.store_mutex.lock().await;
            store.save_to_file(&self.blob_path(&group)).await?;
        }

        self.catalogue
            .write()
            .await
            .insert(group.id.clone(), group.clone());
        self.save_meta().await?;

        Ok(group)
    }

    /// Load a group's record store from its blob file.
    ///
    /// # Errors
    ///
    /// If the blob cannot be read or decoded.
    pub async fn load_store(&self, group: &Group) -> Result<RecordStore, Error> {
        let path = self.blob_path(group);
        let _guard = self.store_mutex.lock().await;
        let mut store = RecordStore::load_from_file(&path).await?;
        store.apply_metadata(group.domains.clone(), group.forwarders.clone());
        Ok(store)
    }

    /// Delete a group: removes its blob, removes its catalogue entry,
    /// flushes the catalogue. The `default` group may not be deleted.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` if no such group exists, or an I/O error if
    /// the blob cannot be removed.
    pub async fn delete(&self, id: &str) -> Result<bool, Error> {
        if id == DEFAULT_GROUP_NAME {
            return Err(Error::NotFound(id.to_string()));
        }

        let mut catalogue = self.catalogue.write().await;
        let Some(group) = catalogue.get(id).cloned() else {
            return Err(Error::NotFound(id.to_string()));
        };

        {
            let _guard = self.store_mutex.lock().await;
            let path = self.blob_path(&group);
            if tokio::fs::try_exists(&path).await? {
                tokio::fs::remove_file(&path).await?;
            }
        }

        catalogue.remove(id);
        drop(catalogue);
        self.save_meta().await?;

        Ok(true)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}
