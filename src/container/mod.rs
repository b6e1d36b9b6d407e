//! Containers: a schema's stores and their backing location.

mod archive;

use crate::error::{Result, StoreError};
use crate::integrity::{self, LinkSite};
use crate::shape::Record;
use crate::store::{ErasedStore, OpenedStore, Store};
use crate::types::StoreStats;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Named byte streams exchanged with a backing location.
pub(crate) type Streams = BTreeMap<String, Vec<u8>>;

/// Stream holding the [`Manifest`].
const MANIFEST_STREAM: &str = "_manifest";

/// Current manifest format version.
const MANIFEST_VERSION: u8 = 1;

fn id_stream(record: &str) -> String {
    format!("{record}.id")
}

fn data_stream(record: &str) -> String {
    format!("{record}.data")
}

/// Declares the stores of a container.
///
/// ```ignore
/// struct Hr;
///
/// impl Schema for Hr {
///     fn declare(catalog: &mut CatalogBuilder) {
///         catalog.set::<Person>("people").set::<Company>("companies");
///     }
/// }
/// ```
pub trait Schema: 'static {
    fn declare(catalog: &mut CatalogBuilder);
}

pub(crate) struct CatalogEntry {
    pub slot: &'static str,
    pub type_id: TypeId,
    pub record: &'static str,
    pub sites: fn(&'static str, TypeId) -> Result<Vec<LinkSite>>,
    pub open: fn(&Catalog, &'static str) -> Result<OpenedStore>,
}

/// Collects store declarations for a [`Schema`].
pub struct CatalogBuilder {
    entries: Vec<CatalogEntry>,
}

impl CatalogBuilder {
    /// Declare a store of `T` under `slot`.
    pub fn set<T: Record>(&mut self, slot: &'static str) -> &mut Self {
        self.entries.push(CatalogEntry {
            slot,
            type_id: TypeId::of::<T>(),
            record: T::NAME,
            sites: integrity::sites_for::<T>,
            open: Store::<T>::open,
        });
        self
    }
}

/// The record types a schema declares, one store each.
pub struct Catalog {
    schema: TypeId,
    schema_name: &'static str,
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    /// Collect and validate the declarations of `S`.
    pub fn of<S: Schema>() -> Result<Self> {
        let mut builder = CatalogBuilder {
            entries: Vec::new(),
        };
        S::declare(&mut builder);

        let mut types = HashSet::new();
        let mut slots = HashSet::new();
        let mut names = HashSet::new();
        for entry in &builder.entries {
            if !types.insert(entry.type_id) || !names.insert(entry.record) {
                return Err(StoreError::config(
                    entry.record,
                    None,
                    "declared more than once in the schema",
                ));
            }
            if !slots.insert(entry.slot) {
                return Err(StoreError::config(
                    entry.record,
                    Some(entry.slot),
                    "slot already used by another store",
                ));
            }
        }

        let full = std::any::type_name::<S>();
        Ok(Self {
            schema: TypeId::of::<S>(),
            schema_name: full.rsplit("::").next().unwrap_or(full),
            entries: builder.entries,
        })
    }

    pub fn schema_name(&self) -> &'static str {
        self.schema_name
    }

    pub(crate) fn schema_id(&self) -> TypeId {
        self.schema
    }

    pub fn contains(&self, type_id: TypeId) -> bool {
        self.entries.iter().any(|e| e.type_id == type_id)
    }

    /// `(slot, record type)` pairs in declaration order.
    pub fn slots(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        self.entries.iter().map(|e| (e.slot, e.record))
    }

    pub(crate) fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }
}

/// Where a container keeps its streams.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Location {
    /// Nothing is read or written.
    Memory,
    /// One `<Type>.id` and `<Type>.data` file per store.
    Directory(PathBuf),
    /// A single archive file holding every stream.
    Archive(PathBuf),
}

/// Container configuration.
#[derive(Clone, Debug)]
pub struct ContainerConfig {
    /// Backing location.
    pub location: Location,

    /// Whether to create the location if it doesn't exist.
    pub create_if_missing: bool,

    /// Wire every record once all stores are loaded, instead of lazily.
    pub wire_on_open: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            location: Location::Directory(PathBuf::from("./store")),
            create_if_missing: true,
            wire_on_open: false,
        }
    }
}

/// Summary written next to the stores on every save.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u8,
    pub schema: String,
    pub entries: Vec<ManifestEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub record: String,
    pub slot: String,
    pub records: u64,
    pub last_id: i64,
}

/// The stores of one open container. Shared with the stores for wiring and
/// integrity scans.
pub(crate) struct ContainerCore {
    catalog: Catalog,
    stores: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    erased: Vec<Arc<dyn ErasedStore>>,
}

impl ContainerCore {
    pub(crate) fn store<T: Record>(&self) -> Result<Arc<Store<T>>> {
        self.stores
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|store| store.downcast::<Store<T>>().ok())
            .ok_or_else(|| {
                StoreError::config(
                    T::NAME,
                    None,
                    format!("no store declared in {}", self.catalog.schema_name()),
                )
            })
    }

    fn load(&self, streams: &Streams) -> Result<()> {
        if let Some(bytes) = streams.get(MANIFEST_STREAM) {
            let manifest: Manifest = rmp_serde::from_slice(bytes)?;
            for entry in &manifest.entries {
                if !self.erased.iter().any(|s| s.record() == entry.record) {
                    warn!(
                        record = %entry.record,
                        records = entry.records,
                        "stored record type is not declared by this schema"
                    );
                }
            }
        }

        for store in &self.erased {
            let mut ids = streams
                .get(&id_stream(store.record()))
                .map(Vec::as_slice)
                .unwrap_or_default();
            let mut data = streams
                .get(&data_stream(store.record()))
                .map(Vec::as_slice)
                .unwrap_or_default();
            store.load_streams(&mut ids, &mut data)?;
        }
        Ok(())
    }

    fn encode(&self) -> Result<Streams> {
        let mut streams = Streams::new();
        let mut entries = Vec::with_capacity(self.erased.len());
        for store in &self.erased {
            let mut ids = Vec::new();
            let mut data = Vec::new();
            let (records, last_id) = store.save_streams(&mut ids, &mut data)?;
            let stats = store.stats();
            entries.push(ManifestEntry {
                record: stats.record.to_string(),
                slot: stats.slot.to_string(),
                records: records as u64,
                last_id,
            });
            streams.insert(id_stream(store.record()), ids);
            streams.insert(data_stream(store.record()), data);
        }

        let manifest = Manifest {
            format_version: MANIFEST_VERSION,
            schema: self.catalog.schema_name().to_string(),
            entries,
        };
        streams.insert(MANIFEST_STREAM.to_string(), rmp_serde::to_vec_named(&manifest)?);
        Ok(streams)
    }

    fn wire_all(&self) -> Result<usize> {
        let mut wired = 0;
        for store in &self.erased {
            wired += store.wire_all()?;
        }
        Ok(wired)
    }

    fn stream_names(&self) -> Vec<String> {
        let mut names = vec![MANIFEST_STREAM.to_string()];
        for store in &self.erased {
            names.push(id_stream(store.record()));
            names.push(data_stream(store.record()));
        }
        names
    }
}

/// An open set of stores for schema `S`.
///
/// Stores are loaded from the location when the container opens and
/// written back, whole, by [`save`](Self::save).
pub struct Container<S: Schema> {
    core: Arc<ContainerCore>,
    config: ContainerConfig,
    _lock_file: Option<File>,
    _schema: PhantomData<fn() -> S>,
}

impl<S: Schema> Container<S> {
    /// Open a container with the given configuration.
    pub fn open(config: ContainerConfig) -> Result<Self> {
        let catalog = Catalog::of::<S>()?;
        let lock_file = Self::prepare(&config)?;

        let mut stores = HashMap::new();
        let mut erased = Vec::new();
        for entry in catalog.entries() {
            let opened = (entry.open)(&catalog, entry.slot)?;
            stores.insert(entry.type_id, opened.any);
            erased.push(opened.erased);
        }

        let core = Arc::new(ContainerCore {
            catalog,
            stores,
            erased,
        });
        for store in &core.erased {
            store.attach_container(Arc::downgrade(&core));
        }

        let streams = match &config.location {
            Location::Memory => Streams::new(),
            Location::Directory(dir) => read_directory(dir, &core.stream_names())?,
            Location::Archive(path) if path.exists() => archive::read_archive(path)?,
            Location::Archive(_) => Streams::new(),
        };
        core.load(&streams)?;

        if config.wire_on_open {
            core.wire_all()?;
        }

        info!(
            schema = core.catalog.schema_name(),
            location = ?config.location,
            stores = core.erased.len(),
            "opened container"
        );

        Ok(Self {
            core,
            config,
            _lock_file: lock_file,
            _schema: PhantomData,
        })
    }

    /// A container that is never persisted.
    pub fn in_memory() -> Result<Self> {
        Self::open(ContainerConfig {
            location: Location::Memory,
            ..Default::default()
        })
    }

    /// Open or create a directory-backed container.
    pub fn open_directory(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(ContainerConfig {
            location: Location::Directory(path.into()),
            ..Default::default()
        })
    }

    /// Open or create an archive-backed container.
    pub fn open_archive(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(ContainerConfig {
            location: Location::Archive(path.into()),
            ..Default::default()
        })
    }

    fn prepare(config: &ContainerConfig) -> Result<Option<File>> {
        match &config.location {
            Location::Memory => Ok(None),
            Location::Directory(dir) => {
                if !dir.exists() {
                    if !config.create_if_missing {
                        return Err(StoreError::NotInitialized);
                    }
                    fs::create_dir_all(dir)?;
                }
                Self::acquire_lock(&dir.join(".lock")).map(Some)
            }
            Location::Archive(path) => {
                if !path.exists() && !config.create_if_missing {
                    return Err(StoreError::NotInitialized);
                }
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                Self::acquire_lock(&sibling(path, ".lock")).map(Some)
            }
        }
    }

    fn acquire_lock(lock_path: &Path) -> Result<File> {
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }

    /// The store declared for `T`.
    pub fn store<T: Record>(&self) -> Result<Arc<Store<T>>> {
        self.core.store::<T>()
    }

    /// Write every store to the location, replacing what was there.
    pub fn save(&self) -> Result<()> {
        if self.config.location == Location::Memory {
            return Ok(());
        }
        let streams = self.core.encode()?;
        match &self.config.location {
            Location::Directory(dir) => write_directory(dir, &streams)?,
            Location::Archive(path) => archive::write_archive(path, &streams)?,
            Location::Memory => {}
        }
        info!(
            schema = self.core.catalog.schema_name(),
            location = ?self.config.location,
            streams = streams.len(),
            "saved container"
        );
        Ok(())
    }

    /// Wire every record of every store. Returns how many were visited.
    pub fn wire_all(&self) -> Result<usize> {
        self.core.wire_all()
    }

    pub fn stats(&self) -> Vec<StoreStats> {
        self.core.erased.iter().map(|s| s.stats()).collect()
    }

    /// What a save right now would record in the manifest.
    pub fn manifest(&self) -> Manifest {
        Manifest {
            format_version: MANIFEST_VERSION,
            schema: self.core.catalog.schema_name().to_string(),
            entries: self
                .stats()
                .into_iter()
                .map(|s| ManifestEntry {
                    record: s.record.to_string(),
                    slot: s.slot.to_string(),
                    records: s.records as u64,
                    last_id: s.last_id,
                })
                .collect(),
        }
    }

    pub fn location(&self) -> &Location {
        &self.config.location
    }

    pub fn catalog(&self) -> &Catalog {
        &self.core.catalog
    }
}

/// `path` with `suffix` appended to its file name.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn read_directory(dir: &Path, names: &[String]) -> Result<Streams> {
    let mut streams = Streams::new();
    for name in names {
        let path = dir.join(name);
        if path.exists() {
            streams.insert(name.clone(), fs::read(path)?);
        }
    }
    Ok(streams)
}

fn write_directory(dir: &Path, streams: &Streams) -> Result<()> {
    for (name, bytes) in streams {
        let path = dir.join(name);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let mut file = File::create(&path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    Ok(())
}
