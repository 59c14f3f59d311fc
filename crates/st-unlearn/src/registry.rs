// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Persisted record of retain/forget accuracies per dataset, method and
//! forgetting set.
//!
//! The whole document is rewritten on every mutation. Stores hand out a
//! version with each read and refuse a write whose base version is stale, so
//! two runs updating the same registry surface a conflict instead of silently
//! dropping one update.

use crate::error::{UnlearnError, UnlearnResult};
use crate::forget::forgetting_set_key;
use fs2::FileExt;
use serde::{Deserialize, Deserializer, Serialize};
use siphasher::sip::SipHasher24;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::hash::Hasher;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tracing::debug;

/// Pseudo-method under which baseline accuracies are stored.
pub const ORIGINAL_MODEL: &str = "original_model";

/// Accepts either the canonical string or a JSON list of class ids.
fn forgetting_set<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Classes(Vec<usize>),
    }
    Ok(match Repr::deserialize(deserializer)? {
        Repr::Text(text) => text,
        Repr::Classes(classes) => forgetting_set_key(&classes),
    })
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BaselineCase {
    #[serde(deserialize_with = "forgetting_set")]
    pub forgetting_set: String,
    pub accuracy_retain: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodCase {
    #[serde(deserialize_with = "forgetting_set")]
    pub forgetting_set: String,
    pub accuracy_retain: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_forget: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodCases {
    pub method_name: String,
    #[serde(default)]
    pub cases: Vec<MethodCase>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetCases {
    #[serde(default)]
    pub original_model: Vec<BaselineCase>,
    #[serde(default)]
    pub unlearning_methods: Vec<MethodCases>,
}

/// Accuracies of a single case. `accuracy_forget` is absent for baselines.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CaseRecord {
    pub accuracy_retain: f64,
    pub accuracy_forget: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetCases>,
}

impl RegistryDocument {
    /// Keys are compared as literal strings: `[1, 0]` and `[0, 1]` are
    /// different cases.
    pub fn case(&self, dataset: &str, method: &str, forgetting_set: &str) -> Option<CaseRecord> {
        let cases = self.datasets.get(dataset)?;
        if method == ORIGINAL_MODEL {
            return cases
                .original_model
                .iter()
                .find(|case| case.forgetting_set == forgetting_set)
                .map(|case| CaseRecord {
                    accuracy_retain: case.accuracy_retain,
                    accuracy_forget: None,
                });
        }
        cases
            .unlearning_methods
            .iter()
            .find(|entry| entry.method_name == method)?
            .cases
            .iter()
            .find(|case| case.forgetting_set == forgetting_set)
            .map(|case| CaseRecord {
                accuracy_retain: case.accuracy_retain,
                accuracy_forget: case.accuracy_forget,
            })
    }

    /// Returns `false` when the dataset is unknown or the key already exists.
    pub fn insert_case(
        &mut self,
        dataset: &str,
        method: &str,
        forgetting_set: &str,
        accuracy_retain: f64,
        accuracy_forget: Option<f64>,
    ) -> bool {
        if self.case(dataset, method, forgetting_set).is_some() {
            return false;
        }
        let Some(cases) = self.datasets.get_mut(dataset) else {
            return false;
        };
        if method == ORIGINAL_MODEL {
            cases.original_model.push(BaselineCase {
                forgetting_set: forgetting_set.to_string(),
                accuracy_retain,
            });
            return true;
        }
        let position = match cases
            .unlearning_methods
            .iter()
            .position(|entry| entry.method_name == method)
        {
            Some(position) => position,
            None => {
                cases.unlearning_methods.push(MethodCases {
                    method_name: method.to_string(),
                    cases: Vec::new(),
                });
                cases.unlearning_methods.len() - 1
            }
        };
        cases.unlearning_methods[position].cases.push(MethodCase {
            forgetting_set: forgetting_set.to_string(),
            accuracy_retain,
            accuracy_forget,
        });
        true
    }

    /// Returns `false` when no case exists for the key.
    pub fn update_case(
        &mut self,
        dataset: &str,
        method: &str,
        forgetting_set: &str,
        accuracy_retain: f64,
        accuracy_forget: Option<f64>,
    ) -> bool {
        let Some(cases) = self.datasets.get_mut(dataset) else {
            return false;
        };
        if method == ORIGINAL_MODEL {
            return match cases
                .original_model
                .iter_mut()
                .find(|case| case.forgetting_set == forgetting_set)
            {
                Some(case) => {
                    case.accuracy_retain = accuracy_retain;
                    true
                }
                None => false,
            };
        }
        let case = cases
            .unlearning_methods
            .iter_mut()
            .find(|entry| entry.method_name == method)
            .and_then(|entry| {
                entry
                    .cases
                    .iter_mut()
                    .find(|case| case.forgetting_set == forgetting_set)
            });
        match case {
            Some(case) => {
                case.accuracy_retain = accuracy_retain;
                if accuracy_forget.is_some() {
                    case.accuracy_forget = accuracy_forget;
                }
                true
            }
            None => false,
        }
    }
}

/// Opaque token identifying the document state a read observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreVersion(Option<u64>);

impl StoreVersion {
    /// Version of a store that holds no document yet.
    pub const ABSENT: StoreVersion = StoreVersion(None);
}

/// Backing storage for the registry document.
pub trait RegistryStore {
    fn load(&self) -> UnlearnResult<(RegistryDocument, StoreVersion)>;

    /// Replaces the whole document when the stored version still equals
    /// `expected`; otherwise fails with [`UnlearnError::RegistryConflict`].
    fn save_if_unchanged(
        &self,
        document: &RegistryDocument,
        expected: StoreVersion,
    ) -> UnlearnResult<StoreVersion>;
}

fn content_version(bytes: &[u8]) -> StoreVersion {
    let mut hasher = SipHasher24::new();
    hasher.write(bytes);
    StoreVersion(Some(hasher.finish()))
}

/// Pretty-printed JSON file, replaced through a uniquely named sibling temp
/// file. Writers serialise on an exclusive lock of `<path>.lock`, held from
/// the version check until the rename.
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Blocks until this process holds the writer lock.
    fn lock(&self) -> UnlearnResult<File> {
        let mut lock_path = self.path.clone().into_os_string();
        lock_path.push(".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(PathBuf::from(lock_path))?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn read_bytes(&self) -> UnlearnResult<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

impl RegistryStore for JsonFileStore {
    fn load(&self) -> UnlearnResult<(RegistryDocument, StoreVersion)> {
        match self.read_bytes()? {
            Some(bytes) => {
                let document = serde_json::from_slice(&bytes)?;
                Ok((document, content_version(&bytes)))
            }
            None => Ok((RegistryDocument::default(), StoreVersion::ABSENT)),
        }
    }

    fn save_if_unchanged(
        &self,
        document: &RegistryDocument,
        expected: StoreVersion,
    ) -> UnlearnResult<StoreVersion> {
        fs::create_dir_all(self.parent_dir())?;
        let lock = self.lock()?;
        let current = match self.read_bytes()? {
            Some(bytes) => content_version(&bytes),
            None => StoreVersion::ABSENT,
        };
        if current != expected {
            return Err(UnlearnError::RegistryConflict {
                path: self.path.display().to_string(),
            });
        }
        let bytes = serde_json::to_vec_pretty(document)?;
        let mut staging = NamedTempFile::new_in(self.parent_dir())?;
        staging.write_all(&bytes)?;
        staging.as_file().sync_all()?;
        staging.persist(&self.path).map_err(|err| err.error)?;
        FileExt::unlock(&lock)?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "case registry written");
        Ok(content_version(&bytes))
    }
}

/// In-process store, mostly for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<(RegistryDocument, u64)>,
}

impl MemoryStore {
    pub fn new(document: RegistryDocument) -> Self {
        Self {
            state: Mutex::new((document, 1)),
        }
    }
}

impl RegistryStore for MemoryStore {
    fn load(&self) -> UnlearnResult<(RegistryDocument, StoreVersion)> {
        let state = self.state.lock().unwrap_or_else(|poison| poison.into_inner());
        Ok((state.0.clone(), StoreVersion(Some(state.1))))
    }

    fn save_if_unchanged(
        &self,
        document: &RegistryDocument,
        expected: StoreVersion,
    ) -> UnlearnResult<StoreVersion> {
        let mut state = self.state.lock().unwrap_or_else(|poison| poison.into_inner());
        if StoreVersion(Some(state.1)) != expected {
            return Err(UnlearnError::RegistryConflict {
                path: "<memory>".to_string(),
            });
        }
        state.0 = document.clone();
        state.1 += 1;
        Ok(StoreVersion(Some(state.1)))
    }
}

/// Read-modify-write access to a [`RegistryStore`].
#[derive(Debug)]
pub struct CaseRegistry<S> {
    store: S,
}

impl<S: RegistryStore> CaseRegistry<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn document(&self) -> UnlearnResult<RegistryDocument> {
        Ok(self.store.load()?.0)
    }

    fn mutate(&self, apply: impl FnOnce(&mut RegistryDocument) -> bool) -> UnlearnResult<bool> {
        let (mut document, version) = self.store.load()?;
        if !apply(&mut document) {
            return Ok(false);
        }
        self.store.save_if_unchanged(&document, version)?;
        Ok(true)
    }

    pub fn get_case(
        &self,
        dataset: &str,
        method: &str,
        forgetting_set: &str,
    ) -> UnlearnResult<Option<CaseRecord>> {
        Ok(self.document()?.case(dataset, method, forgetting_set))
    }

    /// Creates an empty entry for `dataset`. Returns `false` if it exists.
    pub fn ensure_dataset(&self, dataset: &str) -> UnlearnResult<bool> {
        self.mutate(|document| {
            if document.datasets.contains_key(dataset) {
                return false;
            }
            document
                .datasets
                .insert(dataset.to_string(), DatasetCases::default());
            true
        })
    }

    /// Adds a case. Returns `false`, leaving the store untouched, when the key
    /// exists or the dataset is unknown.
    pub fn add_case(
        &self,
        dataset: &str,
        method: &str,
        forgetting_set: &str,
        accuracy_retain: f64,
        accuracy_forget: Option<f64>,
    ) -> UnlearnResult<bool> {
        self.mutate(|document| {
            document.insert_case(dataset, method, forgetting_set, accuracy_retain, accuracy_forget)
        })
    }

    /// Overwrites an existing case. Returns `false` when it does not exist.
    pub fn update_case(
        &self,
        dataset: &str,
        method: &str,
        forgetting_set: &str,
        accuracy_retain: f64,
        accuracy_forget: Option<f64>,
    ) -> UnlearnResult<bool> {
        self.mutate(|document| {
            document.update_case(dataset, method, forgetting_set, accuracy_retain, accuracy_forget)
        })
    }

    /// Adds the case, or updates it when the key is already present.
    pub fn record_case(
        &self,
        dataset: &str,
        method: &str,
        forgetting_set: &str,
        accuracy_retain: f64,
        accuracy_forget: Option<f64>,
    ) -> UnlearnResult<()> {
        self.ensure_dataset(dataset)?;
        if !self.add_case(dataset, method, forgetting_set, accuracy_retain, accuracy_forget)? {
            self.update_case(dataset, method, forgetting_set, accuracy_retain, accuracy_forget)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> CaseRegistry<MemoryStore> {
        let registry = CaseRegistry::new(MemoryStore::default());
        registry.ensure_dataset("cifar10").unwrap();
        registry
    }

    #[test]
    fn add_then_get_round_trips() {
        let registry = seeded();
        assert!(registry
            .add_case("cifar10", ORIGINAL_MODEL, "[0]", 91.0, None)
            .unwrap());
        assert!(registry
            .add_case("cifar10", "scrub", "[0]", 88.0, Some(3.0))
            .unwrap());
        assert_eq!(
            registry.get_case("cifar10", "scrub", "[0]").unwrap(),
            Some(CaseRecord {
                accuracy_retain: 88.0,
                accuracy_forget: Some(3.0)
            })
        );
        assert_eq!(
            registry
                .get_case("cifar10", ORIGINAL_MODEL, "[0]")
                .unwrap()
                .unwrap()
                .accuracy_forget,
            None
        );
    }

    #[test]
    fn keys_are_literal_strings() {
        let registry = seeded();
        registry
            .add_case("cifar10", "icus", "[1, 0]", 80.0, Some(1.0))
            .unwrap();
        assert!(registry.get_case("cifar10", "icus", "[0, 1]").unwrap().is_none());
        assert!(registry
            .add_case("cifar10", "icus", "[0, 1]", 81.0, Some(2.0))
            .unwrap());
    }

    #[test]
    fn update_requires_an_existing_case() {
        let registry = seeded();
        assert!(!registry
            .update_case("cifar10", "badT", "[2]", 50.0, Some(5.0))
            .unwrap());
        registry
            .add_case("cifar10", "badT", "[2]", 70.0, Some(9.0))
            .unwrap();
        assert!(registry
            .update_case("cifar10", "badT", "[2]", 72.0, Some(4.0))
            .unwrap());
        let case = registry.get_case("cifar10", "badT", "[2]").unwrap().unwrap();
        assert_eq!(case.accuracy_retain, 72.0);
        assert_eq!(case.accuracy_forget, Some(4.0));
    }

    #[test]
    fn unknown_datasets_are_not_created_implicitly() {
        let registry = CaseRegistry::new(MemoryStore::default());
        assert!(!registry
            .add_case("mnist", ORIGINAL_MODEL, "[0]", 99.0, None)
            .unwrap());
        assert!(registry.document().unwrap().datasets.is_empty());
    }

    #[test]
    fn stale_versions_are_rejected() {
        let store = MemoryStore::default();
        let (document, version) = store.load().unwrap();
        store.save_if_unchanged(&document, version).unwrap();
        assert!(matches!(
            store.save_if_unchanged(&document, version),
            Err(UnlearnError::RegistryConflict { .. })
        ));
    }

    #[test]
    fn list_keys_are_canonicalised_on_read() {
        let document: RegistryDocument = serde_json::from_str(
            r#"{"datasets": {"cifar10": {"original_model": [{"forgetting_set": [0, 3], "accuracy_retain": 0.9}], "unlearning_methods": []}}}"#,
        )
        .unwrap();
        assert!(document.case("cifar10", ORIGINAL_MODEL, "[0, 3]").is_some());
    }

    #[test]
    fn file_store_rejects_a_stale_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("metrics.json"));
        let (document, version) = store.load().unwrap();
        assert_eq!(version, StoreVersion::ABSENT);
        store.save_if_unchanged(&document, version).unwrap();
        assert!(matches!(
            store.save_if_unchanged(&document, version),
            Err(UnlearnError::RegistryConflict { .. })
        ));
    }

    #[test]
    fn concurrent_file_writers_keep_every_acknowledged_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        CaseRegistry::new(JsonFileStore::new(&path))
            .ensure_dataset("d")
            .unwrap();

        let mut acknowledged = Vec::new();
        for round in 0..10 {
            let handles: Vec<_> = (0..8)
                .map(|writer| {
                    let path = path.clone();
                    std::thread::spawn(move || {
                        let registry = CaseRegistry::new(JsonFileStore::new(path));
                        let key = format!("[{}]", round * 8 + writer);
                        match registry.add_case("d", "neggrad", &key, 50.0, Some(1.0)) {
                            Ok(added) => {
                                assert!(added);
                                Some(key)
                            }
                            Err(UnlearnError::RegistryConflict { .. }) => None,
                            Err(other) => panic!("unexpected registry error: {other}"),
                        }
                    })
                })
                .collect();
            let winners: Vec<String> = handles
                .into_iter()
                .filter_map(|handle| handle.join().unwrap())
                .collect();
            assert!(!winners.is_empty());
            acknowledged.extend(winners);
        }

        let registry = CaseRegistry::new(JsonFileStore::new(&path));
        for key in &acknowledged {
            assert!(registry.get_case("d", "neggrad", key).unwrap().is_some(), "{key} lost");
        }
        let document = registry.document().unwrap();
        assert_eq!(
            document.datasets["d"].unlearning_methods[0].cases.len(),
            acknowledged.len()
        );
    }
}
