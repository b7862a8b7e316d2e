use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Result, WardenError};

/// Verdict for one reported access. Ordered weakest to strongest, so the
/// strongest contribution is `max` and a least-permissive aggregate is `min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchStrength {
    NoMatch,
    MatchesButNotCacheable,
    MatchesAndCacheable,
}

impl MatchStrength {
    /// Aggregate verdict over several accesses to the same path: the least
    /// permissive constituent wins.
    pub fn aggregate(verdicts: impl IntoIterator<Item = MatchStrength>) -> MatchStrength {
        verdicts
            .into_iter()
            .min()
            .unwrap_or(MatchStrength::NoMatch)
    }
}

// Process-wide compiled-pattern cache. Never cleared; entries are small and
// bounded by the policy vocabulary.
static REGEX_CACHE: Lazy<Mutex<HashMap<String, Arc<Regex>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn compile_cached(pattern: &str) -> Result<Arc<Regex>> {
    let mut cache = REGEX_CACHE.lock().unwrap();
    if let Some(re) = cache.get(pattern) {
        return Ok(re.clone());
    }
    let re = RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map(Arc::new)
        .map_err(|e| WardenError::config(format!("bad allow-list pattern {:?}: {}", pattern, e)))?;
    cache.insert(pattern.to_string(), re.clone());
    Ok(re)
}

pub struct AllowListEntry {
    pub name: String,
    pub pattern: String,
    pub cacheable: bool,
    regex: Arc<Regex>,
}

impl AllowListEntry {
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        cacheable: bool,
    ) -> Result<Arc<Self>> {
        let pattern = pattern.into();
        let regex = compile_cached(&pattern)?;
        Ok(Arc::new(Self {
            name: name.into(),
            pattern,
            cacheable,
            regex,
        }))
    }

    fn strength_for(&self, path: &str) -> MatchStrength {
        if self.regex.is_match(path) {
            if self.cacheable {
                MatchStrength::MatchesAndCacheable
            } else {
                MatchStrength::MatchesButNotCacheable
            }
        } else {
            MatchStrength::NoMatch
        }
    }
}

/// Two-tier allow-list: entries keyed by the task's value symbol and by the
/// accessing process image (full path or executable basename). A
/// module-scoped list adds candidates, it shadows nothing.
pub struct AllowList {
    image_case_insensitive: bool,
    by_symbol: HashMap<String, Vec<Arc<AllowListEntry>>>,
    by_image: HashMap<String, Vec<Arc<AllowListEntry>>>,
    modules: BTreeMap<u64, AllowList>,
}

impl AllowList {
    pub fn new(image_case_insensitive: bool) -> Self {
        Self {
            image_case_insensitive,
            by_symbol: HashMap::new(),
            by_image: HashMap::new(),
            modules: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty() && self.by_image.is_empty() && self.modules.is_empty()
    }

    fn image_key(&self, key: &str) -> String {
        if self.image_case_insensitive {
            key.to_lowercase()
        } else {
            key.to_string()
        }
    }

    pub fn add_symbol_entry(&mut self, symbol: impl Into<String>, entry: Arc<AllowListEntry>) {
        self.by_symbol.entry(symbol.into()).or_default().push(entry);
    }

    pub fn add_image_entry(&mut self, image: impl Into<String>, entry: Arc<AllowListEntry>) {
        let key = self.image_key(&image.into());
        self.by_image.entry(key).or_default().push(entry);
    }

    pub fn add_module(&mut self, module_id: u64, list: AllowList) {
        self.modules.insert(module_id, list);
    }

    /// Classify one reported path. The strongest contribution across all
    /// candidate entries wins; the default is `NoMatch`.
    pub fn matches(
        &self,
        value_symbol: &str,
        module_id: Option<u64>,
        image: &Path,
        reported_path: &str,
    ) -> MatchStrength {
        let mut verdict = self.matches_local(value_symbol, image, reported_path);
        if let Some(module) = module_id.and_then(|id| self.modules.get(&id)) {
            verdict = verdict.max(module.matches_local(value_symbol, image, reported_path));
        }
        verdict
    }

    fn matches_local(&self, value_symbol: &str, image: &Path, reported_path: &str) -> MatchStrength {
        let mut verdict = MatchStrength::NoMatch;
        let mut consider = |entries: Option<&Vec<Arc<AllowListEntry>>>| {
            for entry in entries.into_iter().flatten() {
                let strength = entry.strength_for(reported_path);
                if strength > verdict {
                    trace!(entry = %entry.name, ?strength, path = reported_path, "allow-list hit");
                    verdict = strength;
                }
            }
        };

        consider(self.by_symbol.get(value_symbol));
        consider(self.by_image.get(&self.image_key(&image.to_string_lossy())));
        if let Some(basename) = image.file_name() {
            consider(self.by_image.get(&self.image_key(&basename.to_string_lossy())));
        }
        verdict
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(&self.to_blob())
            .map_err(|e| WardenError::config(format!("allow-list serialization failed: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let blob: AllowListBlob = bincode::deserialize(bytes)
            .map_err(|e| WardenError::config(format!("allow-list deserialization failed: {}", e)))?;
        Self::from_blob(blob)
    }

    fn to_blob(&self) -> AllowListBlob {
        fn entries(index: &HashMap<String, Vec<Arc<AllowListEntry>>>) -> Vec<EntryBlob> {
            let mut keys: Vec<&String> = index.keys().collect();
            keys.sort();
            let mut out = Vec::new();
            for key in keys {
                for entry in &index[key] {
                    out.push(EntryBlob {
                        key: key.clone(),
                        name: entry.name.clone(),
                        pattern: entry.pattern.clone(),
                        cacheable: entry.cacheable,
                    });
                }
            }
            out
        }

        AllowListBlob {
            image_case_insensitive: self.image_case_insensitive,
            symbols: entries(&self.by_symbol),
            images: entries(&self.by_image),
            modules: self
                .modules
                .iter()
                .map(|(id, list)| (*id, list.to_blob()))
                .collect(),
        }
    }

    fn from_blob(blob: AllowListBlob) -> Result<Self> {
        let mut list = AllowList::new(blob.image_case_insensitive);
        for e in blob.symbols {
            let entry = AllowListEntry::new(e.name, e.pattern, e.cacheable)?;
            list.add_symbol_entry(e.key, entry);
        }
        for e in blob.images {
            let entry = AllowListEntry::new(e.name, e.pattern, e.cacheable)?;
            list.add_image_entry(e.key, entry);
        }
        for (id, module) in blob.modules {
            list.add_module(id, Self::from_blob(module)?);
        }
        Ok(list)
    }
}

/// Wire form shipped to distributed workers: count-prefixed entry sequences
/// with patterns as text, then a map of module id to nested payload.
#[derive(Serialize, Deserialize)]
struct AllowListBlob {
    image_case_insensitive: bool,
    symbols: Vec<EntryBlob>,
    images: Vec<EntryBlob>,
    modules: BTreeMap<u64, AllowListBlob>,
}

#[derive(Serialize, Deserialize)]
struct EntryBlob {
    key: String,
    name: String,
    pattern: String,
    cacheable: bool,
}
