//! Object -> concept -> values data model and its JSON persistence.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{AttrGenError, Result};

#[derive(Deserialize)]
#[serde(untagged)]
enum ObjectsFile {
    List(Vec<ObjectEntry>),
    Wrapped { objects: Vec<ObjectEntry> },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ObjectEntry {
    Name(String),
    Record {
        #[serde(alias = "object")]
        name: String,
    },
}

/// Parse an objects file: a JSON array of names or of `{ "name": ... }` records,
/// optionally wrapped as `{ "objects": [...] }`. Blank and repeated names are dropped.
pub fn parse_objects(content: &str) -> Result<Vec<String>> {
    let file: ObjectsFile = serde_json::from_str(content)?;
    let entries = match file {
        ObjectsFile::List(entries) | ObjectsFile::Wrapped { objects: entries } => entries,
    };
    let mut seen = HashSet::new();
    Ok(entries
        .into_iter()
        .map(|e| match e {
            ObjectEntry::Name(name) | ObjectEntry::Record { name } => name.trim().to_string(),
        })
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(name.clone()))
        .collect())
}

pub fn load_objects(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| AttrGenError::io(path, e))?;
    let objects = parse_objects(&content)?;
    info!("Loaded {} objects from {}", objects.len(), path.display());
    Ok(objects)
}

/// Generated attributes keyed by object, then by concept.
/// A concept whose values have not been generated yet maps to an empty list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeSet {
    objects: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a previous run's output. A missing or empty file yields an empty set.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No existing output at {}, starting fresh", path.display());
                return Ok(Self::new());
            }
            Err(e) => return Err(AttrGenError::io(path, e)),
        };
        if content.trim().is_empty() {
            return Ok(Self::new());
        }
        let set: Self = serde_json::from_str(&content)?;
        info!(
            "Resuming from {}: {} objects, {} concepts, {} values",
            path.display(),
            set.object_count(),
            set.concept_count(),
            set.value_count()
        );
        Ok(set)
    }

    /// Write pretty JSON via a temp file and rename so a crash never leaves a torn file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| AttrGenError::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = std::path::PathBuf::from(tmp);
        std::fs::write(&tmp, json).map_err(|e| AttrGenError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| AttrGenError::io(path, e))?;
        debug!("Saved {} objects to {}", self.object_count(), path.display());
        Ok(())
    }

    pub fn has_concepts(&self, object: &str) -> bool {
        self.objects.get(object).is_some_and(|c| !c.is_empty())
    }

    pub fn concepts(&self, object: &str) -> Vec<&str> {
        self.objects
            .get(object)
            .map(|c| c.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn values(&self, object: &str, concept: &str) -> Option<&[String]> {
        self.objects
            .get(object)
            .and_then(|c| c.get(concept))
            .map(Vec::as_slice)
    }

    /// Replace an object's concepts. Values already generated for a concept
    /// that survives are kept.
    pub fn set_concepts(&mut self, object: &str, concepts: Vec<String>) {
        let previous = self.objects.remove(object).unwrap_or_default();
        let mut next = BTreeMap::new();
        for concept in concepts {
            let values = previous.get(&concept).cloned().unwrap_or_default();
            next.insert(concept, values);
        }
        self.objects.insert(object.to_string(), next);
    }

    pub fn set_values(&mut self, object: &str, concept: &str, values: Vec<String>) {
        self.objects
            .entry(object.to_string())
            .or_default()
            .insert(concept.to_string(), values);
    }

    /// Objects from `objects` (in that order) that still need concepts.
    pub fn pending_objects(&self, objects: &[String]) -> Vec<String> {
        objects
            .iter()
            .filter(|o| !self.has_concepts(o))
            .cloned()
            .collect()
    }

    /// (object, concept) pairs without values, restricted to `objects` and in their order.
    pub fn pending_concepts(&self, objects: &[String]) -> Vec<(String, String)> {
        objects
            .iter()
            .filter_map(|o| self.objects.get(o).map(|c| (o, c)))
            .flat_map(|(object, concepts)| {
                concepts
                    .iter()
                    .filter(|(_, values)| values.is_empty())
                    .map(move |(concept, _)| (object.clone(), concept.clone()))
            })
            .collect()
    }

    pub fn object_names(&self) -> Vec<String> {
        self.objects.keys().cloned().collect()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn concept_count(&self) -> usize {
        self.objects.values().map(BTreeMap::len).sum()
    }

    pub fn value_count(&self) -> usize {
        self.objects
            .values()
            .flat_map(BTreeMap::values)
            .map(Vec::len)
            .sum()
    }
}
