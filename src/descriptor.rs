use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a named secret lives in the remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretDescriptor {
    pub name: String,
    #[serde(rename = "path")]
    pub remote_path: String,
    #[serde(rename = "key")]
    pub remote_key: String,
}

impl SecretDescriptor {
    /// Create a descriptor, normalizing the name to upper case and the
    /// path/key to lower case
    pub fn new(name: &str, remote_path: &str, remote_key: &str) -> Self {
        Self {
            name: name.trim().to_uppercase(),
            remote_path: remote_path.trim().trim_matches('/').to_lowercase(),
            remote_key: remote_key.trim().to_lowercase(),
        }
    }

    /// Re-apply case normalization, e.g. after deserializing user input
    pub fn normalized(self) -> Self {
        Self::new(&self.name, &self.remote_path, &self.remote_key)
    }

    /// A descriptor is addressable only when name, path and key are all set
    pub fn is_addressable(&self) -> bool {
        !self.name.is_empty() && !self.remote_path.is_empty() && !self.remote_key.is_empty()
    }

    /// Human readable location, `path#key`
    pub fn location(&self) -> String {
        format!("{}#{}", self.remote_path, self.remote_key)
    }
}

/// Keep only the descriptors every engine operation may act on
pub fn addressable(descriptors: &[SecretDescriptor]) -> impl Iterator<Item = &SecretDescriptor> {
    descriptors.iter().filter(|d| d.is_addressable())
}

/// Values the user has entered locally, keyed by secret name.
///
/// Entries are not necessarily persisted remotely yet. Empty strings are
/// treated as "no value" everywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalValueCache {
    values: BTreeMap<String, String>,
}

impl LocalValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-empty value for `name`, if any
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.values.remove(name)
    }

    /// Move the value stored under `from` to `to`. Returns true if a value moved.
    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        if from == to {
            return self.values.contains_key(from);
        }
        match self.values.remove(from) {
            Some(value) => {
                self.values.insert(to.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Merge values, replacing existing entries
    pub fn merge(&mut self, values: impl IntoIterator<Item = (String, String)>) {
        self.values.extend(values);
    }

    /// Merge values only for names without a non-empty local value.
    /// Returns the number of entries filled.
    pub fn fill_missing(&mut self, values: impl IntoIterator<Item = (String, String)>) -> usize {
        let mut filled = 0;
        for (name, value) in values {
            if self.get(&name).is_none() {
                self.values.insert(name, value);
                filled += 1;
            }
        }
        filled
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }
}

impl FromIterator<(String, String)> for LocalValueCache {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}
