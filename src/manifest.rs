use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::fs;

use camino::Utf8Path;

use crate::error::FlowError;

/// A two-column, tab-separated listing of keys and locations.
///
/// Used for `chromfile.txt`, per-contig seqfiles and the alignment listing.
/// Rows are kept sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    rows: BTreeMap<String, String>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a row, returning the location it replaced.
    pub fn insert(&mut self, key: impl Into<String>, location: impl Into<String>) -> Option<String> {
        self.rows.insert(key.into(), location.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.rows.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.rows.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn parse(text: &str) -> Result<Self, FlowError> {
        let mut manifest = Self::new();

        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            let mut cols = line.split('\t');
            let (Some(key), Some(location), None) = (cols.next(), cols.next(), cols.next()) else {
                return Err(FlowError::Parse {
                    line: i + 1,
                    message: format!("expected two tab-separated columns, got '{line}'"),
                });
            };

            if manifest.insert(key, location).is_some() {
                return Err(FlowError::Parse {
                    line: i + 1,
                    message: format!("key '{key}' listed twice"),
                });
            }
        }

        Ok(manifest)
    }

    pub fn read(path: &Utf8Path) -> Result<Self, FlowError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn write(&self, path: &Utf8Path) -> Result<(), FlowError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_string())?;
        Ok(())
    }
}

impl Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, location) in &self.rows {
            writeln!(f, "{key}\t{location}")?;
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Manifest {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}
