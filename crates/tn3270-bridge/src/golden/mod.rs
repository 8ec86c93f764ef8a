//! Golden screens: named layout signatures that later captures are compared against.
//!
//! A [`LayoutSignature`] captures only the field geometry of a screen (position,
//! length and protection of every field), so two captures of the same panel
//! match no matter what the fields contain. Entries live in memory and are
//! optionally written through to one JSON file per name.
//!
//! # Key Types
//!
//! - [`GoldenRegistry`] - concurrent reads, serialized saves
//! - [`Comparison`] - `match` or `mismatch` with a [`FieldDiff`] list

use crate::error::{BridgeError, BridgeResult};
use crate::model::screen::hex_digest;
use crate::model::Screen;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Geometry of one field, content excluded.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct FieldShape {
    pub row: u16,
    pub col: u16,
    pub length: u16,
    pub protected: bool,
}

/// Content-independent fingerprint of a screen's layout.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct LayoutSignature {
    pub rows: u16,
    pub cols: u16,
    /// Ordered by (row, col).
    pub fields: Vec<FieldShape>,
}

impl LayoutSignature {
    #[must_use]
    pub fn of(screen: &Screen) -> Self {
        let mut fields: Vec<FieldShape> = screen
            .fields()
            .iter()
            .map(|field| FieldShape {
                row: field.row,
                col: field.col,
                length: field.length,
                protected: field.protected,
            })
            .collect();
        fields.sort();
        Self {
            rows: screen.rows(),
            cols: screen.cols(),
            fields,
        }
    }

    /// Stable hex digest, used in run logs.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut canonical = format!("{}x{}", self.rows, self.cols);
        for field in &self.fields {
            canonical.push_str(&format!(
                ";{},{},{},{}",
                field.row,
                field.col,
                field.length,
                u8::from(field.protected)
            ));
        }
        hex_digest(canonical.as_bytes())
    }

    /// Every difference between `self` (expected) and `actual`.
    #[must_use]
    pub fn diff(&self, actual: &Self) -> Vec<FieldDiff> {
        let mut diffs = Vec::new();
        if (self.rows, self.cols) != (actual.rows, actual.cols) {
            diffs.push(FieldDiff::Dimensions {
                expected: (self.rows, self.cols),
                actual: (actual.rows, actual.cols),
            });
        }
        let longest = self.fields.len().max(actual.fields.len());
        for index in 0..longest {
            match (self.fields.get(index), actual.fields.get(index)) {
                (Some(expected), Some(found)) if expected != found => {
                    diffs.push(FieldDiff::Changed {
                        index,
                        expected: *expected,
                        actual: *found,
                    });
                }
                (Some(expected), None) => diffs.push(FieldDiff::Missing {
                    index,
                    expected: *expected,
                }),
                (None, Some(found)) => diffs.push(FieldDiff::Extra {
                    index,
                    actual: *found,
                }),
                _ => {}
            }
        }
        diffs
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FieldDiff {
    Dimensions {
        expected: (u16, u16),
        actual: (u16, u16),
    },
    Changed {
        index: usize,
        expected: FieldShape,
        actual: FieldShape,
    },
    Missing {
        index: usize,
        expected: FieldShape,
    },
    Extra {
        index: usize,
        actual: FieldShape,
    },
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum Comparison {
    Match,
    Mismatch { diffs: Vec<FieldDiff> },
}

impl Comparison {
    #[must_use]
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }
}

/// A saved golden screen.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GoldenEntry {
    pub name: String,
    pub signature: LayoutSignature,
    /// Rendered text at save time, for humans reviewing the store.
    #[serde(default)]
    pub lines: Vec<String>,
    /// Milliseconds since the Unix epoch.
    pub saved_at_ms: u64,
}

/// Registry of golden screens, safe to share across threads.
#[derive(Debug, Default)]
pub struct GoldenRegistry {
    entries: RwLock<BTreeMap<String, GoldenEntry>>,
    dir: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl GoldenRegistry {
    /// In-memory registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry persisted under `dir`, loading any entries already there.
    pub fn open(dir: impl Into<PathBuf>) -> BridgeResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|err| BridgeError::io("failed to create goldens dir", err))?;
        let registry = Self {
            entries: RwLock::new(load_dir(&dir)?),
            dir: Some(dir),
            write_lock: Mutex::new(()),
        };
        Ok(registry)
    }

    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Save (or replace) `name` with the layout of `screen`.
    ///
    /// Saves are serialized; the file is written before the in-memory entry
    /// changes, so a failed write leaves the registry untouched.
    pub fn save(&self, name: &str, screen: &Screen) -> BridgeResult<GoldenEntry> {
        validate_name(name)?;
        let entry = GoldenEntry {
            name: name.to_string(),
            signature: LayoutSignature::of(screen),
            lines: screen.lines().to_vec(),
            saved_at_ms: now_ms(),
        };
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| BridgeError::internal("golden write lock poisoned"))?;
        if let Some(dir) = &self.dir {
            write_entry(dir, &entry)?;
        }
        self.entries
            .write()
            .map_err(|_| BridgeError::internal("golden registry lock poisoned"))?
            .insert(entry.name.clone(), entry.clone());
        tracing::info!(golden = name, fields = entry.signature.fields.len(), "golden saved");
        Ok(entry)
    }

    /// Compare `screen` against the golden `name`.
    ///
    /// # Errors
    /// `E_GOLDEN` when no golden of that name exists.
    pub fn compare(&self, name: &str, screen: &Screen) -> BridgeResult<Comparison> {
        let entries = self
            .entries
            .read()
            .map_err(|_| BridgeError::internal("golden registry lock poisoned"))?;
        let Some(entry) = entries.get(name) else {
            return Err(BridgeError::golden(
                format!("no golden named '{name}'"),
                serde_json::json!({"name": name, "known": entries.keys().collect::<Vec<_>>()}),
            ));
        };
        let diffs = entry.signature.diff(&LayoutSignature::of(screen));
        if diffs.is_empty() {
            Ok(Comparison::Match)
        } else {
            tracing::debug!(golden = name, diffs = diffs.len(), "golden mismatch");
            Ok(Comparison::Mismatch { diffs })
        }
    }

    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.entries
            .read()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<GoldenEntry> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(name).cloned())
    }

    /// Remove `name`; returns whether it existed.
    pub fn remove(&self, name: &str) -> BridgeResult<bool> {
        validate_name(name)?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| BridgeError::internal("golden write lock poisoned"))?;
        if let Some(dir) = &self.dir {
            let path = entry_path(dir, name);
            if path.exists() {
                fs::remove_file(&path)
                    .map_err(|err| BridgeError::io("failed to remove golden", err))?;
            }
        }
        let removed = self
            .entries
            .write()
            .map_err(|_| BridgeError::internal("golden registry lock poisoned"))?
            .remove(name)
            .is_some();
        Ok(removed)
    }
}

/// Golden names become file names, so only `[A-Za-z0-9_.-]` is accepted.
pub fn validate_name(name: &str) -> BridgeResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(BridgeError::validation(
            format!("invalid golden name '{name}'"),
            serde_json::json!({"name": name, "allowed": "[A-Za-z0-9_.-], not starting with '.'"}),
        ))
    }
}

fn entry_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

fn write_entry(dir: &Path, entry: &GoldenEntry) -> BridgeResult<()> {
    let data = serde_json::to_vec_pretty(entry)
        .map_err(|err| BridgeError::io("failed to serialize golden", err))?;
    let path = entry_path(dir, &entry.name);
    let tmp = dir.join(format!(".{}.json.tmp", entry.name));
    fs::write(&tmp, data).map_err(|err| BridgeError::io("failed to write golden", err))?;
    fs::rename(&tmp, &path).map_err(|err| BridgeError::io("failed to replace golden", err))
}

fn load_dir(dir: &Path) -> BridgeResult<BTreeMap<String, GoldenEntry>> {
    let mut entries = BTreeMap::new();
    let listing = fs::read_dir(dir).map_err(|err| BridgeError::io("failed to read goldens dir", err))?;
    for item in listing {
        let path = item
            .map_err(|err| BridgeError::io("failed to read goldens dir", err))?
            .path();
        let is_entry = path.extension().is_some_and(|ext| ext == "json")
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| !name.starts_with('.'));
        if !is_entry {
            continue;
        }
        let data = fs::read_to_string(&path)
            .map_err(|err| BridgeError::io("failed to read golden", err))?;
        let entry: GoldenEntry = serde_json::from_str(&data).map_err(|err| {
            BridgeError::golden(
                "failed to parse golden",
                serde_json::json!({"path": path, "source": err.to_string()}),
            )
        })?;
        entries.insert(entry.name.clone(), entry);
    }
    tracing::debug!(dir = %dir.display(), count = entries.len(), "goldens loaded");
    Ok(entries)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Cursor, Field};

    fn screen(user: &str) -> Screen {
        Screen::from_fields(
            24,
            80,
            vec![
                Field::new(0, 0, 10, true, "Logon ===>"),
                Field::new(0, 11, 8, false, user),
            ],
            Cursor::default(),
            false,
        )
    }

    #[test]
    fn signature_ignores_content() {
        assert_eq!(LayoutSignature::of(&screen("")), LayoutSignature::of(&screen("HERC02")));
        assert_eq!(
            LayoutSignature::of(&screen("")).digest(),
            LayoutSignature::of(&screen("IBMUSER")).digest()
        );
    }

    #[test]
    fn diff_reports_changed_missing_and_extra() {
        let expected = LayoutSignature::of(&screen(""));
        let mut actual = expected.clone();
        actual.fields.truncate(1);
        assert!(matches!(
            expected.diff(&actual).as_slice(),
            [FieldDiff::Missing { index: 1, .. }]
        ));
        assert!(matches!(
            actual.diff(&expected).as_slice(),
            [FieldDiff::Extra { index: 1, .. }]
        ));
    }

    #[test]
    fn names_are_restricted() {
        assert!(validate_name("logon_v2.main-1").is_ok());
        for bad in ["", "../etc", "a/b", ".hidden", "sp ace"] {
            assert!(validate_name(bad).is_err(), "{bad}");
        }
    }
}
