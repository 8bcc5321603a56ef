//! Desktop keyfile parser
//!
//! Parses freedesktop `.desktop` files into grouped key-value maps.
//! Groups and keys are case-sensitive, unlike unit files.

use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum KeyfileError {
    #[error("Group '{0}' appears more than once")]
    DuplicateGroup(String),

    #[error("Invalid group header: {0}")]
    InvalidGroupHeader(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed keyfile: group name to its entries
#[derive(Debug, Default, Clone)]
pub struct KeyFile {
    groups: HashMap<String, HashMap<String, String>>,
}

impl KeyFile {
    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    /// Look up a key inside a group
    pub fn get(&self, group: &str, key: &str) -> Option<&str> {
        self.groups.get(group).and_then(|g| g.get(key)).map(String::as_str)
    }

    pub fn has_key(&self, group: &str, key: &str) -> bool {
        self.get(group, key).is_some()
    }
}

/// Parse a keyfile from a string
pub fn parse_keyfile(content: &str) -> Result<KeyFile, KeyfileError> {
    let mut groups: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current: Option<(String, HashMap<String, String>)> = None;

    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.starts_with('[') {
            let name = line
                .strip_prefix('[')
                .and_then(|l| l.strip_suffix(']'))
                .ok_or_else(|| KeyfileError::InvalidGroupHeader(line.to_string()))?;

            if let Some((prev_name, entries)) = current.take() {
                groups.insert(prev_name, entries);
            }
            if groups.contains_key(name) {
                return Err(KeyfileError::DuplicateGroup(name.to_string()));
            }
            current = Some((name.to_string(), HashMap::new()));
            continue;
        }

        // Entries before the first group header carry no meaning here
        let Some((_, entries)) = current.as_mut() else {
            continue;
        };

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        entries.insert(key.trim_end().to_string(), value.trim_start().to_string());
    }

    if let Some((name, entries)) = current {
        if groups.contains_key(&name) {
            return Err(KeyfileError::DuplicateGroup(name));
        }
        groups.insert(name, entries);
    }

    Ok(KeyFile { groups })
}

/// Load and parse a keyfile from disk
pub async fn load_keyfile(path: &Path) -> Result<KeyFile, KeyfileError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_keyfile(&content)
}
