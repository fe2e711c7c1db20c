//! Per-project link record.
//!
//! A link record binds a project directory to the shared installation root and
//! the memory service endpoint. On disk it is a shell-sourceable file of
//! `KEY=value` lines:
//!
//! ```text
//! GLOBAL_DIR=/home/dev/.openmemory-global
//! PROJECT_NAME=billing-api
//! OPENMEMORY_URL=http://localhost:8080
//! ```
//!
//! Values that need it are single-quoted so `. .openmemory` works from any
//! POSIX shell. Parsing is permissive (comments, `export` prefixes and shell
//! quoting are accepted); validation is strict.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::info;
use url::Url;

use crate::error::{Result, SyncError};

pub const KEY_GLOBAL_DIR: &str = "GLOBAL_DIR";
pub const KEY_PROJECT_NAME: &str = "PROJECT_NAME";
pub const KEY_SERVICE_URL: &str = "OPENMEMORY_URL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRecord {
    pub global_dir: PathBuf,
    pub project_name: String,
    pub service_url: Url,
}

/// Split `KEY=value` lines into a map. Later keys override earlier ones, like `source`.
pub fn parse_fields(text: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        fields.insert(key.to_string(), unquote(value.trim()));
    }
    fields
}

/// Decode one shell word: single quotes are literal, double quotes honour
/// backslash escapes, a bare backslash escapes the next character.
fn unquote(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                    out.push(c);
                }
            }
            '"' => {
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => match chars.next() {
                            Some(n @ ('"' | '\\' | '$' | '`')) => out.push(n),
                            Some(n) => {
                                out.push('\\');
                                out.push(n);
                            }
                            None => out.push('\\'),
                        },
                        _ => out.push(c),
                    }
                }
            }
            '\\' => {
                if let Some(n) = chars.next() {
                    out.push(n);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Quote `value` for a POSIX shell assignment; plain words are left bare.
fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:@%+,=".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

impl LinkRecord {
    /// Parse and validate the text of a link record.
    pub fn parse(text: &str) -> Result<Self> {
        let fields = parse_fields(text);
        let field = |key: &str| -> Result<&str> {
            fields
                .get(key)
                .map(|v| v.as_str())
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| SyncError::config(format!("link record is missing {}", key)))
        };

        let global_dir = PathBuf::from(field(KEY_GLOBAL_DIR)?);
        let project_name = field(KEY_PROJECT_NAME)?.trim().to_string();
        let raw_url = field(KEY_SERVICE_URL)?;
        let service_url = Url::parse(raw_url)
            .map_err(|e| SyncError::config(format!("invalid {} '{}': {}", KEY_SERVICE_URL, raw_url, e)))?;

        let record = Self {
            global_dir,
            project_name,
            service_url,
        };
        record.validate()?;
        Ok(record)
    }

    /// Read `<project_dir>/<file_name>` and parse it.
    pub fn load(project_dir: &Path, file_name: &str) -> Result<Self> {
        let path = project_dir.join(file_name);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SyncError::config(format!("no link record at {}", path.display()))
            } else {
                SyncError::io(&path, e)
            }
        })?;
        Self::parse(&text).map_err(|e| match e {
            SyncError::Configuration(msg) => {
                SyncError::config(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Everything a reader will insist on, so nothing unreadable gets written.
    pub fn validate(&self) -> Result<()> {
        if self.project_name.trim().is_empty() {
            return Err(SyncError::config("PROJECT_NAME is empty"));
        }
        if !matches!(self.service_url.scheme(), "http" | "https") {
            return Err(SyncError::config(format!(
                "{} must be http or https, got '{}'",
                KEY_SERVICE_URL,
                self.service_url.scheme()
            )));
        }
        if !self.global_dir.is_dir() {
            return Err(SyncError::config(format!(
                "GLOBAL_DIR {} does not exist",
                self.global_dir.display()
            )));
        }
        Ok(())
    }

    /// Render as shell-sourceable `KEY=value` lines.
    pub fn render(&self) -> String {
        format!(
            "{}={}\n{}={}\n{}={}\n",
            KEY_GLOBAL_DIR,
            shell_quote(&self.global_dir.to_string_lossy()),
            KEY_PROJECT_NAME,
            shell_quote(&self.project_name),
            KEY_SERVICE_URL,
            shell_quote(self.service_url.as_str().trim_end_matches('/')),
        )
    }

    /// Whether two records describe the same binding.
    pub fn same_binding(&self, other: &LinkRecord) -> bool {
        self.project_name == other.project_name
            && same_dir(&self.global_dir, &other.global_dir)
            && self.service_url.as_str().trim_end_matches('/')
                == other.service_url.as_str().trim_end_matches('/')
    }

    /// Write this record into `project_dir`.
    ///
    /// An existing record with a different binding is only replaced when `force`
    /// is set; an unreadable existing file counts as different.
    pub fn write(&self, project_dir: &Path, file_name: &str, force: bool) -> Result<PathBuf> {
        self.validate()?;
        let path = project_dir.join(file_name);
        if path.exists() {
            let existing = std::fs::read_to_string(&path)
                .ok()
                .and_then(|text| LinkRecord::parse(&text).ok());
            match existing {
                Some(existing) if existing.same_binding(self) => return Ok(path),
                Some(existing) if !force => {
                    return Err(SyncError::Conflict(format!(
                        "{} already links project '{}' to {}; pass --force to replace it",
                        path.display(),
                        existing.project_name,
                        existing.service_url
                    )))
                }
                None if !force => {
                    return Err(SyncError::Conflict(format!(
                        "{} exists but is not a valid link record; pass --force to replace it",
                        path.display()
                    )))
                }
                _ => {}
            }
        }

        std::fs::write(&path, self.render()).map_err(|e| SyncError::io(&path, e))?;
        info!(project = %self.project_name, path = %path.display(), "link record written");
        Ok(path)
    }
}

/// Compare directories by canonical path when both resolve.
pub fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
