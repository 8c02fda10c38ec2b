//! Pack configuration: the unit of distribution a server hosts.
//!
//! A [`PackConfig`] is the single canonical shape for everything the source
//! scattered across overlapping `Config`/`SyncConfig` types. Sync mode is a
//! plain sum type (`SyncMode`) rather than a string tag, so an invalid mode
//! cannot be constructed once validation has run.

pub mod store;

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};

/// How a [`SyncFolder`] is reconciled between server and client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Client tree becomes byte-identical to the server tree.
    Mirror,
    /// Client receives additions/updates only; local extras survive.
    Push,
    /// Folder is distributed as a single validated zip artifact.
    Pack,
}

/// One folder entry under a pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFolder {
    /// Path relative to the pack's server root, forward-slash separated.
    pub path: String,
    pub mode: SyncMode,
    /// Declared MD5 of the pack-mode archive; `None` for mirror/push folders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_md5: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// A bidirectional prefix mapping between the server's canonical namespace
/// and a client's local namespace. Applied at scan/comparison and placement
/// time only; never retroactively to files already on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathRedirect {
    /// Server-relative prefix, e.g. "clientmods".
    pub server_prefix: String,
    /// Client-relative prefix, e.g. "mods".
    pub client_prefix: String,
}

impl PathRedirect {
    /// Rewrite a server-canonical relative path into its client-local form.
    /// Only the first matching prefix in a redirect table should be applied
    /// by the caller; this method rewrites unconditionally if `path` starts
    /// with `server_prefix`.
    pub fn to_client(&self, path: &str) -> Option<String> {
        rewrite_prefix(path, &self.server_prefix, &self.client_prefix)
    }

    /// Rewrite a client-local relative path back into server-canonical form.
    pub fn to_server(&self, path: &str) -> Option<String> {
        rewrite_prefix(path, &self.client_prefix, &self.server_prefix)
    }
}

fn rewrite_prefix(path: &str, from: &str, to: &str) -> Option<String> {
    let from = from.trim_matches('/');
    if from.is_empty() {
        return None;
    }
    let rest = path
        .strip_prefix(from)
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))?;
    let to = to.trim_matches('/');
    if to.is_empty() {
        Some(rest.trim_start_matches('/').to_string())
    } else {
        Some(format!("{to}{rest}"))
    }
}

/// Apply a redirect table to a server-canonical path, returning the first
/// match's client-local rewrite, or the path unchanged if nothing matches.
pub fn redirect_to_client(redirects: &[PathRedirect], path: &str) -> String {
    for r in redirects {
        if let Some(rewritten) = r.to_client(path) {
            return rewritten;
        }
    }
    path.to_string()
}

/// Apply a redirect table in reverse, mapping a client-local path back to
/// the server-canonical namespace.
pub fn redirect_to_server(redirects: &[PathRedirect], path: &str) -> String {
    for r in redirects {
        if let Some(rewritten) = r.to_server(path) {
            return rewritten;
        }
    }
    path.to_string()
}

/// A named, versioned bundle of folders a server distributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackConfig {
    pub id: String,
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub server_root: String,
    #[serde(default)]
    pub folders: Vec<SyncFolder>,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default)]
    pub redirects: Vec<PathRedirect>,
}

impl PackConfig {
    /// Validate every invariant from the data model. Returns the *first*
    /// violation found; callers that want every violation should extend
    /// this to a `Vec`, but the store only needs reject/accept.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(SyncError::ConfigInvalid("missing id".into()));
        }
        if self.name.trim().is_empty() {
            return Err(SyncError::ConfigInvalid("missing name".into()));
        }
        if self.version.trim().is_empty() {
            return Err(SyncError::ConfigInvalid("missing version".into()));
        }
        if self.host.trim().is_empty() {
            return Err(SyncError::ConfigInvalid("missing host".into()));
        }
        if self.server_root.trim().is_empty() {
            return Err(SyncError::ConfigInvalid("missing server root".into()));
        }
        if self.port == 0 {
            return Err(SyncError::ConfigInvalid(format!(
                "port {} out of range (1..65535)",
                self.port
            )));
        }
        for folder in &self.folders {
            if folder.path.trim().is_empty() {
                return Err(SyncError::ConfigInvalid(
                    "sync folder with empty path".into(),
                ));
            }
        }
        for redirect in &self.redirects {
            if redirect.server_prefix.trim().is_empty() || redirect.client_prefix.trim().is_empty()
            {
                return Err(SyncError::ConfigInvalid(
                    "redirect with empty source or destination".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn folder(&self, path: &str) -> Option<&SyncFolder> {
        self.folders.iter().find(|f| f.path == path)
    }
}
