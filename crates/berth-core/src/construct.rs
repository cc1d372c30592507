//! Construct scopes: the explicit ownership tree behind every topology.
//!
//! A [`Scope`] is a node in the tree. Children are allocated through their
//! parent, which rejects duplicate ids, so two resources under one parent can
//! never collide. Logical ids are derived from the full path: the readable
//! alphanumeric segments followed by an 8-char digest of the path, which keeps
//! ids stable across runs and distinct even when the readable part is not.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

use crate::error::{BerthError, Result};

const PATH_SEPARATOR: &str = "/";

/// A node in the construct tree.
#[derive(Debug)]
pub struct Scope {
    path: Vec<String>,
    children: BTreeSet<String>,
}

impl Scope {
    /// Create a root scope (one per topology).
    pub fn root(id: &str) -> Result<Self> {
        validate_id(id)?;
        Ok(Self {
            path: vec![id.to_string()],
            children: BTreeSet::new(),
        })
    }

    /// Allocate a child scope. Fails if `id` is already taken under this scope.
    pub fn child(&mut self, id: &str) -> Result<Scope> {
        self.claim(id)?;
        let mut path = self.path.clone();
        path.push(id.to_string());
        Ok(Scope {
            path,
            children: BTreeSet::new(),
        })
    }

    /// Allocate a leaf resource under this scope and return its logical id.
    pub fn resource(&mut self, id: &str) -> Result<String> {
        self.claim(id)?;
        let mut path = self.path.clone();
        path.push(id.to_string());
        Ok(logical_id_for(&path))
    }

    /// The last path segment.
    pub fn id(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }

    /// Full path, `/`-separated.
    pub fn path(&self) -> String {
        self.path.join(PATH_SEPARATOR)
    }

    /// Logical id of this scope itself.
    pub fn logical_id(&self) -> String {
        logical_id_for(&self.path)
    }

    /// Ids of the children allocated so far, sorted.
    pub fn children(&self) -> impl Iterator<Item = &str> {
        self.children.iter().map(String::as_str)
    }

    fn claim(&mut self, id: &str) -> Result<()> {
        validate_id(id)?;
        if !self.children.insert(id.to_string()) {
            return Err(BerthError::DuplicateConstruct {
                parent: self.path(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(BerthError::InvalidIdentifier(
            "construct id must not be empty".to_string(),
        ));
    }
    if id.contains(PATH_SEPARATOR) {
        return Err(BerthError::InvalidIdentifier(format!(
            "construct id '{}' must not contain '{}'",
            id, PATH_SEPARATOR
        )));
    }
    Ok(())
}

fn logical_id_for(path: &[String]) -> String {
    let readable: String = path
        .iter()
        .flat_map(|segment| segment.chars())
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(path.join(PATH_SEPARATOR).as_bytes());
    let digest = hex::encode(hasher.finalize());

    format!("{}{}", readable, digest[..8].to_ascii_uppercase())
}
