use serde::Deserialize;
use std::{fs, path::Path};
use thiserror::Error;

/// Subset of source artifacts targeted by one run.
///
/// Kinds are additive: a scope with `whole_project` and explicit paths lists
/// both, and the same artifact may be discovered more than once.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Scope {
    pub whole_project: bool,
    /// Directories relative to the source root; each selects itself and
    /// everything below it.
    pub paths: Vec<String>,
    /// Full node identifiers relative to the source root, matched exactly.
    pub nodes: Vec<String>,
}

/// One query the catalog issues on behalf of a [`Scope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeQuery {
    WholeProject,
    Path(String),
    Node { dir: String, name: String },
}

impl std::fmt::Display for ScopeQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WholeProject => write!(f, "whole-project"),
            Self::Path(path) => write!(f, "path:{path}"),
            Self::Node { dir, name } if dir.is_empty() => write!(f, "node:{name}"),
            Self::Node { dir, name } => write!(f, "node:{dir}/{name}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("failed to read scope file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse scope file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("scope file selects nothing")]
    Empty,
    #[error("blank {0} entry in scope file")]
    BlankEntry(&'static str),
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScopeFile {
    #[serde(default)]
    whole_project: bool,
    #[serde(default)]
    paths: Vec<String>,
    #[serde(default)]
    nodes: Vec<String>,
}

impl Scope {
    pub fn whole_project() -> Self {
        Self {
            whole_project: true,
            ..Self::default()
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ScopeError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ScopeError> {
        let file: ScopeFile = serde_json::from_str(raw)?;
        let paths = normalize_entries(file.paths, "path")?;
        let nodes = normalize_entries(file.nodes, "node")?;

        if !file.whole_project && paths.is_empty() && nodes.is_empty() {
            return Err(ScopeError::Empty);
        }

        Ok(Self {
            whole_project: file.whole_project,
            paths,
            nodes,
        })
    }

    /// Expands the scope into the individual catalog queries, in the order
    /// whole-project, paths, nodes.
    pub fn queries(&self) -> Vec<ScopeQuery> {
        let mut queries = Vec::with_capacity(
            usize::from(self.whole_project) + self.paths.len() + self.nodes.len(),
        );
        if self.whole_project {
            queries.push(ScopeQuery::WholeProject);
        }
        queries.extend(self.paths.iter().cloned().map(ScopeQuery::Path));
        queries.extend(self.nodes.iter().map(|node| {
            let (dir, name) = match node.rsplit_once('/') {
                Some((dir, name)) => (dir.to_owned(), name.to_owned()),
                None => (String::new(), node.clone()),
            };
            ScopeQuery::Node { dir, name }
        }));
        queries
    }
}

fn normalize_entries(entries: Vec<String>, kind: &'static str) -> Result<Vec<String>, ScopeError> {
    entries
        .into_iter()
        .map(|entry| {
            let trimmed = entry.trim().trim_matches('/');
            if trimmed.is_empty() {
                Err(ScopeError::BlankEntry(kind))
            } else {
                Ok(trimmed.to_owned())
            }
        })
        .collect()
}
