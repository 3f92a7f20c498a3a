//! Relation load specifications and the plans built from them.
//!
//! A specification is a list of dotted paths (`"posts.comments"`), each
//! optionally ending in a scope (`"posts.comments:withTrashed"`) and
//! optionally carrying a constraint for its last segment. Parsing builds a
//! [`LoadPlan`]: an arena of nodes, one per distinct relation under each
//! parent, stored so that every parent precedes its children.

use std::collections::HashMap;
use std::fmt;

use querycache_core::{InputError, QueryCacheError, QueryCacheResult};

use crate::query::{Constraint, RelationQuery};

#[derive(Clone)]
pub struct SpecEntry {
    pub path: String,
    pub constraint: Option<Constraint>,
}

impl fmt::Debug for SpecEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpecEntry")
            .field("path", &self.path)
            .field("constrained", &self.constraint.is_some())
            .finish()
    }
}

/// What to load.
#[derive(Debug, Clone, Default)]
pub struct RelationSpec {
    entries: Vec<SpecEntry>,
}

impl RelationSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.entries.push(SpecEntry {
            path: path.into(),
            constraint: None,
        });
        self
    }

    /// Load `path` and customize its last segment with `f`.
    pub fn constrained<F>(mut self, path: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut RelationQuery) + Send + Sync + 'static,
    {
        self.entries.push(SpecEntry {
            path: path.into(),
            constraint: Some(std::sync::Arc::new(f)),
        });
        self
    }

    pub fn entries(&self) -> &[SpecEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<&str> for RelationSpec {
    fn from(path: &str) -> Self {
        Self::new().path(path)
    }
}

impl From<String> for RelationSpec {
    fn from(path: String) -> Self {
        Self::new().path(path)
    }
}

impl From<Vec<&str>> for RelationSpec {
    fn from(paths: Vec<&str>) -> Self {
        paths.into_iter().fold(Self::new(), |spec, path| spec.path(path))
    }
}

impl<const N: usize> From<[&str; N]> for RelationSpec {
    fn from(paths: [&str; N]) -> Self {
        paths.into_iter().fold(Self::new(), |spec, path| spec.path(path))
    }
}

/// One path, split into segments with its scope and constraint.
#[derive(Clone)]
pub struct ParsedPath {
    pub segments: Vec<String>,
    /// Applies to the last segment only.
    pub scope: Option<String>,
    pub constraint: Option<Constraint>,
}

impl fmt::Debug for ParsedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedPath")
            .field("segments", &self.segments)
            .field("scope", &self.scope)
            .field("constrained", &self.constraint.is_some())
            .finish()
    }
}

impl ParsedPath {
    pub fn parse(entry: &SpecEntry) -> QueryCacheResult<Self> {
        let invalid = |reason: &str| -> QueryCacheError {
            InputError::InvalidRelationPath {
                path: entry.path.clone(),
                reason: reason.to_string(),
            }
            .into()
        };

        let mut parts = entry.path.splitn(2, ':');
        let dotted = parts.next().unwrap_or_default();
        let scope = match parts.next() {
            None => None,
            Some("") => return Err(invalid("empty scope")),
            Some(scope) if scope.contains(['.', ':']) => {
                return Err(invalid("a scope applies to the last segment only"))
            }
            Some(scope) => Some(scope.to_string()),
        };

        let segments: Vec<String> = dotted.split('.').map(|s| s.trim().to_string()).collect();
        if segments.iter().any(String::is_empty) {
            return Err(invalid("empty path segment"));
        }

        Ok(Self {
            segments,
            scope,
            constraint: entry.constraint.clone(),
        })
    }
}

/// A node of the load tree.
#[derive(Clone)]
pub struct LoadNode {
    pub name: String,
    pub scope: Option<String>,
    pub constraint: Option<Constraint>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

impl fmt::Debug for LoadNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadNode")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("constrained", &self.constraint.is_some())
            .field("parent", &self.parent)
            .field("children", &self.children)
            .finish()
    }
}

/// A deduplicated load tree. Node indices are a valid execution order.
#[derive(Debug, Clone, Default)]
pub struct LoadPlan {
    nodes: Vec<LoadNode>,
    roots: Vec<usize>,
}

impl LoadPlan {
    pub fn parse(spec: &RelationSpec) -> QueryCacheResult<Self> {
        let mut plan = Self::default();
        let mut index: HashMap<(Option<usize>, String), usize> = HashMap::new();

        for entry in spec.entries() {
            let parsed = ParsedPath::parse(entry)?;
            let last = parsed.segments.len() - 1;
            let mut parent = None;

            for (depth, segment) in parsed.segments.iter().enumerate() {
                let id = match index.get(&(parent, segment.clone())) {
                    Some(&id) => id,
                    None => {
                        let id = plan.push(segment.clone(), parent);
                        index.insert((parent, segment.clone()), id);
                        id
                    }
                };

                if depth == last {
                    plan.attach(id, &entry.path, parsed.scope.clone(), parsed.constraint.clone())?;
                }
                parent = Some(id);
            }
        }
        Ok(plan)
    }

    fn push(&mut self, name: String, parent: Option<usize>) -> usize {
        let id = self.nodes.len();
        self.nodes.push(LoadNode {
            name,
            scope: None,
            constraint: None,
            parent,
            children: Vec::new(),
        });
        match parent {
            Some(parent) => self.nodes[parent].children.push(id),
            None => self.roots.push(id),
        }
        id
    }

    fn attach(
        &mut self,
        id: usize,
        path: &str,
        scope: Option<String>,
        constraint: Option<Constraint>,
    ) -> QueryCacheResult<()> {
        let node = &mut self.nodes[id];
        if let Some(new) = scope {
            match node.scope.as_deref() {
                Some(current) if current != new => {
                    return Err(InputError::InvalidRelationPath {
                        path: path.to_string(),
                        reason: format!("conflicting scopes {current:?} and {new:?}"),
                    }
                    .into());
                }
                Some(_) => {}
                None => node.scope = Some(new),
            }
        }
        if constraint.is_some() {
            node.constraint = constraint;
        }
        Ok(())
    }

    pub fn nodes(&self) -> &[LoadNode] {
        &self.nodes
    }

    pub fn node(&self, id: usize) -> &LoadNode {
        &self.nodes[id]
    }

    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Relation names from the root down to `id`, inclusive.
    pub fn lineage(&self, id: usize) -> Vec<&str> {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(id) = current {
            names.push(self.nodes[id].name.as_str());
            current = self.nodes[id].parent;
        }
        names.reverse();
        names
    }

    /// Dotted path of a node.
    pub fn path(&self, id: usize) -> String {
        self.lineage(id).join(".")
    }

    /// Node for a dotted path, if planned.
    pub fn find(&self, path: &str) -> Option<usize> {
        (0..self.nodes.len()).find(|&id| self.path(id) == path)
    }
}
