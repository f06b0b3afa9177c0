//! Region catalog
//!
//! The catalog is an arena of [`RegionNode`]s laid out in depth-first pre-order,
//! so the descendants of any node occupy a contiguous index range right after it.
//! It is built once at startup and never changes shape afterwards.

mod loader;

use std::collections::HashMap;
use std::path::Path;

use crate::error::CatalogError;
use crate::types::{PackageSizes, RegionIndex};

/// One node of the region hierarchy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionNode {
    /// Position in the arena
    pub index: RegionIndex,
    /// Catalog id; for leaves this is also the package file stem
    pub id: String,
    /// Display name (falls back to the id)
    pub name: String,
    /// Parent node, `None` for the root
    pub parent: Option<RegionIndex>,
    /// Children in catalog order
    pub children: Vec<RegionIndex>,
    /// Child positions from the root down to this node
    pub path: Vec<u32>,
    /// Remote package sizes; for groups the sum over all descendant leaves
    pub sizes: PackageSizes,
    /// Expected SHA-256 of the map file, lowercase hex
    pub sha256: Option<String>,
    subtree_end: u32,
}

impl RegionNode {
    /// True for internal nodes
    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// True for downloadable leaves
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Immutable arena of catalog nodes
#[derive(Clone, Debug)]
pub struct RegionCatalog {
    nodes: Vec<RegionNode>,
    by_id: HashMap<String, RegionIndex>,
    version: i64,
}

impl RegionCatalog {
    /// Parse a catalog from its JSON text
    pub fn from_json_str(raw: &str) -> Result<Self, CatalogError> {
        loader::parse(raw)
    }

    /// Read and parse a catalog file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| CatalogError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let catalog = Self::from_json_str(&raw)?;
        tracing::info!(
            path = %path.display(),
            version = catalog.version,
            regions = catalog.nodes.len(),
            "region catalog loaded"
        );
        Ok(catalog)
    }

    /// Data version of the packages this catalog describes
    pub fn version(&self) -> i64 {
        self.version
    }

    /// The root node's index
    pub fn root(&self) -> RegionIndex {
        RegionIndex(0)
    }

    /// Number of nodes, root included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the catalog holds no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a node
    pub fn get(&self, index: RegionIndex) -> Option<&RegionNode> {
        self.nodes.get(index.as_usize())
    }

    /// Whether `index` names a node
    pub fn contains(&self, index: RegionIndex) -> bool {
        index.as_usize() < self.nodes.len()
    }

    /// Find a node by its catalog id
    pub fn find_by_id(&self, id: &str) -> Option<RegionIndex> {
        self.by_id.get(id).copied()
    }

    /// Parent of a node
    pub fn parent(&self, index: RegionIndex) -> Option<RegionIndex> {
        self.get(index).and_then(|n| n.parent)
    }

    /// Children of a node; empty for leaves and unknown indices
    pub fn children(&self, index: RegionIndex) -> &[RegionIndex] {
        self.get(index).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    /// Ancestors from the parent up to and including the root
    pub fn ancestors(&self, index: RegionIndex) -> Ancestors<'_> {
        Ancestors {
            catalog: self,
            next: self.parent(index),
        }
    }

    /// The node and all its descendants, in index order
    pub fn subtree(&self, index: RegionIndex) -> &[RegionNode] {
        match self.get(index) {
            Some(node) => &self.nodes[index.as_usize()..node.subtree_end as usize],
            None => &[],
        }
    }

    /// Leaves of a subtree in index order; a leaf yields itself
    pub fn leaves(&self, index: RegionIndex) -> impl Iterator<Item = RegionIndex> + '_ {
        self.subtree(index)
            .iter()
            .filter(|n| n.is_leaf())
            .map(|n| n.index)
    }

    /// All nodes in index order
    pub fn iter(&self) -> impl Iterator<Item = &RegionNode> {
        self.nodes.iter()
    }

    /// Whether `ancestor` is `index` or one of its ancestors
    pub fn is_in_subtree(&self, ancestor: RegionIndex, index: RegionIndex) -> bool {
        match self.get(ancestor) {
            Some(node) => index >= ancestor && index.0 < node.subtree_end,
            None => false,
        }
    }
}

/// Iterator over a node's ancestors, nearest first
pub struct Ancestors<'a> {
    catalog: &'a RegionCatalog,
    next: Option<RegionIndex>,
}

impl Iterator for Ancestors<'_> {
    type Item = RegionIndex;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = self.catalog.parent(current);
        Some(current)
    }
}
