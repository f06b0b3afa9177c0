use std::collections::HashMap;

use serde::Deserialize;

use super::{RegionCatalog, RegionNode};
use crate::error::CatalogError;
use crate::types::{PackageSizes, RegionIndex};

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(rename = "v")]
    version: i64,
    id: String,
    #[serde(rename = "g", default)]
    children: Vec<NodeEntry>,
}

#[derive(Debug, Deserialize)]
struct NodeEntry {
    id: String,
    #[serde(rename = "n", default)]
    name: Option<String>,
    #[serde(rename = "s", default)]
    size: Option<u64>,
    #[serde(rename = "rs", default)]
    routing_size: u64,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(rename = "g", default)]
    children: Vec<NodeEntry>,
}

pub(super) fn parse(raw: &str) -> Result<RegionCatalog, CatalogError> {
    let file: CatalogFile = serde_json::from_str(raw)?;
    if file.children.is_empty() {
        return Err(CatalogError::Empty);
    }

    let mut builder = Builder::default();
    let root = builder.push(
        file.id.clone(),
        file.id,
        None,
        Vec::new(),
        PackageSizes::default(),
        None,
    )?;
    builder.push_children(root, &[], file.children)?;
    builder.finish_node(root);

    let mut nodes = builder.nodes;
    // Pre-order layout: every child has a larger index than its parent.
    for i in (1..nodes.len()).rev() {
        let Some(parent) = nodes[i].parent else {
            continue;
        };
        let sizes = nodes[i].sizes;
        let parent = &mut nodes[parent.as_usize()].sizes;
        parent.map = parent.map.saturating_add(sizes.map);
        parent.routing = parent.routing.saturating_add(sizes.routing);
    }

    Ok(RegionCatalog {
        nodes,
        by_id: builder.by_id,
        version: file.version,
    })
}

#[derive(Default)]
struct Builder {
    nodes: Vec<RegionNode>,
    by_id: HashMap<String, RegionIndex>,
}

impl Builder {
    fn push(
        &mut self,
        id: String,
        name: String,
        parent: Option<RegionIndex>,
        path: Vec<u32>,
        sizes: PackageSizes,
        sha256: Option<String>,
    ) -> Result<RegionIndex, CatalogError> {
        let index = RegionIndex(self.nodes.len() as u32);
        if self.by_id.insert(id.clone(), index).is_some() {
            return Err(CatalogError::DuplicateId { id });
        }
        self.nodes.push(RegionNode {
            index,
            id,
            name,
            parent,
            children: Vec::new(),
            path,
            sizes,
            sha256,
            subtree_end: index.0 + 1,
        });
        Ok(index)
    }

    fn push_children(
        &mut self,
        parent: RegionIndex,
        parent_path: &[u32],
        entries: Vec<NodeEntry>,
    ) -> Result<(), CatalogError> {
        for (position, entry) in entries.into_iter().enumerate() {
            let mut path = parent_path.to_vec();
            path.push(position as u32);

            let is_leaf = entry.children.is_empty();
            let sizes = if is_leaf {
                let Some(map) = entry.size else {
                    return Err(CatalogError::MissingSize { id: entry.id });
                };
                PackageSizes {
                    map,
                    routing: entry.routing_size,
                }
            } else {
                PackageSizes::default()
            };

            let name = entry.name.unwrap_or_else(|| entry.id.clone());
            let sha256 = entry.sha256.map(|h| h.to_ascii_lowercase());
            let index = self.push(entry.id, name, Some(parent), path.clone(), sizes, sha256)?;
            self.nodes[parent.as_usize()].children.push(index);

            if !is_leaf {
                self.push_children(index, &path, entry.children)?;
            }
            self.finish_node(index);
        }
        Ok(())
    }

    fn finish_node(&mut self, index: RegionIndex) {
        let end = self.nodes.len() as u32;
        self.nodes[index.as_usize()].subtree_end = end;
    }
}
