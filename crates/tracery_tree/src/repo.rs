//! Node repository.
//!
//! Write-through cache over a [`KvStore`] plus the in-memory parent/child
//! index. Every attribute write goes to the store immediately; the cache only
//! avoids re-reading. Edges are derived from the `parent_id` attribute and
//! from nowhere else, both at load time and on writes.

use crate::node::{Node, ATTRIBUTES};
use crate::store::KvStore;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracery_core::{CoreError, CoreResult, NodeId};
use tracing::debug;

fn attr_key(id: NodeId, attr: &str) -> String {
    format!("node.{}.{}", id, attr)
}

/// Repository of tree nodes over a key-value store
pub struct NodeRepository<S: KvStore> {
    store: S,
    cache: HashMap<NodeId, Node>,
    children: BTreeMap<NodeId, Vec<NodeId>>,
    parents: HashMap<NodeId, NodeId>,
    next_id: NodeId,
}

impl<S: KvStore> NodeRepository<S> {
    /// Open a repository, rebuilding the edge index from stored nodes.
    ///
    /// # Errors
    ///
    /// Propagates store errors and malformed persisted attributes.
    pub fn open(store: S) -> CoreResult<Self> {
        let mut ids = BTreeSet::new();
        for key in store.keys()? {
            if let Some(id) = parse_node_key(&key) {
                ids.insert(id);
            }
        }
        let mut repo = Self {
            store,
            cache: HashMap::new(),
            children: BTreeMap::new(),
            parents: HashMap::new(),
            next_id: ids.last().map_or(NodeId::ROOT, |id| id.next()),
        };
        for id in ids {
            let node = repo.load(id)?.ok_or_else(|| CoreError::NotFound {
                kind: "node".to_string(),
                id: id.to_string(),
            })?;
            if let Some(parent) = node.parent_id {
                repo.link(parent, id);
            }
            repo.cache.insert(id, node);
        }
        debug!(nodes = repo.cache.len(), "repository opened");
        Ok(repo)
    }

    /// Number of nodes currently known
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the tree holds no nodes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Allocate the next node id; ids are monotone and never reused
    pub fn allocate(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id = id.next();
        id
    }

    /// Node by id, reading through to the store on a cache miss.
    ///
    /// # Errors
    ///
    /// Propagates store errors and malformed persisted attributes.
    pub fn get(&mut self, id: NodeId) -> CoreResult<Option<&Node>> {
        if !self.cache.contains_key(&id) {
            if let Some(node) = self.load(id)? {
                self.cache.insert(id, node);
            }
        }
        Ok(self.cache.get(&id))
    }

    /// Persist a node, writing every attribute through to the store.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn persist(&mut self, node: Node) -> CoreResult<()> {
        for attr in ATTRIBUTES {
            let raw = node.attribute(attr)?;
            self.store.set(&attr_key(node.id, attr), &raw)?;
        }
        if let Some(parent) = node.parent_id {
            self.link(parent, node.id);
        }
        if node.id >= self.next_id {
            self.next_id = node.id.next();
        }
        self.cache.insert(node.id, node);
        Ok(())
    }

    /// One attribute of a node, as its stored JSON text.
    ///
    /// # Errors
    ///
    /// Propagates store errors; `CoreError::Validation` for an unknown attribute.
    pub fn attribute(&mut self, id: NodeId, attr: &str) -> CoreResult<Option<String>> {
        match self.get(id)? {
            Some(node) => Ok(Some(node.attribute(attr)?)),
            None => Ok(None),
        }
    }

    /// Write one attribute through to the store, updating any cached node.
    /// Writing `parent_id` is what adds the edge to the parent.
    ///
    /// # Errors
    ///
    /// Propagates store errors and malformed attribute values.
    pub fn set_attribute(&mut self, id: NodeId, attr: &str, raw: &str) -> CoreResult<()> {
        self.store.set(&attr_key(id, attr), raw)?;
        if let Some(node) = self.cache.get_mut(&id) {
            node.set_attribute(attr, raw)?;
        }
        if attr == "parent_id" {
            if let Some(parent) = serde_json::from_str::<Option<NodeId>>(raw)? {
                self.link(parent, id);
            }
        }
        Ok(())
    }

    /// Drop a node's cache entry; the next `get` re-reads the store
    pub fn invalidate(&mut self, id: NodeId) {
        self.cache.remove(&id);
    }

    /// Parent of a node, `None` for the root or an unknown id
    #[must_use]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.parents.get(&id).copied()
    }

    /// Children of a node, in creation order
    #[must_use]
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.children.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Ids along the root-to-node path, root first, `id` last.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for an id outside the tree.
    pub fn path(&mut self, id: NodeId) -> CoreResult<Vec<NodeId>> {
        if self.get(id)?.is_none() {
            return Err(CoreError::NotFound {
                kind: "node".to_string(),
                id: id.to_string(),
            });
        }
        let mut path = vec![id];
        let mut cursor = id;
        while let Some(parent) = self.parents.get(&cursor).copied() {
            path.push(parent);
            cursor = parent;
        }
        path.reverse();
        Ok(path)
    }

    fn load(&self, id: NodeId) -> CoreResult<Option<Node>> {
        let mut node = Node::new(id, None);
        let mut found = false;
        for attr in ATTRIBUTES {
            if let Some(raw) = self.store.get(&attr_key(id, attr))? {
                node.set_attribute(attr, &raw)?;
                found = true;
            }
        }
        Ok(found.then_some(node))
    }

    fn link(&mut self, parent: NodeId, child: NodeId) {
        self.parents.insert(child, parent);
        let children = self.children.entry(parent).or_default();
        if !children.contains(&child) {
            children.push(child);
        }
    }
}

/// Node id of a `node.<id>.<attr>` key, if it is one
fn parse_node_key(key: &str) -> Option<NodeId> {
    let rest = key.strip_prefix("node.")?;
    let (id, attr) = rest.split_once('.')?;
    if !ATTRIBUTES.contains(&attr) {
        return None;
    }
    id.parse().ok().map(NodeId::from_raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;
    use tracery_core::FlatTrace;

    fn node(id: u64, parent: Option<u64>, blocks: Vec<u64>) -> Node {
        Node {
            id: NodeId::from_raw(id),
            parent_id: parent.map(NodeId::from_raw),
            trace: FlatTrace {
                basic_blocks: blocks,
                ..FlatTrace::empty()
            },
        }
    }

    #[test]
    fn test_persist_and_get() {
        let mut repo = NodeRepository::open(MemoryKv::new()).unwrap();
        assert!(repo.is_empty());
        repo.persist(node(0, None, vec![0x1000])).unwrap();
        let loaded = repo.get(NodeId::ROOT).unwrap().unwrap();
        assert_eq!(loaded.trace.basic_blocks, vec![0x1000]);
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_parent_id_builds_edges() {
        let mut repo = NodeRepository::open(MemoryKv::new()).unwrap();
        repo.persist(node(0, None, vec![])).unwrap();
        repo.persist(node(1, Some(0), vec![])).unwrap();
        repo.persist(node(2, Some(0), vec![])).unwrap();
        repo.persist(node(3, Some(2), vec![])).unwrap();
        assert_eq!(repo.children(NodeId::ROOT), &[NodeId::from_raw(1), NodeId::from_raw(2)]);
        assert_eq!(repo.parent(NodeId::from_raw(3)), Some(NodeId::from_raw(2)));
        assert_eq!(
            repo.path(NodeId::from_raw(3)).unwrap(),
            vec![NodeId::ROOT, NodeId::from_raw(2), NodeId::from_raw(3)]
        );
    }

    #[test]
    fn test_allocation_resumes_past_stored_ids() {
        let store = std::sync::Arc::new(MemoryKv::new());
        {
            let mut repo = NodeRepository::open(store.clone()).unwrap();
            repo.persist(node(0, None, vec![])).unwrap();
            repo.persist(node(7, Some(0), vec![])).unwrap();
        }
        // Reopen over the same backing data.
        let mut repo = NodeRepository::open(store).unwrap();
        assert_eq!(repo.len(), 2);
        assert_eq!(repo.allocate(), NodeId::from_raw(8));
        assert_eq!(repo.children(NodeId::ROOT), &[NodeId::from_raw(7)]);
    }

    #[test]
    fn test_attribute_read_and_write() {
        let mut repo = NodeRepository::open(MemoryKv::new()).unwrap();
        repo.persist(node(0, None, vec![])).unwrap();
        repo.persist(node(4, None, vec![0x1000])).unwrap();
        assert_eq!(
            repo.attribute(NodeId::from_raw(4), "basic_blocks").unwrap().as_deref(),
            Some("[4096]")
        );
        // Writing parent_id is what creates the edge.
        assert!(repo.parent(NodeId::from_raw(4)).is_none());
        repo.set_attribute(NodeId::from_raw(4), "parent_id", "0").unwrap();
        assert_eq!(repo.parent(NodeId::from_raw(4)), Some(NodeId::ROOT));
        assert_eq!(repo.get(NodeId::from_raw(4)).unwrap().unwrap().parent_id, Some(NodeId::ROOT));
    }

    #[test]
    fn test_invalidate_rereads_store() {
        let mut repo = NodeRepository::open(MemoryKv::new()).unwrap();
        repo.persist(node(0, None, vec![0x1000])).unwrap();
        repo.invalidate(NodeId::ROOT);
        let loaded = repo.get(NodeId::ROOT).unwrap().unwrap();
        assert_eq!(loaded.trace.basic_blocks, vec![0x1000]);
    }

    #[test]
    fn test_path_of_unknown_node_fails() {
        let mut repo = NodeRepository::open(MemoryKv::new()).unwrap();
        assert!(matches!(
            repo.path(NodeId::from_raw(9)),
            Err(CoreError::NotFound { .. })
        ));
    }
}
