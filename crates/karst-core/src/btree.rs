use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use karst_types::error::{KarstError, Result};
use karst_types::mac::Mac;
use karst_types::version::Version;

use crate::caching::ScanCache;

pub const BTREE_VERSION: Version = Version::new(1, 0, 0);

/// Default fan-out used by every index the engine builds.
pub const DEFAULT_ORDER: usize = 10;

pub type Comparator<K> = fn(&K, &K) -> Ordering;

/// One B-tree node. Leaves carry values; internal nodes carry separator keys
/// and child pointers. A node with no children is a leaf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node<K, V> {
    pub keys: Vec<K>,
    pub children: Vec<u64>,
    pub values: Vec<V>,
}

impl<K, V> Node<K, V> {
    fn empty_leaf() -> Self {
        Self {
            keys: Vec::new(),
            children: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Storage for B-tree nodes, keyed by node id.
pub trait NodeStore<K, V> {
    fn get(&self, id: u64) -> Result<Option<Node<K, V>>>;
    fn put(&self, id: u64, node: &Node<K, V>) -> Result<()>;
}

/// Node store over the scan cache, one prefix per index.
pub struct CacheNodeStore<K, V> {
    cache: Arc<ScanCache>,
    prefix: String,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> CacheNodeStore<K, V> {
    pub fn new(cache: Arc<ScanCache>, prefix: &str) -> Self {
        Self {
            cache,
            prefix: prefix.to_string(),
            _marker: PhantomData,
        }
    }
}

impl<K, V> NodeStore<K, V> for CacheNodeStore<K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    fn get(&self, id: u64) -> Result<Option<Node<K, V>>> {
        match self.cache.get_raw(&self.prefix, &format!("{id:016x}"))? {
            None => Ok(None),
            Some(raw) => Ok(Some(rmp_serde::from_slice(&raw)?)),
        }
    }

    fn put(&self, id: u64, node: &Node<K, V>) -> Result<()> {
        self.cache
            .put_raw(&self.prefix, &format!("{id:016x}"), &rmp_serde::to_vec(node)?)
    }
}

/// Sorted, paginated index over a key-value node store.
///
/// `order` bounds the number of keys per node; inserting past it splits the
/// node. Keys are ordered by the comparator supplied at construction.
pub struct BTree<K, V, S> {
    store: S,
    cmp: Comparator<K>,
    order: usize,
    root: u64,
    next_id: u64,
    count: u64,
    _marker: std::marker::PhantomData<V>,
}

impl<K, V, S> BTree<K, V, S>
where
    K: Clone,
    V: Clone,
    S: NodeStore<K, V>,
{
    pub fn new(store: S, cmp: Comparator<K>, order: usize) -> Result<Self> {
        if order < 2 {
            return Err(KarstError::InvalidArgument(format!(
                "btree order must be at least 2, got {order}"
            )));
        }
        store.put(0, &Node::empty_leaf())?;
        Ok(Self {
            store,
            cmp,
            order,
            root: 0,
            next_id: 1,
            count: 0,
            _marker: std::marker::PhantomData,
        })
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn load(&self, id: u64) -> Result<Node<K, V>> {
        self.store
            .get(id)?
            .ok_or_else(|| KarstError::Cache(format!("missing btree node {id}")))
    }

    fn alloc(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Index of the child to descend into for `key`.
    fn child_index(&self, node: &Node<K, V>, key: &K) -> usize {
        node.keys
            .partition_point(|separator| (self.cmp)(separator, key) != Ordering::Greater)
    }

    /// Position of `key` in a leaf, or where it would be inserted.
    fn leaf_position(&self, node: &Node<K, V>, key: &K) -> (usize, bool) {
        let pos = node
            .keys
            .partition_point(|existing| (self.cmp)(existing, key) == Ordering::Less);
        let found = pos < node.keys.len() && (self.cmp)(&node.keys[pos], key) == Ordering::Equal;
        (pos, found)
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let mut node = self.load(self.root)?;
        while !node.is_leaf() {
            let idx = self.child_index(&node, key);
            node = self.load(node.children[idx])?;
        }
        let (pos, found) = self.leaf_position(&node, key);
        if found {
            Ok(Some(node.values[pos].clone()))
        } else {
            Ok(None)
        }
    }

    /// Insert `key`. Returns `AlreadyExists` when the key is present; callers
    /// treat that as success for idempotent index building.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        // Descend, remembering the path of (node id, child index) taken.
        let mut path: Vec<(u64, usize)> = Vec::new();
        let mut node_id = self.root;
        let mut node = self.load(node_id)?;
        while !node.is_leaf() {
            let idx = self.child_index(&node, &key);
            path.push((node_id, idx));
            node_id = node.children[idx];
            node = self.load(node_id)?;
        }

        let (pos, found) = self.leaf_position(&node, &key);
        if found {
            return Err(KarstError::AlreadyExists(
                "key already present in btree".into(),
            ));
        }
        node.keys.insert(pos, key);
        node.values.insert(pos, value);
        self.count += 1;

        // Split upward while nodes overflow.
        let mut split: Option<(K, u64)> = None;
        if node.keys.len() > self.order {
            split = Some(self.split_leaf(&mut node)?);
        }
        self.store.put(node_id, &node)?;

        while let Some((separator, right_id)) = split.take() {
            match path.pop() {
                Some((parent_id, child_idx)) => {
                    let mut parent = self.load(parent_id)?;
                    parent.keys.insert(child_idx, separator);
                    parent.children.insert(child_idx + 1, right_id);
                    if parent.keys.len() > self.order {
                        split = Some(self.split_internal(&mut parent)?);
                    }
                    self.store.put(parent_id, &parent)?;
                }
                None => {
                    // The root itself split: grow the tree by one level.
                    let old_root = self.root;
                    let new_root_id = self.alloc();
                    let new_root = Node {
                        keys: vec![separator],
                        children: vec![old_root, right_id],
                        values: Vec::new(),
                    };
                    self.store.put(new_root_id, &new_root)?;
                    self.root = new_root_id;
                }
            }
        }
        Ok(())
    }

    /// Split an overflowing leaf. The separator is the first key of the new
    /// right sibling (it stays in the leaf as well).
    fn split_leaf(&mut self, node: &mut Node<K, V>) -> Result<(K, u64)> {
        let mid = node.keys.len() / 2;
        let right = Node {
            keys: node.keys.split_off(mid),
            children: Vec::new(),
            values: node.values.split_off(mid),
        };
        let separator = right.keys[0].clone();
        let right_id = self.alloc();
        self.store.put(right_id, &right)?;
        Ok((separator, right_id))
    }

    /// Split an overflowing internal node. The middle separator moves up.
    fn split_internal(&mut self, node: &mut Node<K, V>) -> Result<(K, u64)> {
        let mid = node.keys.len() / 2;
        let separator = node.keys[mid].clone();
        let right = Node {
            keys: node.keys.split_off(mid + 1),
            children: node.children.split_off(mid + 1),
            values: Vec::new(),
        };
        node.keys.pop();
        let right_id = self.alloc();
        self.store.put(right_id, &right)?;
        Ok((separator, right_id))
    }

    /// Ordered forward iteration starting at the first key >= `from`.
    pub fn scan_from(&self, from: &K) -> Result<ScanIter<'_, K, V, S>> {
        let mut stack = Vec::new();
        let mut node = self.load(self.root)?;
        while !node.is_leaf() {
            let idx = self.child_index(&node, from);
            let child = node.children[idx];
            stack.push((node, idx));
            node = self.load(child)?;
        }
        let pos = node
            .keys
            .partition_point(|existing| (self.cmp)(existing, from) == Ordering::Less);
        Ok(ScanIter {
            tree: self,
            stack,
            leaf: Some((node, pos)),
        })
    }

    /// In-order traversal of every node in the tree, leaves last within each
    /// subtree. Used when flushing the index to immutable storage.
    fn persist_node(
        &self,
        id: u64,
        materialize: &mut dyn FnMut(&V) -> Result<Mac>,
        put_node: &mut dyn FnMut(&[u8]) -> Result<Mac>,
    ) -> Result<Mac>
    where
        K: Serialize,
    {
        let node = self.load(id)?;
        let stored = if node.is_leaf() {
            let mut values = Vec::with_capacity(node.values.len());
            for value in &node.values {
                values.push(materialize(value)?);
            }
            StoredNode {
                keys: node.keys,
                children: Vec::new(),
                values,
            }
        } else {
            let mut children = Vec::with_capacity(node.children.len());
            for child in &node.children {
                children.push(self.persist_node(*child, materialize, put_node)?);
            }
            StoredNode {
                keys: node.keys,
                children,
                values: Vec::new(),
            }
        };
        put_node(&rmp_serde::to_vec(&stored)?)
    }

    /// Flush the tree: every node becomes a blob (bottom-up, children
    /// first), values are materialized to blob references by the caller's
    /// closure, and the returned root record points at the root node blob.
    pub fn persist(
        &self,
        materialize: &mut dyn FnMut(&V) -> Result<Mac>,
        put_node: &mut dyn FnMut(&[u8]) -> Result<Mac>,
    ) -> Result<StoredRoot>
    where
        K: Serialize,
    {
        let root = self.persist_node(self.root, materialize, put_node)?;
        Ok(StoredRoot {
            version: BTREE_VERSION,
            order: self.order as u32,
            count: self.count,
            root,
        })
    }
}

/// Ordered iterator over `(key, value)` pairs.
pub struct ScanIter<'a, K, V, S> {
    tree: &'a BTree<K, V, S>,
    stack: Vec<(Node<K, V>, usize)>,
    leaf: Option<(Node<K, V>, usize)>,
}

impl<K, V, S> Iterator for ScanIter<'_, K, V, S>
where
    K: Clone,
    V: Clone,
    S: NodeStore<K, V>,
{
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((leaf, pos)) = &mut self.leaf {
                if *pos < leaf.keys.len() {
                    let item = (leaf.keys[*pos].clone(), leaf.values[*pos].clone());
                    *pos += 1;
                    return Some(Ok(item));
                }
                self.leaf = None;
            }

            // Climb until an unvisited right sibling subtree exists.
            let mut descend_into = None;
            while let Some((node, idx)) = self.stack.last_mut() {
                *idx += 1;
                if *idx < node.children.len() {
                    descend_into = Some(node.children[*idx]);
                    break;
                }
                self.stack.pop();
            }
            let mut id = descend_into?;

            // Walk down the leftmost path of that subtree.
            loop {
                match self.tree.load(id) {
                    Err(e) => return Some(Err(e)),
                    Ok(node) => {
                        if node.is_leaf() {
                            self.leaf = Some((node, 0));
                            break;
                        }
                        id = node.children[0];
                        self.stack.push((node, 0));
                    }
                }
            }
        }
    }
}

/// On-disk form of a node: child pointers and leaf values are blob MACs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredNode<K> {
    pub keys: Vec<K>,
    pub children: Vec<Mac>,
    pub values: Vec<Mac>,
}

impl<K> StoredNode<K> {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Root-pointer record stored under the index's root blob kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRoot {
    pub version: Version,
    pub order: u32,
    pub count: u64,
    pub root: Mac,
}

impl StoredRoot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// In-order walk of a persisted tree, invoking `visit` for every
/// `(key, value MAC)` pair. `fetch` resolves a node MAC to its bytes.
pub fn walk_persisted<K: DeserializeOwned>(
    root: &Mac,
    fetch: &dyn Fn(&Mac) -> Result<Vec<u8>>,
    visit: &mut dyn FnMut(&K, &Mac) -> Result<()>,
) -> Result<()> {
    let node: StoredNode<K> = rmp_serde::from_slice(&fetch(root)?)?;
    if node.is_leaf() {
        for (key, value) in node.keys.iter().zip(node.values.iter()) {
            visit(key, value)?;
        }
    } else {
        for child in &node.children {
            walk_persisted(child, fetch, visit)?;
        }
    }
    Ok(())
}

/// Point lookup in a persisted tree.
pub fn get_persisted<K: DeserializeOwned>(
    root: &Mac,
    fetch: &dyn Fn(&Mac) -> Result<Vec<u8>>,
    cmp: Comparator<K>,
    key: &K,
) -> Result<Option<Mac>> {
    let mut node: StoredNode<K> = rmp_serde::from_slice(&fetch(root)?)?;
    loop {
        if node.is_leaf() {
            let pos = node
                .keys
                .partition_point(|existing| cmp(existing, key) == Ordering::Less);
            if pos < node.keys.len() && cmp(&node.keys[pos], key) == Ordering::Equal {
                return Ok(Some(node.values[pos]));
            }
            return Ok(None);
        }
        let idx = node
            .keys
            .partition_point(|separator| cmp(separator, key) != Ordering::Greater);
        node = rmp_serde::from_slice(&fetch(&node.children[idx])?)?;
    }
}
