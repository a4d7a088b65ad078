//! # Signing-Identity Trie
//!
//! A compressed radix trie over byte strings, built in one shot from a
//! provider's identity map and read-only afterwards.
//!
//! ## Layout
//!
//! Three arenas sized up front from the input and never grown:
//!
//! - **nodes**: `(start, length)` slice into the byte arena, a child-map
//!   index (or none), and a terminal bit marking the end of a stored string.
//! - **child maps**: fixed tables of 256 node indices, one per node that has
//!   children, keyed by the first byte of the child's slice.
//! - **bytes**: every stored byte, each input byte copied at most once.
//!
//! All indices are 16-bit. With `n` identities and a declared shared-prefix
//! count `p`, the arenas hold `n + p + 1` nodes, `p + 1` child maps and the
//! summed identity length in bytes. Each insertion adds at most two nodes
//! (a split suffix and a leaf) and one child map, so `p = n` always
//! suffices; a provider that declares too small a `p` gets a failed build.
//!
//! A build that would overflow the index width or the memory budget fails
//! before anything is allocated. A failed build leaves the caller's
//! existing trie untouched.

use std::mem::size_of;
use thiserror::Error;

/// Identities under this prefix match once the walk reaches a node boundary
/// exactly at the end of the prefix.
pub const FIXED_PREFIX: &[u8] = b"com.apple.webapp";

const NONE: u16 = u16::MAX;
const CHILD_MAP_SIZE: usize = 256;
const ROOT: u16 = 0;

/// Reasons a trie build is refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrieError {
    #[error("arena of {0} entries does not fit 16-bit indices")]
    IndexOverflow(usize),

    #[error("trie needs {needed} bytes, budget is {budget}")]
    BudgetExceeded { needed: usize, budget: usize },

    #[error("declared prefix count too small for the identities supplied")]
    ArenaExhausted,
}

/// How a query matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrieMatch {
    /// The query is one of the stored identities.
    Exact,
    /// The query starts with [`FIXED_PREFIX`] and the trie has a node
    /// boundary there.
    FixedPrefix,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    start: u16,
    length: u16,
    child_map: u16,
    terminal: bool,
}

/// Compressed trie of signing identities.
#[derive(Debug, Clone)]
pub struct Trie {
    nodes: Vec<Node>,
    child_maps: Vec<u16>,
    bytes: Vec<u8>,
    node_cap: usize,
    map_cap: usize,
    bytes_cap: usize,
}

impl Default for Trie {
    fn default() -> Self {
        Self::empty()
    }
}

impl Trie {
    /// A trie that matches nothing.
    pub fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            child_maps: Vec::new(),
            bytes: Vec::new(),
            node_cap: 0,
            map_cap: 0,
            bytes_cap: 0,
        }
    }

    /// Arena memory a build with these inputs would reserve.
    pub fn required_memory(id_count: usize, prefix_count: usize, total_bytes: usize) -> usize {
        let nodes = id_count.saturating_add(prefix_count).saturating_add(1);
        let maps = prefix_count.saturating_add(1);
        nodes
            .saturating_mul(size_of::<Node>())
            .saturating_add(maps.saturating_mul(CHILD_MAP_SIZE * size_of::<u16>()))
            .saturating_add(total_bytes)
    }

    /// Build a trie from `ids`.
    ///
    /// Empty identities are skipped. Fails closed: on any error no trie is
    /// produced.
    pub fn build<I, S>(ids: I, prefix_count: usize, budget: usize) -> Result<Self, TrieError>
    where
        I: IntoIterator<Item = S>,
        I::IntoIter: Clone,
        S: AsRef<[u8]>,
    {
        let ids = ids.into_iter();
        let id_count = ids.clone().count();
        let total_bytes = ids
            .clone()
            .try_fold(0usize, |acc, id| acc.checked_add(id.as_ref().len()))
            .ok_or(TrieError::IndexOverflow(usize::MAX))?;

        let node_cap = id_count
            .checked_add(prefix_count)
            .and_then(|n| n.checked_add(1))
            .ok_or(TrieError::IndexOverflow(usize::MAX))?;
        let map_cap = prefix_count
            .checked_add(1)
            .ok_or(TrieError::IndexOverflow(usize::MAX))?;

        // NONE is reserved, so the largest usable index is NONE - 1.
        for cap in [node_cap, map_cap, total_bytes] {
            if cap >= NONE as usize {
                return Err(TrieError::IndexOverflow(cap));
            }
        }

        let needed = Self::required_memory(id_count, prefix_count, total_bytes);
        if needed > budget {
            return Err(TrieError::BudgetExceeded { needed, budget });
        }

        let mut trie = Self {
            nodes: Vec::with_capacity(node_cap),
            child_maps: Vec::with_capacity(map_cap * CHILD_MAP_SIZE),
            bytes: Vec::with_capacity(total_bytes),
            node_cap,
            map_cap,
            bytes_cap: total_bytes,
        };
        let root_map = trie.alloc_map()?;
        trie.nodes.push(Node {
            start: 0,
            length: 0,
            child_map: root_map,
            terminal: false,
        });

        for id in ids {
            let id = id.as_ref();
            if !id.is_empty() {
                trie.insert(id)?;
            }
        }
        Ok(trie)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Number of nodes in use, root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Look up `query`. Returns `None` when it is not matched.
    pub fn search(&self, query: &[u8]) -> Option<TrieMatch> {
        if self.nodes.is_empty() {
            return None;
        }
        let mut node = ROOT;
        let mut pos = 0;
        loop {
            if pos == FIXED_PREFIX.len() && query.starts_with(FIXED_PREFIX) {
                return Some(TrieMatch::FixedPrefix);
            }
            if pos == query.len() {
                return self.node(node).terminal.then_some(TrieMatch::Exact);
            }
            let child = self.child(node, query[pos]);
            if child == NONE {
                return None;
            }
            let slice = self.slice(child);
            if !query[pos..].starts_with(slice) {
                return None;
            }
            pos += slice.len();
            node = child;
        }
    }

    pub fn contains(&self, query: &[u8]) -> bool {
        self.search(query).is_some()
    }

    fn insert(&mut self, id: &[u8]) -> Result<(), TrieError> {
        let mut node = ROOT;
        let mut pos = 0;
        loop {
            if pos == id.len() {
                self.nodes[node as usize].terminal = true;
                return Ok(());
            }
            let first = id[pos];
            let child = self.child(node, first);
            if child == NONE {
                let leaf = self.alloc_leaf(&id[pos..])?;
                return self.link(node, first, leaf);
            }

            let slice = self.slice(child);
            let common = slice
                .iter()
                .zip(&id[pos..])
                .take_while(|(a, b)| a == b)
                .count();
            if common < slice.len() {
                self.split(child, common)?;
            }
            pos += common;
            node = child;
        }
    }

    /// Cut `index` after `at` bytes. The node keeps the prefix; a new node
    /// takes the remainder along with the original children and terminal bit.
    fn split(&mut self, index: u16, at: usize) -> Result<(), TrieError> {
        let orig = self.node(index);
        // `at < orig.length`, so the narrowing is lossless.
        let at = at as u16;
        let suffix_start = orig.start + at;
        let suffix = self.alloc_node(Node {
            start: suffix_start,
            length: orig.length - at,
            child_map: orig.child_map,
            terminal: orig.terminal,
        })?;
        let map = self.alloc_map()?;
        self.nodes[index as usize] = Node {
            start: orig.start,
            length: at,
            child_map: map,
            terminal: false,
        };
        let key = self.bytes[suffix_start as usize];
        self.child_maps[map as usize * CHILD_MAP_SIZE + key as usize] = suffix;
        Ok(())
    }

    fn link(&mut self, parent: u16, key: u8, child: u16) -> Result<(), TrieError> {
        let mut map = self.node(parent).child_map;
        if map == NONE {
            map = self.alloc_map()?;
            self.nodes[parent as usize].child_map = map;
        }
        self.child_maps[map as usize * CHILD_MAP_SIZE + key as usize] = child;
        Ok(())
    }

    fn alloc_leaf(&mut self, tail: &[u8]) -> Result<u16, TrieError> {
        if self.bytes.len() + tail.len() > self.bytes_cap {
            return Err(TrieError::ArenaExhausted);
        }
        // bytes_cap < NONE, checked at build.
        let start = self.bytes.len() as u16;
        self.bytes.extend_from_slice(tail);
        self.alloc_node(Node {
            start,
            length: tail.len() as u16,
            child_map: NONE,
            terminal: true,
        })
    }

    fn alloc_node(&mut self, node: Node) -> Result<u16, TrieError> {
        if self.nodes.len() >= self.node_cap {
            return Err(TrieError::ArenaExhausted);
        }
        self.nodes.push(node);
        Ok((self.nodes.len() - 1) as u16)
    }

    fn alloc_map(&mut self) -> Result<u16, TrieError> {
        let used = self.child_maps.len() / CHILD_MAP_SIZE;
        if used >= self.map_cap {
            return Err(TrieError::ArenaExhausted);
        }
        self.child_maps.resize((used + 1) * CHILD_MAP_SIZE, NONE);
        Ok(used as u16)
    }

    fn node(&self, index: u16) -> Node {
        self.nodes[index as usize]
    }

    fn child(&self, node: u16, key: u8) -> u16 {
        match self.node(node).child_map {
            NONE => NONE,
            map => self.child_maps[map as usize * CHILD_MAP_SIZE + key as usize],
        }
    }

    fn slice(&self, node: u16) -> &[u8] {
        let n = self.node(node);
        &self.bytes[n.start as usize..(n.start + n.length) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUDGET: usize = 1024 * 1024;

    fn build(ids: &[&str]) -> Trie {
        Trie::build(ids.iter().map(|s| s.as_bytes()), ids.len(), BUDGET).unwrap()
    }

    #[test]
    fn test_exact_matches_only() {
        let trie = build(&["com.example.mail", "com.example.maps", "org.other.app"]);
        assert_eq!(trie.search(b"com.example.mail"), Some(TrieMatch::Exact));
        assert_eq!(trie.search(b"com.example.maps"), Some(TrieMatch::Exact));
        assert_eq!(trie.search(b"org.other.app"), Some(TrieMatch::Exact));

        // Split points and extensions are not stored identities.
        assert_eq!(trie.search(b"com.example.ma"), None);
        assert_eq!(trie.search(b"com.example.mailx"), None);
        assert_eq!(trie.search(b"com"), None);
        assert_eq!(trie.search(b""), None);
    }

    #[test]
    fn test_prefix_inserted_after_longer_string() {
        let trie = build(&["com.example.browser", "com.example"]);
        assert!(trie.contains(b"com.example.browser"));
        assert!(trie.contains(b"com.example"));
        assert!(!trie.contains(b"com.example."));
    }

    #[test]
    fn test_longer_string_inserted_after_prefix() {
        let trie = build(&["com.example", "com.example.browser"]);
        assert!(trie.contains(b"com.example.browser"));
        assert!(trie.contains(b"com.example"));
        assert!(!trie.contains(b"com.example.b"));
    }

    #[test]
    fn test_duplicates_add_no_nodes() {
        let once = build(&["a.b.c", "a.b.d"]);
        let twice = build(&["a.b.c", "a.b.d", "a.b.c"]);
        assert_eq!(once.node_count(), twice.node_count());
        assert!(twice.contains(b"a.b.c"));
    }

    #[test]
    fn test_fixed_prefix_match() {
        let trie = build(&["com.apple.webapp", "com.example.app"]);
        assert_eq!(trie.search(b"com.apple.webapp"), Some(TrieMatch::FixedPrefix));
        assert_eq!(
            trie.search(b"com.apple.webapp.clip42"),
            Some(TrieMatch::FixedPrefix)
        );
        assert_eq!(trie.search(b"com.apple.webap"), None);

        let without = build(&["com.example.app"]);
        assert_eq!(without.search(b"com.apple.webapp.clip42"), None);
    }

    #[test]
    fn test_empty_trie_matches_nothing() {
        assert!(!Trie::empty().contains(b"anything"));
        let built = build(&[]);
        assert!(built.is_empty());
        assert!(!built.contains(b""));
    }

    #[test]
    fn test_small_prefix_count_fails_closed() {
        let ids = ["com.a.one", "com.a.two", "com.b.three", "com.b.four"];
        let err = Trie::build(ids.iter().map(|s| s.as_bytes()), 0, BUDGET).unwrap_err();
        assert_eq!(err, TrieError::ArenaExhausted);
    }

    #[test]
    fn test_budget_exceeded() {
        let ids = ["com.example.app"];
        let err = Trie::build(ids.iter().map(|s| s.as_bytes()), 1, 64).unwrap_err();
        assert!(matches!(err, TrieError::BudgetExceeded { budget: 64, .. }));
    }

    #[test]
    fn test_index_overflow() {
        let ids = ["x"];
        let err = Trie::build(ids.iter().map(|s| s.as_bytes()), 70_000, usize::MAX).unwrap_err();
        assert!(matches!(err, TrieError::IndexOverflow(_)));
    }

    #[test]
    fn test_many_overlapping_identities() {
        let ids: Vec<String> = (0..200)
            .map(|i| format!("com.vendor{}.app{}", i % 7, i))
            .collect();
        let trie = Trie::build(ids.iter(), ids.len(), BUDGET).unwrap();
        for id in &ids {
            assert!(trie.contains(id.as_bytes()), "{}", id);
        }
        assert!(!trie.contains(b"com.vendor1.app"));
        assert!(!trie.contains(b"com.vendor9.app1"));
    }
}
