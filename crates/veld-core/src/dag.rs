//! Per-DAG adjacency and leaf index.
//!
//! Nodes are indexed incrementally on insert. Ancestry queries use two
//! accelerators so they stay far below a full walk on large histories:
//!
//! - a generation number (longest path from a root), which prunes any
//!   candidate whose generation is not above the target's;
//! - linear chains: a node with a single parent that was its parent's
//!   chain tail joins the parent's chain. Everything between a chain head
//!   and a member is an ancestor of that member, so a query jumps from any
//!   member straight to the parents of its chain head.
//!
//! Revnos are local insertion order. Parents are always inserted before
//! children, so revno order is a topological order. They are never sent
//! to another replica.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::changeset::ChangesetId;
use crate::error::{VeldError, VeldResult};

#[derive(Debug, Clone)]
struct Node {
    revno: u64,
    parents: Vec<ChangesetId>,
    generation: u64,
    chain: usize,
    pos: u64,
}

#[derive(Debug, Clone)]
struct Chain {
    head: ChangesetId,
    tail: ChangesetId,
}

/// Adjacency, leaf and revno index for one DAG.
#[derive(Debug, Clone, Default)]
pub struct DagIndex {
    nodes: HashMap<ChangesetId, Node>,
    order: Vec<ChangesetId>,
    leaves: BTreeSet<ChangesetId>,
    chains: Vec<Chain>,
}

impl DagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &ChangesetId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Insert a vertex. Returns `false` if it was already present.
    ///
    /// Every parent must already be indexed; callers applying a fragment
    /// insert its members in topological order so parents from the same
    /// transaction land first.
    pub fn add_node(&mut self, id: &ChangesetId, parents: &[ChangesetId]) -> VeldResult<bool> {
        if self.nodes.contains_key(id) {
            return Ok(false);
        }
        for p in parents {
            if !self.nodes.contains_key(p) {
                return Err(VeldError::MissingParent {
                    child: id.to_string(),
                    parent: p.to_string(),
                });
            }
        }

        let generation = parents
            .iter()
            .filter_map(|p| self.nodes.get(p))
            .map(|n| n.generation + 1)
            .max()
            .unwrap_or(0);

        let extends = match parents {
            [p] => self
                .nodes
                .get(p)
                .filter(|n| self.chains[n.chain].tail == *p)
                .map(|n| (n.chain, n.pos + 1)),
            _ => None,
        };
        let (chain, pos) = match extends {
            Some((chain, pos)) => {
                self.chains[chain].tail = id.clone();
                (chain, pos)
            }
            None => {
                self.chains.push(Chain {
                    head: id.clone(),
                    tail: id.clone(),
                });
                (self.chains.len() - 1, 0)
            }
        };

        for p in parents {
            self.leaves.remove(p);
        }
        self.leaves.insert(id.clone());

        self.order.push(id.clone());
        self.nodes.insert(
            id.clone(),
            Node {
                revno: self.order.len() as u64,
                parents: parents.to_vec(),
                generation,
                chain,
                pos,
            },
        );
        Ok(true)
    }

    /// Nodes with no children in this replica.
    pub fn leaves(&self) -> &BTreeSet<ChangesetId> {
        &self.leaves
    }

    pub fn parents(&self, id: &ChangesetId) -> Option<&[ChangesetId]> {
        self.nodes.get(id).map(|n| n.parents.as_slice())
    }

    /// True iff `a` is reachable from `b` by following parents (`a == b`
    /// counts). False if either node is absent.
    pub fn is_ancestor(&self, a: &ChangesetId, b: &ChangesetId) -> bool {
        let (Some(na), Some(nb)) = (self.nodes.get(a), self.nodes.get(b)) else {
            return false;
        };
        if a == b {
            return true;
        }
        if na.generation >= nb.generation {
            return false;
        }

        let mut seen: HashSet<&ChangesetId> = HashSet::new();
        let mut stack: Vec<&Node> = vec![nb];
        while let Some(x) = stack.pop() {
            if x.chain == na.chain && na.pos <= x.pos {
                return true;
            }
            let head = &self.chains[x.chain].head;
            let Some(nh) = self.nodes.get(head) else {
                continue;
            };
            if nh.generation <= na.generation {
                continue;
            }
            for p in &nh.parents {
                if p == a {
                    return true;
                }
                if !seen.insert(p) {
                    continue;
                }
                if let Some(np) = self.nodes.get(p) {
                    if np.generation > na.generation {
                        stack.push(np);
                    }
                }
            }
        }
        false
    }

    /// True if `id` is an ancestor (or equal) of any node in `of`.
    pub fn is_ancestor_of_any<'a>(
        &self,
        id: &ChangesetId,
        of: impl IntoIterator<Item = &'a ChangesetId>,
    ) -> bool {
        of.into_iter().any(|b| self.is_ancestor(id, b))
    }

    /// Drop every id that is an ancestor of another id in the set. Ids
    /// not present in this DAG are dropped too.
    pub fn reduce_to_heads(&self, ids: &BTreeSet<ChangesetId>) -> BTreeSet<ChangesetId> {
        let present: Vec<&ChangesetId> = ids.iter().filter(|id| self.contains(id)).collect();
        let mut heads = BTreeSet::new();
        for &a in &present {
            if !present.iter().any(|&b| a != b && self.is_ancestor(a, b)) {
                heads.insert(a.clone());
            }
        }
        heads
    }

    pub fn revno_to_id(&self, revno: u64) -> Option<&ChangesetId> {
        let idx = usize::try_from(revno).ok()?.checked_sub(1)?;
        self.order.get(idx)
    }

    pub fn id_to_revno(&self, id: &ChangesetId) -> Option<u64> {
        self.nodes.get(id).map(|n| n.revno)
    }

    /// All ids in revno (topological) order.
    pub fn ids(&self) -> impl Iterator<Item = &ChangesetId> {
        self.order.iter()
    }

    /// Every ancestor of `from` (inclusive) for which `known` is false,
    /// in revno order. The walk does not continue past known nodes.
    pub fn collect_unknown(
        &self,
        from: &[ChangesetId],
        mut known: impl FnMut(&ChangesetId) -> bool,
    ) -> Vec<ChangesetId> {
        let mut seen: HashSet<ChangesetId> = HashSet::new();
        let mut queue: VecDeque<ChangesetId> = VecDeque::new();
        let mut out = Vec::new();
        for id in from {
            if self.contains(id) && seen.insert(id.clone()) {
                queue.push_back(id.clone());
            }
        }
        while let Some(id) = queue.pop_front() {
            if known(&id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                for p in &node.parents {
                    if seen.insert(p.clone()) {
                        queue.push_back(p.clone());
                    }
                }
            }
            out.push(id);
        }
        out.sort_by_key(|id| self.id_to_revno(id).unwrap_or(u64::MAX));
        out
    }
}
