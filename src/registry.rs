//! The query registry (spec §2, §3): one owning index plus three
//! non-owning lookup indexes, each tolerant of the row being absent on
//! removal (MUID conflicts mean a query is sometimes indexed in fewer
//! than all four tables).

use fnv::FnvHashMap;
use log::warn;

use crate::ids::{Muid, NodeId, QueryId};
use crate::query::{Query, QueryOrigin};

#[derive(Default)]
pub struct Registry {
    /// Owning index: every live query.
    queries: FnvHashMap<QueryId, Query>,
    /// Non-owning: queries originated by a given peer (absent for local
    /// queries, per spec §3's ownership note).
    by_node: FnvHashMap<NodeId, Vec<QueryId>>,
    /// Non-owning: queries keyed by their on-wire MUID.
    by_muid: FnvHashMap<Muid, QueryId>,
    /// Non-owning: queries keyed by the leaf's own MUID, for OOB-proxied
    /// queries where it differs from the on-wire one.
    by_leaf_muid: FnvHashMap<Muid, QueryId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly-constructed query in the owning table and every
    /// applicable non-owning index, warning (never failing) on MUID
    /// conflicts per spec §4.4.1/§7.
    pub fn insert(&mut self, query: Query) {
        let id = query.id;
        let muid = query.muid;
        let leaf_muid = match &query.origin {
            QueryOrigin::Remote { leaf_muid, .. } => *leaf_muid,
            QueryOrigin::Local(_) => None,
        };
        let peer = query.origin.peer();

        if let Some(peer) = peer {
            self.by_node.entry(peer).or_default().push(id);
        }

        if self.by_muid.contains_key(&muid) {
            warn!(target: "dq", "conflicting MUID {:?} for dynamic query, ignoring index", muid);
        } else {
            self.by_muid.insert(muid, id);
        }

        if let Some(lmuid) = leaf_muid {
            if self.by_leaf_muid.contains_key(&lmuid) {
                warn!(target: "dq", "ignoring conflicting leaf MUID {:?} for dynamic query", lmuid);
            } else {
                self.by_leaf_muid.insert(lmuid, id);
            }
        }

        self.queries.insert(id, query);
    }

    pub fn get(&self, id: QueryId) -> Option<&Query> {
        self.queries.get(&id)
    }

    pub fn get_mut(&mut self, id: QueryId) -> Option<&mut Query> {
        self.queries.get_mut(&id)
    }

    pub fn by_muid(&self, muid: Muid) -> Option<QueryId> {
        self.by_muid.get(&muid).copied()
    }

    pub fn by_leaf_muid(&self, muid: Muid) -> Option<QueryId> {
        self.by_leaf_muid.get(&muid).copied()
    }

    /// Resolve feedback keyed by MUID: try the on-wire MUID index first,
    /// then the leaf-MUID index (unsolicited status replies for
    /// OOB-proxied queries arrive keyed by the leaf's own MUID).
    pub fn by_any_muid(&self, muid: Muid) -> Option<QueryId> {
        self.by_muid(muid).or_else(|| self.by_leaf_muid(muid))
    }

    pub fn queries_for_node(&self, node: NodeId) -> &[QueryId] {
        self.by_node.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Query> {
        self.queries.values()
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = QueryId> + '_ {
        self.queries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Fully remove a query from every index it might be in, tolerating
    /// absence from any of them (spec invariant §3.5).
    pub fn remove(&mut self, id: QueryId) -> Option<Query> {
        let query = self.queries.remove(&id)?;

        if let Some(peer) = query.origin.peer() {
            if let Some(list) = self.by_node.get_mut(&peer) {
                list.retain(|&qid| qid != id);
                if list.is_empty() {
                    self.by_node.remove(&peer);
                }
            }
        }

        if self.by_muid.get(&query.muid) == Some(&id) {
            self.by_muid.remove(&query.muid);
        }

        if let QueryOrigin::Remote {
            leaf_muid: Some(lmuid),
            ..
        } = &query.origin
        {
            if self.by_leaf_muid.get(lmuid) == Some(&id) {
                self.by_leaf_muid.remove(lmuid);
            }
        }

        Some(query)
    }

    /// Remove and return every query id originated by `peer`, draining
    /// the per-node index slot entirely (spec §4.4.9: peer loss removes
    /// the whole row, not one entry at a time).
    pub fn take_node_queries(&mut self, peer: NodeId) -> Vec<QueryId> {
        self.by_node.remove(&peer).unwrap_or_default()
    }
}
