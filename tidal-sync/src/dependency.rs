//! Ordering constraints between collector entries
//!
//! Edges are derived on demand from the directory service and the alias map
//! at the moment a decision is made; nothing here is persisted.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::trace;

use tidal_index::{Cid, Oid, SIndex, Socid, Soid};

use crate::alias::AliasMap;
use crate::collaborators::DirectoryService;
use crate::errors::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Child requires its parent directory object
    Parent,
    /// Aliased identity requires its target
    Alias,
    /// Content requires the object's own metadata
    Meta,
}

/// `source` may not be collected before `target` exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub target: Oid,
    pub source: Oid,
    pub kind: EdgeKind,
}

impl DependencyEdge {
    /// Component to collect so that the edge can be satisfied
    pub fn blocker(&self, sidx: SIndex) -> Socid {
        Socid::new(sidx, self.target, Cid::Meta)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    Collectible,
    Blocked(DependencyEdge),
}

pub struct DependencyGraph;

impl DependencyGraph {
    /// Find the first unsatisfied edge on the path from `socid` to its store root
    ///
    /// Walking further than `max_depth` ancestors means the directory contains
    /// a loop, which is reported as an invariant violation.
    pub fn check(
        conn: &Connection,
        directory: &dyn DirectoryService,
        socid: Socid,
        max_depth: usize,
    ) -> Result<Dependency> {
        let sidx = socid.sidx;

        if AliasMap::is_aliased(conn, sidx, socid.oid)? {
            let target = AliasMap::dereference(conn, sidx, socid.oid)?;
            return Ok(Dependency::Blocked(DependencyEdge {
                target,
                source: socid.oid,
                kind: EdgeKind::Alias,
            }));
        }

        if socid.cid == Cid::Content && !directory.exists_locally(socid.soid()) {
            return Ok(Dependency::Blocked(DependencyEdge {
                target: socid.oid,
                source: socid.oid,
                kind: EdgeKind::Meta,
            }));
        }

        let mut current = socid.oid;
        let mut depth = 0;
        while let Some(parent) = directory.parent_of(Soid::new(sidx, current)) {
            depth += 1;
            if depth > max_depth {
                return Err(SyncError::DependencyDepthExceeded { socid, max_depth });
            }

            if AliasMap::is_aliased(conn, sidx, parent)? {
                let target = AliasMap::dereference(conn, sidx, parent)?;
                return Ok(Dependency::Blocked(DependencyEdge {
                    target,
                    source: current,
                    kind: EdgeKind::Alias,
                }));
            }

            if !directory.exists_locally(Soid::new(sidx, parent)) {
                return Ok(Dependency::Blocked(DependencyEdge {
                    target: parent,
                    source: current,
                    kind: EdgeKind::Parent,
                }));
            }

            current = parent;
        }

        trace!(%socid, depth, "Dependencies satisfied");
        Ok(Dependency::Collectible)
    }

    pub fn is_collectible(
        conn: &Connection,
        directory: &dyn DirectoryService,
        socid: Socid,
        max_depth: usize,
    ) -> Result<bool> {
        Ok(matches!(
            Self::check(conn, directory, socid, max_depth)?,
            Dependency::Collectible
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use tidal_index::{Database, Sid, StoreMultiplicity};

    #[derive(Default)]
    struct Tree {
        parents: Mutex<HashMap<Oid, Oid>>,
        present: Mutex<HashSet<Oid>>,
    }

    impl Tree {
        fn link(&self, child: Oid, parent: Oid) {
            self.parents.lock().unwrap().insert(child, parent);
        }

        fn materialize(&self, oid: Oid) {
            self.present.lock().unwrap().insert(oid);
        }
    }

    impl DirectoryService for Tree {
        fn parent_of(&self, soid: Soid) -> Option<Oid> {
            self.parents.lock().unwrap().get(&soid.oid).copied()
        }

        fn exists_locally(&self, soid: Soid) -> bool {
            self.present.lock().unwrap().contains(&soid.oid)
        }
    }

    fn oid(n: u8) -> Oid {
        Oid::from_bytes([n; 16])
    }

    fn setup() -> (Database, SIndex) {
        let mut db = Database::open_in_memory().unwrap();
        let sidx = db
            .add_store(Sid::generate(), StoreMultiplicity::Single)
            .unwrap();
        (db, sidx)
    }

    #[test]
    fn test_child_waits_for_parent() {
        let (db, sidx) = setup();
        let tree = Tree::default();
        let (dir, child) = (oid(1), oid(2));
        tree.link(child, dir);

        let socid = Socid::new(sidx, child, Cid::Meta);
        let blocked = DependencyGraph::check(db.connection(), &tree, socid, 16).unwrap();
        assert_eq!(
            blocked,
            Dependency::Blocked(DependencyEdge {
                target: dir,
                source: child,
                kind: EdgeKind::Parent
            })
        );

        tree.materialize(dir);
        assert!(DependencyGraph::is_collectible(db.connection(), &tree, socid, 16).unwrap());
    }

    #[test]
    fn test_nearest_missing_ancestor_blocks() {
        let (db, sidx) = setup();
        let tree = Tree::default();
        tree.link(oid(3), oid(2));
        tree.link(oid(2), oid(1));
        tree.materialize(oid(2));

        let check = DependencyGraph::check(db.connection(), &tree, Socid::new(sidx, oid(3), Cid::Meta), 16)
            .unwrap();
        match check {
            Dependency::Blocked(edge) => {
                assert_eq!(edge.target, oid(1));
                assert_eq!(edge.source, oid(2));
                assert_eq!(edge.blocker(sidx), Socid::new(sidx, oid(1), Cid::Meta));
            }
            Dependency::Collectible => panic!("grandparent is missing"),
        }
    }

    #[test]
    fn test_content_waits_for_own_metadata() {
        let (db, sidx) = setup();
        let tree = Tree::default();
        let socid = Socid::new(sidx, oid(5), Cid::Content);

        let check = DependencyGraph::check(db.connection(), &tree, socid, 16).unwrap();
        assert!(matches!(
            check,
            Dependency::Blocked(DependencyEdge { kind: EdgeKind::Meta, .. })
        ));

        tree.materialize(oid(5));
        assert!(DependencyGraph::is_collectible(db.connection(), &tree, socid, 16).unwrap());
    }

    #[test]
    fn test_aliased_parent_blocks_on_target() {
        let (mut db, sidx) = setup();
        let tree = Tree::default();
        tree.link(oid(7), oid(4));
        tree.materialize(oid(4));

        let tx = db.begin_transaction().unwrap();
        AliasMap::add(&tx, sidx, oid(4), oid(3)).unwrap();
        tx.commit().unwrap();

        let check = DependencyGraph::check(db.connection(), &tree, Socid::new(sidx, oid(7), Cid::Meta), 16)
            .unwrap();
        assert_eq!(
            check,
            Dependency::Blocked(DependencyEdge {
                target: oid(3),
                source: oid(7),
                kind: EdgeKind::Alias
            })
        );
    }

    #[test]
    fn test_directory_loop_exceeds_depth() {
        let (db, sidx) = setup();
        let tree = Tree::default();
        tree.link(oid(1), oid(2));
        tree.link(oid(2), oid(1));
        tree.materialize(oid(1));
        tree.materialize(oid(2));

        let err = DependencyGraph::check(db.connection(), &tree, Socid::new(sidx, oid(1), Cid::Meta), 8)
            .unwrap_err();
        assert!(matches!(err, SyncError::DependencyDepthExceeded { max_depth: 8, .. }));
        assert!(err.is_invariant_violation());
    }
}
