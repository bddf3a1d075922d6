//! Arena identifiers for the cyclic workspace/server/query object graph.
//!
//! The manager owns a `WorkspaceId` arena and a `ServerId` arena (see
//! `manager::WorkspaceManager`). Cross references between workspaces, servers,
//! and in-flight queries are ids, never owning pointers, so the graph never
//! needs `Rc`/`RefCell` cycles.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! arena_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

arena_id!(WorkspaceId);
arena_id!(ServerId);
arena_id!(QueryId);

/// Monotonic id allocator shared by an arena.
///
/// Never reuses a value for the lifetime of the process, so a stale id found
/// in a log or a leftover message can never silently refer to a different
/// live entity.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    pub fn alloc(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_is_monotone_and_unique() {
        let alloc = IdAllocator::new();
        let a = alloc.alloc();
        let b = alloc.alloc();
        let c = alloc.alloc();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn ids_compare_by_value() {
        assert_eq!(WorkspaceId(1), WorkspaceId(1));
        assert_ne!(WorkspaceId(1), WorkspaceId(2));
        assert!(ServerId(1) < ServerId(2));
    }
}
