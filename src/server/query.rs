//! Command/reply correlation for outstanding server RPCs (§5 ordering
//! guarantees, §4.8).
//!
//! A `query_map` entry correlates a reply to the command that triggered it
//! by `msg_id`. If the server disconnects, every pending query for it is
//! cancelled with `Interrupted` rather than left to time out.

use std::collections::HashMap;

use crate::error::CoreError;
use crate::ids::{QueryId, ServerId};

#[derive(Debug)]
pub struct ServerQuery {
    pub id: QueryId,
    pub server_id: ServerId,
    pub msg_id: u64,
    pub msg_type: u32,
}

#[derive(Debug, Default)]
pub struct QueryMap {
    by_msg_id: HashMap<(ServerId, u64), ServerQuery>,
}

impl QueryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, query: ServerQuery) {
        self.by_msg_id.insert((query.server_id, query.msg_id), query);
    }

    /// Removes and returns the query a reply correlates to, if any.
    pub fn take_reply(&mut self, server_id: ServerId, msg_id: u64) -> Option<ServerQuery> {
        self.by_msg_id.remove(&(server_id, msg_id))
    }

    /// Cancels every outstanding query for a server that just disconnected,
    /// returning them so the caller can notify each owner with
    /// `CoreError::Interrupted`.
    pub fn cancel_for_server(&mut self, server_id: ServerId) -> Vec<ServerQuery> {
        let keys: Vec<_> = self
            .by_msg_id
            .keys()
            .filter(|(sid, _)| *sid == server_id)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|k| self.by_msg_id.remove(&k))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.by_msg_id.len()
    }
}

pub fn interrupted() -> CoreError {
    CoreError::Interrupted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_correlates_to_registered_query() {
        let mut map = QueryMap::new();
        map.register(ServerQuery { id: QueryId(1), server_id: ServerId(1), msg_id: 7, msg_type: 3 });
        let found = map.take_reply(ServerId(1), 7).unwrap();
        assert_eq!(found.id, QueryId(1));
        assert!(map.take_reply(ServerId(1), 7).is_none());
    }

    #[test]
    fn disconnect_cancels_only_that_servers_queries() {
        let mut map = QueryMap::new();
        map.register(ServerQuery { id: QueryId(1), server_id: ServerId(1), msg_id: 1, msg_type: 0 });
        map.register(ServerQuery { id: QueryId(2), server_id: ServerId(2), msg_id: 1, msg_type: 0 });

        let cancelled = map.cancel_for_server(ServerId(1));
        assert_eq!(cancelled.len(), 1);
        assert_eq!(map.pending_count(), 1);
    }
}
