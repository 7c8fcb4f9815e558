//! In-process coordination between servers sharing one address space.
//!
//! [`LocalCluster`] routes RPCs straight to the target server's inbound
//! handlers. It backs the crate's cluster tests, where it doubles as a
//! fault injector: links can be severed and whole servers marked down, in
//! which case calls fail like a refused connection would.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::rpc::{
    AppendEntriesReq, AppendEntriesRes, Coordination, RequestVoteReq, RequestVoteRes,
};
use super::server::RaftServer;
use crate::error::{ArborError, Result};
use crate::types::NodeId;

/// Registry of in-process servers addressable by id.
#[derive(Default)]
pub struct LocalCluster {
    servers: RwLock<HashMap<NodeId, Arc<RaftServer>>>,
    down: RwLock<HashSet<NodeId>>,
    severed: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl LocalCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a server under its id.
    pub fn register(&self, id: NodeId, server: Arc<RaftServer>) {
        self.servers.write().insert(id, server);
    }

    /// Remove a server from the registry. Subsequent RPCs to it fail.
    pub fn deregister(&self, id: NodeId) {
        self.servers.write().remove(&id);
    }

    /// Mark a server up or down. RPCs from and to a down server fail.
    pub fn set_down(&self, id: NodeId, down: bool) {
        if down {
            self.down.write().insert(id);
        } else {
            self.down.write().remove(&id);
        }
    }

    /// Sever the link between two servers, failing RPCs in both directions.
    pub fn sever(&self, a: NodeId, b: NodeId) {
        self.severed.write().insert(link(a, b));
    }

    /// Restore a previously severed link.
    pub fn heal(&self, a: NodeId, b: NodeId) {
        self.severed.write().remove(&link(a, b));
    }

    /// Transport handle for the server with the given id.
    pub fn coordination(self: &Arc<Self>, origin: NodeId) -> Arc<LocalCoordination> {
        Arc::new(LocalCoordination {
            cluster: Arc::clone(self),
            origin,
        })
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<Arc<RaftServer>> {
        let unreachable = |reason: &str| ArborError::RpcFailure {
            peer: to,
            reason: reason.to_string(),
        };

        {
            let down = self.down.read();
            if down.contains(&from) || down.contains(&to) {
                return Err(unreachable("server down"));
            }
        }
        if self.severed.read().contains(&link(from, to)) {
            return Err(unreachable("link severed"));
        }

        self.servers
            .read()
            .get(&to)
            .cloned()
            .ok_or_else(|| unreachable("unknown peer"))
    }
}

fn link(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// A server's outbound transport within a [`LocalCluster`].
pub struct LocalCoordination {
    cluster: Arc<LocalCluster>,
    origin: NodeId,
}

impl Coordination for LocalCoordination {
    fn request_vote(&self, target: NodeId, request: RequestVoteReq) -> Result<RequestVoteRes> {
        let server = self.cluster.route(self.origin, target)?;
        Ok(server.handle_request_vote(request))
    }

    fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesReq,
    ) -> Result<AppendEntriesRes> {
        let server = self.cluster.route(self.origin, target)?;
        Ok(server.handle_append_entries(request))
    }
}
