/*!
 * Command Execution
 *
 * The engine wires the store, the append-only log, and the optional
 * replication leader behind one `dispatch` entry point. Every accepted
 * mutation follows the same path: apply to the store, append to the
 * log, broadcast to followers - with the first step ordered before the
 * append so a compaction snapshot taken in between already contains the
 * write the log line records.
 */

use crate::aof::Aof;
use crate::protocol::{Command, Request, Response};
use crate::replication::Leader;
use crate::storage::Store;
use std::sync::Arc;

/// One node's command execution unit.
///
/// A standalone node runs without a leader handle; a follower node also
/// runs without one (inbound replication bypasses the engine and goes
/// straight to the store).
pub struct Engine {
    store: Arc<Store>,
    aof: Option<Arc<Aof>>,
    leader: Option<Arc<Leader>>,
}

impl Engine {
    pub fn new(store: Arc<Store>, aof: Option<Arc<Aof>>, leader: Option<Arc<Leader>>) -> Self {
        Self { store, aof, leader }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Execute one client request and produce its response line.
    pub fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Get { key } => match self.store.get(&key) {
                Some(value) => Response::Value(value),
                None => Response::Null,
            },
            Request::Command(cmd) => self.exec(cmd),
        }
    }

    fn exec(&self, cmd: Command) -> Response {
        let applied = match &self.leader {
            // apply + broadcast run under the leader's session lock so a
            // concurrent follower sync cannot land between them
            Some(leader) => leader.publish(&cmd, || self.commit(&cmd)),
            None => self.commit(&cmd),
        };
        match (&cmd, applied) {
            (Command::Set { .. }, true) => Response::Ok,
            (Command::Set { .. }, false) => Response::Error("key or value too large".into()),
            (Command::Delete { .. }, true) => Response::Ok,
            (Command::Delete { .. }, false) => Response::NotFound,
        }
    }

    /// Store first, then log; a no-op (rejected set, delete of an absent
    /// key) is neither logged nor broadcast.
    fn commit(&self, cmd: &Command) -> bool {
        let applied = self.store.apply(cmd);
        if applied {
            if let Some(aof) = &self.aof {
                aof.append(cmd);
            }
        }
        applied
    }
}
