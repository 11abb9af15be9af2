//! Path registry and broadcast-room membership.
//!
//! `path -> connection` and its reverse live under one lock so a lookup never
//! sees half of a registration. Rooms have their own lock. When both are
//! needed the registry lock is taken first.

use std::collections::{HashMap, HashSet};

use chatroom_core::{BusPath, ConnectionId, RoomName};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

#[derive(Default)]
pub(crate) struct Index {
    paths: HashMap<BusPath, ConnectionId>,
    owners: HashMap<ConnectionId, BusPath>,
}

impl Index {
    pub(crate) fn lookup(&self, path: &str) -> Option<&ConnectionId> {
        self.paths.get(path)
    }

    pub(crate) fn path_of(&self, conn: &ConnectionId) -> Option<&BusPath> {
        self.owners.get(conn)
    }
}

/// What a registration changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Registered {
    /// Connection that owned the path before, if any other.
    pub superseded: Option<ConnectionId>,
    /// Path this connection owned before, if it was a different one.
    pub released: Option<BusPath>,
}

/// Room membership plus which memberships came from an explicit subscribe.
#[derive(Default)]
struct Rooms {
    members: HashMap<RoomName, HashSet<ConnectionId>>,
    subscribed: HashMap<ConnectionId, HashSet<RoomName>>,
}

impl Rooms {
    fn join(&mut self, conn: &ConnectionId, room: RoomName) {
        let _ = self.members.entry(room).or_default().insert(conn.clone());
    }

    /// Leave `room` unless `conn` subscribed to it.
    fn leave_owned(&mut self, conn: &ConnectionId, room: &RoomName) {
        let subscribed = self
            .subscribed
            .get(conn)
            .is_some_and(|rooms| rooms.contains(room));
        if subscribed {
            return;
        }
        if let Some(members) = self.members.get_mut(room) {
            let _ = members.remove(conn);
            if members.is_empty() {
                let _ = self.members.remove(room);
            }
        }
    }
}

/// Broker-side `path -> connection` map and broadcast rooms.
///
/// A path has at most one owner and a connection owns at most one path.
#[derive(Default)]
pub struct PathRegistry {
    index: Mutex<Index>,
    rooms: Mutex<Rooms>,
}

impl PathRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn index(&self) -> MutexGuard<'_, Index> {
        self.index.lock()
    }

    /// Map `path` to `conn` (last writer wins) and join its broadcast room.
    ///
    /// A superseded owner loses the path entirely and leaves the room it
    /// joined by registering. A connection moving to a new path leaves its
    /// old path's room the same way.
    pub fn register(&self, conn: &ConnectionId, path: BusPath) -> Registered {
        let mut index = self.index.lock();
        let mut rooms = self.rooms.lock();
        let mut outcome = Registered::default();

        if let Some(previous) = index.owners.get(conn).cloned() {
            if previous != path {
                if index.paths.get(&previous) == Some(conn) {
                    let _ = index.paths.remove(&previous);
                }
                rooms.leave_owned(conn, &previous.broadcast_room());
                outcome.released = Some(previous);
            }
        }

        if let Some(old) = index.paths.insert(path.clone(), conn.clone()) {
            if &old != conn {
                info!(path = %path, old_conn = %old, new_conn = %conn, "path superseded");
                let _ = index.owners.remove(&old);
                rooms.leave_owned(&old, &path.broadcast_room());
                outcome.superseded = Some(old);
            }
        }
        let _ = index.owners.insert(conn.clone(), path.clone());
        rooms.join(conn, path.broadcast_room());
        drop(rooms);
        drop(index);

        debug!(path = %path, conn_id = %conn, "path registered");
        outcome
    }

    /// Forget `conn`'s path and leave the room it joined by registering. The
    /// `path -> connection` entry is only removed while it still points at
    /// `conn`. Idempotent.
    pub fn unregister(&self, conn: &ConnectionId) -> Option<BusPath> {
        let mut index = self.index.lock();
        let path = release(&mut index, conn)?;
        self.rooms.lock().leave_owned(conn, &path.broadcast_room());
        Some(path)
    }

    /// Remove every trace of `conn`: its path and all room memberships.
    pub fn disconnect(&self, conn: &ConnectionId) -> Option<BusPath> {
        let mut index = self.index.lock();
        let mut rooms = self.rooms.lock();
        rooms.members.retain(|_, members| {
            let _ = members.remove(conn);
            !members.is_empty()
        });
        let _ = rooms.subscribed.remove(conn);
        drop(rooms);
        release(&mut index, conn)
    }

    /// Join `room` on an explicit subscribe. Such a membership survives the
    /// connection registering elsewhere.
    pub fn subscribe(&self, conn: &ConnectionId, room: RoomName) {
        let mut rooms = self.rooms.lock();
        let _ = rooms
            .subscribed
            .entry(conn.clone())
            .or_default()
            .insert(room.clone());
        rooms.join(conn, room);
    }

    /// Current members of `room`, in no particular order.
    pub fn members(&self, room: &RoomName) -> Vec<ConnectionId> {
        self.rooms
            .lock()
            .members
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Connection currently owning `path`.
    pub fn lookup(&self, path: &str) -> Option<ConnectionId> {
        self.index.lock().lookup(path).cloned()
    }

    /// Path currently owned by `conn`.
    pub fn path_of(&self, conn: &ConnectionId) -> Option<BusPath> {
        self.index.lock().path_of(conn).cloned()
    }

    /// Number of registered paths.
    pub fn path_count(&self) -> usize {
        self.index.lock().paths.len()
    }
}

fn release(index: &mut Index, conn: &ConnectionId) -> Option<BusPath> {
    let path = index.owners.remove(conn)?;
    if index.paths.get(&path) == Some(conn) {
        let _ = index.paths.remove(&path);
        debug!(path = %path, conn_id = %conn, "path unregistered");
    }
    Some(path)
}
