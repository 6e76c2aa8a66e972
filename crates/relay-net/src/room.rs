use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use relay_proto::{opcode::is_optimized, Command};
use serde_json::json;

use crate::{
    connection::ConnectionShared,
    metadata::{room_metadata, update_dict_and_get_diff, Metadata},
};

fn leading_path(data: &bytes::Bytes) -> Option<String> {
    let mut buf = data.clone();
    relay_proto::primitives::decode_string(&mut buf).ok()
}

struct RoomInner {
    log: Vec<Command>,
    byte_size: usize,
    keep_open: bool,
    join_flag: bool,
    metadata: Metadata,
    members: IndexMap<String, Arc<ConnectionShared>>,
}

impl RoomInner {
    fn new() -> Self {
        let mut metadata = Metadata::new();
        metadata.insert(room_metadata::KEEP_OPEN.into(), json!(false));
        metadata.insert(room_metadata::COMMAND_COUNT.into(), json!(0));
        metadata.insert(room_metadata::BYTE_SIZE.into(), json!(0));
        Self {
            log: Vec::new(),
            byte_size: 0,
            keep_open: false,
            join_flag: false,
            metadata,
            members: IndexMap::new(),
        }
    }
}

/// A named group of connections sharing a replayable command log.
///
/// All of a room's mutable state lives behind a single lock so every
/// operation below is one atomic step; callers must never call back into
/// the server while holding it (see the crate-level lock-ordering notes).
pub struct Room {
    name: String,
    inner: Mutex<RoomInner>,
}

impl Room {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(RoomInner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().members.is_empty()
    }

    pub fn keep_open(&self) -> bool {
        self.inner.lock().keep_open
    }

    pub fn join_flag(&self) -> bool {
        self.inner.lock().join_flag
    }

    pub fn set_join_flag(&self, value: bool) {
        self.inner.lock().join_flag = value;
    }

    pub fn metadata_snapshot(&self) -> Metadata {
        self.inner.lock().metadata.clone()
    }

    /// Adds the room's first member without replaying a log (there is
    /// nothing to replay yet).
    pub fn add_first_member(&self, conn: Arc<ConnectionShared>) {
        let mut inner = self.inner.lock();
        inner.members.insert(conn.addr().to_string(), conn);
    }

    /// Replays the current log to `conn`, then adds it as a member, as one
    /// atomic step so a concurrent append can never be observed twice or
    /// not at all by the joining connection.
    pub fn join_existing(&self, conn: Arc<ConnectionShared>) {
        let mut inner = self.inner.lock();
        for cmd in inner.log.iter() {
            conn.enqueue(cmd.clone());
        }
        inner.members.insert(conn.addr().to_string(), conn);
    }

    /// Removes `addr` from the member list. Returns `true` if the room is
    /// now empty.
    pub fn remove_client(&self, addr: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.members.shift_remove(addr);
        inner.members.is_empty()
    }

    pub fn members_snapshot(&self) -> Vec<Arc<ConnectionShared>> {
        self.inner.lock().members.values().cloned().collect()
    }

    pub fn member_count(&self) -> usize {
        self.inner.lock().members.len()
    }

    /// Merges `patch` into the room's custom metadata and returns the diff
    /// to broadcast, if any field actually changed.
    pub fn set_metadata(&self, patch: Metadata) -> Option<Metadata> {
        let mut inner = self.inner.lock();
        let diff = update_dict_and_get_diff(&mut inner.metadata, &patch);
        (!diff.is_empty()).then_some(diff)
    }

    pub fn set_keep_open(&self, value: bool) -> Option<Metadata> {
        let mut inner = self.inner.lock();
        inner.keep_open = value;
        let mut patch = Metadata::new();
        patch.insert(room_metadata::KEEP_OPEN.into(), json!(value));
        let diff = update_dict_and_get_diff(&mut inner.metadata, &patch);
        (!diff.is_empty()).then_some(diff)
    }

    /// The hot path: applies the tail-merge rule, appends `cmd` to the log,
    /// and fans it out to every member except `sender_addr`. Returns the
    /// resulting `ROOM_UPDATE` diff (byte size / command count), if any.
    pub fn append_and_dispatch(&self, cmd: Command, sender_addr: &str) -> Option<Metadata> {
        let mut inner = self.inner.lock();

        if is_optimized(cmd.ty()) {
            let merges_last = match inner.log.last() {
                Some(last) if last.ty() == cmd.ty() => {
                    match (leading_path(last.data()), leading_path(cmd.data())) {
                        (Some(a), Some(b)) => a == b,
                        _ => false,
                    }
                }
                _ => false,
            };
            if merges_last {
                let removed = inner.log.pop().expect("checked non-empty above");
                inner.byte_size -= removed.byte_size();
            }
        }

        inner.byte_size += cmd.byte_size();
        inner.log.push(cmd.clone());

        let mut patch = Metadata::new();
        patch.insert(room_metadata::BYTE_SIZE.into(), json!(inner.byte_size));
        patch.insert(room_metadata::COMMAND_COUNT.into(), json!(inner.log.len()));
        let diff = update_dict_and_get_diff(&mut inner.metadata, &patch);

        for (addr, member) in inner.members.iter() {
            if addr != sender_addr {
                member.enqueue(cmd.clone());
            }
        }

        (!diff.is_empty()).then_some(diff)
    }
}
