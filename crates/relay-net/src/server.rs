use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use indexmap::IndexMap;
use parking_lot::Mutex;
use relay_proto::{primitives::encode_json, Command, MessageType};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::{wrappers::TcpListenerStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{
    connection::{Connection, ConnectionShared},
    metadata::{client_metadata, Metadata},
    room::Room,
    RelayError, RelayResult, ServerConfig,
};

struct ServerInner {
    rooms: IndexMap<String, Arc<Room>>,
    unjoined: IndexMap<String, Arc<ConnectionShared>>,
}

/// The global registry: the set of rooms, the set of connected-but-unjoined
/// connections, and the sole arbiter for operations that span more than one
/// of either.
pub struct Server {
    config: ServerConfig,
    inner: Mutex<ServerInner>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(ServerInner {
                rooms: IndexMap::new(),
                unjoined: IndexMap::new(),
            }),
        })
    }

    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        // tokio's TcpListener has no knob for the listen backlog; the OS
        // default applies regardless of `config.backlog`.
        TcpListener::bind((self.config.listen_ip, self.config.port)).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, ct: CancellationToken) {
        let mut incoming = TcpListenerStream::new(listener);
        loop {
            tokio::select! {
                biased;
                _ = ct.cancelled() => {
                    log::info!("accept loop shutting down");
                    break;
                }
                next = incoming.next() => match next {
                    Some(Ok(socket)) => self.accept(socket, ct.clone()),
                    Some(Err(err)) => log::warn!("accept error: {err}"),
                    None => break,
                },
            }
        }
    }

    pub fn accept(self: &Arc<Self>, socket: TcpStream, ct: CancellationToken) {
        let session = match crate::session::RelaySession::new(socket) {
            Ok(session) => session,
            Err(err) => {
                log::warn!("accept: {err}");
                return;
            }
        };
        let peer_addr = session.peer_addr();
        let (shared, rx) =
            ConnectionShared::channel(peer_addr, self.config.outbound_queue_cap);
        let addr = shared.addr().to_string();

        {
            let mut inner = self.inner.lock();
            inner.unjoined.insert(addr.clone(), shared.clone());
        }

        log::info!("{addr}: connected (local {})", session.local_addr());
        self.broadcast_client_update(&addr, shared.metadata_snapshot());

        let conn = Connection::new(shared, session, rx, self.clone());
        tokio::spawn(conn.run(ct));
    }

    /// Joins `conn` to the room named `room_name`, creating it if it does
    /// not exist yet. See the component design for the exact ordering this
    /// preserves between log replay and membership.
    pub fn join(self: &Arc<Self>, conn: Arc<ConnectionShared>, room_name: &str) {
        let addr = conn.addr().to_string();

        let (room, existed) = {
            let mut inner = self.inner.lock();
            inner.unjoined.shift_remove(&addr);
            if let Some(room) = inner.rooms.get(room_name) {
                room.set_join_flag(true);
                (room.clone(), true)
            } else {
                (Arc::new(Room::new(room_name)), false)
            }
        };

        if existed {
            conn.enqueue(Command::control(MessageType::ClearContent, Bytes::new()));
            room.join_existing(conn.clone());
            room.set_join_flag(false);
        } else {
            conn.enqueue(Command::control(MessageType::Content, Bytes::new()));
            room.add_first_member(conn.clone());
            {
                let mut inner = self.inner.lock();
                inner.rooms.insert(room_name.to_string(), room.clone());
            }
            self.broadcast_room_update(room_name, room.metadata_snapshot());
        }

        let mut patch = Metadata::new();
        patch.insert(client_metadata::ROOM.into(), json!(room_name));
        if let Some(diff) = conn.apply_metadata_patch(patch) {
            self.broadcast_client_update(&addr, diff);
        }
    }

    /// Removes `conn` from `room_name`'s member list and returns it to the
    /// unjoined set. If the room is now empty and is not `keep_open`, it is
    /// deleted as a side effect.
    pub fn leave(self: &Arc<Self>, conn: &Arc<ConnectionShared>, room_name: &str) {
        let addr = conn.addr().to_string();

        let room = {
            let inner = self.inner.lock();
            inner.rooms.get(room_name).cloned()
        };
        let Some(room) = room else {
            log::warn!("leave({room_name}): no such room");
            return;
        };

        let now_empty = room.remove_client(&addr);

        {
            let mut inner = self.inner.lock();
            inner.unjoined.insert(addr.clone(), conn.clone());
        }

        let mut patch = Metadata::new();
        patch.insert(client_metadata::ROOM.into(), Value::Null);
        if let Some(diff) = conn.apply_metadata_patch(patch) {
            self.broadcast_client_update(&addr, diff);
        }

        if now_empty && !room.keep_open() {
            let _ = self.delete_room(room_name);
        }
    }

    /// Deletes `room_name` if it exists, is empty, and has no join in
    /// progress. Unlike the automatic cleanup in [`Self::leave`], this does
    /// not consult `keep_open` — an explicit delete always wins.
    pub fn delete_room(self: &Arc<Self>, room_name: &str) -> RelayResult<()> {
        let room = {
            let mut inner = self.inner.lock();
            let room = inner
                .rooms
                .get(room_name)
                .cloned()
                .ok_or_else(|| RelayError::RoomNotFound(room_name.to_string()))?;
            if !room.is_empty() {
                return Err(RelayError::RoomNotEmpty(room_name.to_string()));
            }
            if room.join_flag() {
                return Err(RelayError::RoomJoining(room_name.to_string()));
            }
            inner.rooms.shift_remove(room_name);
            room
        };
        drop(room);

        let mut payload = BytesMut::new();
        if encode_json(&mut payload, &json!(room_name)).is_ok() {
            self.broadcast_all(Command::control(MessageType::RoomDeleted, payload.freeze()));
        }
        Ok(())
    }

    pub fn set_room_metadata(&self, room_name: &str, patch: Metadata) -> RelayResult<()> {
        let room = {
            let inner = self.inner.lock();
            inner
                .rooms
                .get(room_name)
                .cloned()
                .ok_or_else(|| RelayError::RoomNotFound(room_name.to_string()))?
        };
        if let Some(diff) = room.set_metadata(patch) {
            self.broadcast_room_update(room_name, diff);
        }
        Ok(())
    }

    pub fn set_room_keep_open(&self, room_name: &str, value: bool) -> RelayResult<()> {
        let room = {
            let inner = self.inner.lock();
            inner
                .rooms
                .get(room_name)
                .cloned()
                .ok_or_else(|| RelayError::RoomNotFound(room_name.to_string()))?
        };
        if let Some(diff) = room.set_keep_open(value) {
            self.broadcast_room_update(room_name, diff);
        }
        Ok(())
    }

    pub fn set_client_metadata(&self, conn: &Arc<ConnectionShared>, patch: Metadata) {
        if let Some(diff) = conn.apply_metadata_patch(patch) {
            self.broadcast_client_update(conn.addr(), diff);
        }
    }

    /// Forwards a room-scoped application command to its room, then
    /// publishes the resulting `ROOM_UPDATE` diff, if any, to everyone.
    pub fn dispatch_room_command(&self, room_name: &str, cmd: Command, sender_addr: &str) {
        let room = {
            let inner = self.inner.lock();
            inner.rooms.get(room_name).cloned()
        };
        let Some(room) = room else {
            log::warn!("dropping command for missing room {room_name}");
            return;
        };
        if let Some(diff) = room.append_and_dispatch(cmd, sender_addr) {
            self.broadcast_room_update(room_name, diff);
        }
    }

    pub fn handle_disconnect(&self, conn: &Arc<ConnectionShared>, current_room: Option<&str>) {
        let addr = conn.addr().to_string();
        if let Some(room_name) = current_room {
            if let Some(room) = {
                let inner = self.inner.lock();
                inner.rooms.get(room_name).cloned()
            } {
                let now_empty = room.remove_client(&addr);

                let mut patch = Metadata::new();
                patch.insert(client_metadata::ROOM.into(), Value::Null);
                if let Some(diff) = conn.apply_metadata_patch(patch) {
                    self.broadcast_client_update(&addr, diff);
                }

                if now_empty && !room.keep_open() {
                    let _ = self.delete_room(room_name);
                }
            }
        }

        {
            let mut inner = self.inner.lock();
            inner.unjoined.shift_remove(&addr);
        }

        self.broadcast_client_disconnected(&addr);
    }

    /// Every live connection: each room's members plus the unjoined set.
    /// Takes the server lock for the whole call and, per room, that room's
    /// own lock just long enough to snapshot its members.
    pub fn all_connections(&self) -> Vec<Arc<ConnectionShared>> {
        let inner = self.inner.lock();
        let mut all: Vec<_> = inner.unjoined.values().cloned().collect();
        for room in inner.rooms.values() {
            all.extend(room.members_snapshot());
        }
        all
    }

    pub fn list_all_clients_snapshot(&self) -> Command {
        let clients: Vec<Metadata> = self
            .all_connections()
            .into_iter()
            .map(|c| c.metadata_snapshot())
            .collect();
        let mut payload = BytesMut::new();
        let _ = encode_json(&mut payload, &json!(clients));
        Command::control(MessageType::ListAllClients, payload.freeze())
    }

    pub fn list_rooms_snapshot(&self) -> Command {
        let rooms: Vec<Value> = {
            let inner = self.inner.lock();
            inner
                .rooms
                .values()
                .map(|room| {
                    let mut descriptor = room.metadata_snapshot();
                    descriptor.insert("name".into(), json!(room.name()));
                    Value::Object(descriptor)
                })
                .collect()
        };
        let mut payload = BytesMut::new();
        let _ = encode_json(&mut payload, &json!(rooms));
        Command::control(MessageType::ListRooms, payload.freeze())
    }

    fn broadcast_all(&self, cmd: Command) {
        let targets = self.all_connections();
        log::trace!("broadcasting ty={:#x} to {} connections", cmd.ty(), targets.len());
        for conn in targets {
            conn.enqueue(cmd.clone());
        }
    }

    /// Wraps `diff` keyed by `client_id` itself, e.g. `{"1.2.3.4:5": {...}}`,
    /// rather than a separate envelope field.
    fn broadcast_client_update(&self, client_id: &str, diff: Metadata) {
        if diff.is_empty() {
            return;
        }
        let mut body = Metadata::new();
        body.insert(client_id.to_string(), Value::Object(diff));
        let mut payload = BytesMut::new();
        if encode_json(&mut payload, &Value::Object(body)).is_ok() {
            self.broadcast_all(Command::control(MessageType::ClientUpdate, payload.freeze()));
        }
    }

    /// Wraps `diff` keyed by `room_name` itself, matching `broadcast_client_update`.
    fn broadcast_room_update(&self, room_name: &str, diff: Metadata) {
        if diff.is_empty() {
            return;
        }
        let mut body = Metadata::new();
        body.insert(room_name.to_string(), Value::Object(diff));
        let mut payload = BytesMut::new();
        if encode_json(&mut payload, &Value::Object(body)).is_ok() {
            self.broadcast_all(Command::control(MessageType::RoomUpdate, payload.freeze()));
        }
    }

    fn broadcast_client_disconnected(&self, client_id: &str) {
        let mut payload = BytesMut::new();
        if encode_json(&mut payload, &json!(client_id)).is_ok() {
            self.broadcast_all(Command::control(
                MessageType::ClientDisconnected,
                payload.freeze(),
            ));
        }
    }
}
