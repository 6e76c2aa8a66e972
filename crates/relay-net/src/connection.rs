use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use relay_proto::{
    opcode::is_room_scoped,
    primitives::{decode_bool, decode_json, decode_string, encode_string},
    Command, MessageType,
};
use serde_json::Map;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    metadata::{client_metadata, update_dict_and_get_diff, Metadata},
    server::Server,
    session::RelaySession,
    RelayError, RelayResult,
};

/// The part of a connection's state that other tasks (a `Room`, the
/// `Server`) hold a handle to and may touch concurrently: its outbound
/// queue and its metadata. Deliberately does *not* store a reference back
/// to whichever `Room` it has joined — that is tracked only by the
/// connection's own task (see `Connection::current_room`) so there is no
/// `Arc` cycle between `Connection`, `Room` and `Server`.
pub struct ConnectionShared {
    addr: String,
    metadata: Mutex<Metadata>,
    tx: mpsc::Sender<Command>,
}

impl ConnectionShared {
    pub fn channel(
        peer_addr: SocketAddr,
        outbound_cap: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(outbound_cap);
        let addr = peer_addr.to_string();
        let mut metadata = Metadata::new();
        metadata.insert(client_metadata::ID.into(), serde_json::json!(addr));
        metadata.insert(
            client_metadata::IP.into(),
            serde_json::json!(peer_addr.ip().to_string()),
        );
        metadata.insert(client_metadata::PORT.into(), serde_json::json!(peer_addr.port()));
        let shared = Arc::new(Self {
            addr,
            metadata: Mutex::new(metadata),
            tx,
        });
        (shared, rx)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn metadata_snapshot(&self) -> Metadata {
        self.metadata.lock().clone()
    }

    /// Merges `patch` into this connection's metadata, returning the diff
    /// to broadcast as a `CLIENT_UPDATE`, if anything actually changed.
    pub fn apply_metadata_patch(&self, patch: Metadata) -> Option<Metadata> {
        let mut guard = self.metadata.lock();
        let diff = update_dict_and_get_diff(&mut guard, &patch);
        (!diff.is_empty()).then_some(diff)
    }

    /// Enqueues `cmd` for delivery on this connection's write path. A full
    /// queue means a pathologically slow reader: the command is dropped and
    /// a warning logged, rather than blocking the caller.
    pub fn enqueue(&self, cmd: Command) {
        if let Err(err) = self.tx.try_send(cmd) {
            log::warn!("dropping outbound command for {}: {err}", self.addr);
        }
    }
}

/// Drives one accepted socket: the read-then-drain loop described in the
/// connection's component design. Owns the only reference to "which room
/// am I in right now" — nothing else in the process tracks that.
pub struct Connection {
    shared: Arc<ConnectionShared>,
    session: RelaySession,
    outbound: mpsc::Receiver<Command>,
    server: Arc<Server>,
    current_room: Option<String>,
    list_rooms_pending: bool,
    list_clients_pending: bool,
}

impl Connection {
    pub fn new(
        shared: Arc<ConnectionShared>,
        session: RelaySession,
        outbound: mpsc::Receiver<Command>,
        server: Arc<Server>,
    ) -> Self {
        Self {
            shared,
            session,
            outbound,
            server,
            current_room: None,
            list_rooms_pending: false,
            list_clients_pending: false,
        }
    }

    pub fn shared(&self) -> &Arc<ConnectionShared> {
        &self.shared
    }

    pub async fn run(mut self, ct: CancellationToken) {
        let addr = self.shared.addr().to_string();
        loop {
            let cmd = tokio::select! {
                biased;
                _ = ct.cancelled() => {
                    log::debug!("{addr}: shutting down");
                    break;
                }
                cmd = self.session.read_command() => cmd,
            };

            let cmd = match cmd {
                Ok(cmd) => cmd,
                Err(RelayError::Disconnected) => {
                    log::info!("{addr}: disconnected");
                    break;
                }
                Err(err) => {
                    log::error!("{addr}: read error: {err}");
                    break;
                }
            };

            log::trace!("{addr}: read ty={:#x} size={}", cmd.ty(), cmd.byte_size());

            if let Err(err) = self.dispatch(cmd).await {
                log::warn!("{addr}: {err}");
            }

            if let Err(err) = self.drain_outbound().await {
                log::error!("{addr}: write error: {err}");
                break;
            }
        }

        if let Err(err) = self.session.close().await {
            log::debug!("{addr}: error closing session: {err}");
        }
        self.server.handle_disconnect(&self.shared, self.current_room.as_deref());
    }

    async fn drain_outbound(&mut self) -> RelayResult<()> {
        while let Ok(cmd) = self.outbound.try_recv() {
            log::trace!(
                "{}: sending ty={:#x} size={}",
                self.shared.addr(),
                cmd.ty(),
                cmd.byte_size()
            );
            self.session.send_command(cmd).await?;
        }

        if self.list_clients_pending {
            self.list_clients_pending = false;
            self.session
                .send_command(self.server.list_all_clients_snapshot())
                .await?;
        }
        if self.list_rooms_pending {
            self.list_rooms_pending = false;
            self.session
                .send_command(self.server.list_rooms_snapshot())
                .await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, cmd: Command) -> RelayResult<()> {
        let Some(ty) = cmd.message_type() else {
            if is_room_scoped(cmd.ty()) {
                return self.dispatch_room_command(cmd).await;
            }
            log::warn!("{}: unknown control type {:X}", self.shared.addr(), cmd.ty());
            return Ok(());
        };

        log::trace!("{}: dispatching {ty:?}", self.shared.addr());

        match ty {
            MessageType::JoinRoom => self.handle_join(cmd).await,
            MessageType::LeaveRoom => self.handle_leave(cmd).await,
            MessageType::ListRooms => {
                self.list_rooms_pending = true;
                Ok(())
            }
            MessageType::ListAllClients => {
                self.list_clients_pending = true;
                Ok(())
            }
            MessageType::DeleteRoom => {
                let mut buf = cmd.data().clone();
                let room_name = decode_string(&mut buf)?;
                if let Err(err) = self.server.delete_room(&room_name) {
                    log::warn!("delete_room({room_name}) refused: {err}");
                }
                Ok(())
            }
            MessageType::SetClientName => {
                let mut buf = cmd.data().clone();
                let username = decode_string(&mut buf)?;
                let mut patch = Metadata::new();
                patch.insert(client_metadata::USERNAME.into(), serde_json::json!(username));
                self.server.set_client_metadata(&self.shared, patch);
                Ok(())
            }
            MessageType::SetClientMetadata => {
                let mut buf = cmd.data().clone();
                let patch: Map<String, serde_json::Value> = decode_json(&mut buf)?;
                self.server.set_client_metadata(&self.shared, patch);
                Ok(())
            }
            MessageType::SetRoomMetadata => {
                let mut buf = cmd.data().clone();
                let room_name = decode_string(&mut buf)?;
                let patch: Map<String, serde_json::Value> = decode_json(&mut buf)?;
                if let Err(err) = self.server.set_room_metadata(&room_name, patch) {
                    log::warn!("set_room_metadata({room_name}) refused: {err}");
                }
                Ok(())
            }
            MessageType::SetRoomKeepOpen => {
                let mut buf = cmd.data().clone();
                let room_name = decode_string(&mut buf)?;
                let keep_open = decode_bool(&mut buf)?;
                if let Err(err) = self.server.set_room_keep_open(&room_name, keep_open) {
                    log::warn!("set_room_keep_open({room_name}) refused: {err}");
                }
                Ok(())
            }
            MessageType::ClientId => {
                let mut payload = BytesMut::new();
                encode_string(&mut payload, self.shared.addr())?;
                self.shared
                    .enqueue(Command::control(MessageType::ClientId, payload.freeze()));
                Ok(())
            }
            // Server-emitted types are never legal as inbound messages.
            MessageType::Content
            | MessageType::ClearContent
            | MessageType::RoomDeleted
            | MessageType::RoomUpdate
            | MessageType::ClientUpdate
            | MessageType::ClientDisconnected
            | MessageType::SendError => {
                self.send_error(format!("{ty:?} is not a client-issued message"));
                Ok(())
            }
        }
    }

    async fn handle_join(&mut self, cmd: Command) -> RelayResult<()> {
        let mut buf = cmd.data().clone();
        let room_name = decode_string(&mut buf)?;

        if let Some(current) = self.current_room.clone() {
            self.send_error(format!("already in room {current}"));
            return Ok(());
        }

        self.server.join(self.shared.clone(), &room_name);
        self.current_room = Some(room_name);
        Ok(())
    }

    async fn handle_leave(&mut self, cmd: Command) -> RelayResult<()> {
        let mut buf = cmd.data().clone();
        let room_name = decode_string(&mut buf)?;

        if self.current_room.as_deref() != Some(room_name.as_str()) {
            self.send_error(format!("not in room {room_name}"));
            return Ok(());
        }

        self.server.leave(&self.shared, &room_name);
        self.current_room = None;

        let mut payload = BytesMut::new();
        encode_string(&mut payload, &room_name)?;
        self.shared
            .enqueue(Command::control(MessageType::LeaveRoom, payload.freeze()));
        Ok(())
    }

    async fn dispatch_room_command(&mut self, cmd: Command) -> RelayResult<()> {
        let Some(room_name) = self.current_room.clone() else {
            log::warn!(
                "{}: dropping room command {:X}, not in a room",
                self.shared.addr(),
                cmd.ty()
            );
            return Ok(());
        };

        log::trace!(
            "{}: room command ty={:#x} -> {room_name}",
            self.shared.addr(),
            cmd.ty()
        );
        self.server
            .dispatch_room_command(&room_name, cmd, self.shared.addr());
        Ok(())
    }

    fn send_error(&self, message: impl Into<String>) {
        let mut payload = BytesMut::new();
        if encode_string(&mut payload, &message.into()).is_ok() {
            self.shared
                .enqueue(Command::control(MessageType::SendError, payload.freeze()));
        }
    }
}
