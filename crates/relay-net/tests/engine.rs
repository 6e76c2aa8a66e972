//! End-to-end scenarios against a real loopback socket: one server task,
//! several plain TCP clients speaking the wire protocol directly.
//!
//! Connecting a client broadcasts a `CLIENT_UPDATE` about it to every other
//! connected client, so with more than one client around, unrelated
//! presence traffic can interleave with whatever a test is waiting for.
//! Tests filter by message type rather than assuming an exact sequence.

use std::net::IpAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relay_net::{Server, ServerConfig};
use relay_proto::{primitives::decode_json, Command, FrameCodec, MessageType};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

async fn spawn_server() -> (std::net::SocketAddr, CancellationToken) {
    let config = ServerConfig {
        listen_ip: IpAddr::from([127, 0, 0, 1]),
        port: 0,
        outbound_queue_cap: 32,
        ..ServerConfig::default()
    };
    let server = Server::new(config);
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let ct = CancellationToken::new();
    tokio::spawn(server.serve(listener, ct.clone()));
    (addr, ct)
}

async fn client(addr: std::net::SocketAddr) -> Framed<TcpStream, FrameCodec> {
    let stream = TcpStream::connect(addr).await.unwrap();
    Framed::new(stream, FrameCodec::new())
}

fn join(room: &str) -> Command {
    let mut buf = bytes::BytesMut::new();
    relay_proto::primitives::encode_string(&mut buf, room).unwrap();
    Command::control(MessageType::JoinRoom, buf.freeze())
}

async fn recv(framed: &mut Framed<TcpStream, FrameCodec>) -> Command {
    tokio::time::timeout(Duration::from_secs(2), framed.next())
        .await
        .expect("timed out waiting for a command")
        .expect("stream ended")
        .expect("decode error")
}

/// Reads commands until one of type `ty`, discarding anything else
/// (e.g. `CLIENT_UPDATE` presence noise from other connections).
async fn recv_matching(framed: &mut Framed<TcpStream, FrameCodec>, ty: MessageType) -> Command {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let cmd = framed.next().await.expect("stream ended").expect("decode error");
            if cmd.message_type() == Some(ty) {
                return cmd;
            }
        }
    })
    .await
    .expect("timed out waiting for expected message type")
}

#[tokio::test]
async fn join_creates_room_and_broadcasts_descriptor() {
    let (addr, _ct) = spawn_server().await;
    let mut a = client(addr).await;

    // Self presence notification from `accept`, unrelated to the join below.
    let _initial_self_update = recv(&mut a).await;

    a.send(join("room-a")).await.unwrap();

    let content = recv_matching(&mut a, MessageType::Content).await;
    assert_eq!(content.data().len(), 0);

    let _room_update = recv_matching(&mut a, MessageType::RoomUpdate).await;
    let client_update = recv_matching(&mut a, MessageType::ClientUpdate).await;
    let mut buf = client_update.data().clone();
    let body: serde_json::Value = decode_json(&mut buf).unwrap();
    // Keyed by the client's own id, not wrapped in a separate envelope field.
    let (_, diff) = body.as_object().unwrap().iter().next().expect("one entry");
    assert_eq!(diff["room"], "room-a");
}

#[tokio::test]
async fn second_joiner_replays_log_and_sender_gets_no_echo() {
    let (addr, _ct) = spawn_server().await;
    let mut a = client(addr).await;

    a.send(join("room-a")).await.unwrap();
    let _content = recv_matching(&mut a, MessageType::Content).await;
    let _room_update = recv_matching(&mut a, MessageType::RoomUpdate).await;
    let _client_update = recv_matching(&mut a, MessageType::ClientUpdate).await;

    let app_cmd = Command::new(5000, &b"edit"[..]);
    a.send(app_cmd.clone()).await.unwrap();
    // Sender observes the resulting byte-size/command-count room update,
    // never a relayed copy of its own command.
    let _update = recv_matching(&mut a, MessageType::RoomUpdate).await;

    let mut b = client(addr).await;
    b.send(join("room-a")).await.unwrap();

    let clear_content = recv_matching(&mut b, MessageType::ClearContent).await;
    assert_eq!(clear_content.data().len(), 0);

    // The only non-control message b can receive next is the replayed log
    // entry: nothing else targets b directly at this point.
    let replayed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let cmd = b.next().await.unwrap().unwrap();
            if cmd.message_type().is_none() {
                return cmd;
            }
        }
    })
    .await
    .expect("timed out waiting for replayed command");

    assert_eq!(replayed.ty(), 5000);
    assert_eq!(replayed.data(), app_cmd.data());
}

#[tokio::test]
async fn disconnect_notifies_remaining_clients() {
    let (addr, _ct) = spawn_server().await;
    let mut a = client(addr).await;

    a.send(join("room-a")).await.unwrap();
    let _content = recv_matching(&mut a, MessageType::Content).await;
    let _room_update = recv_matching(&mut a, MessageType::RoomUpdate).await;
    let _client_update = recv_matching(&mut a, MessageType::ClientUpdate).await;

    let b = client(addr).await;
    let _b_self_update = recv_matching(&mut a, MessageType::ClientUpdate).await;

    drop(b);

    let disconnected = recv_matching(&mut a, MessageType::ClientDisconnected).await;
    let mut buf = disconnected.data().clone();
    let _id: serde_json::Value = decode_json(&mut buf).unwrap();
}

#[tokio::test]
async fn list_rooms_round_trips_a_created_room() {
    let (addr, _ct) = spawn_server().await;
    let mut a = client(addr).await;

    a.send(join("room-a")).await.unwrap();
    let _content = recv_matching(&mut a, MessageType::Content).await;
    let _room_update = recv_matching(&mut a, MessageType::RoomUpdate).await;
    let _client_update = recv_matching(&mut a, MessageType::ClientUpdate).await;

    a.send(Command::control(MessageType::ListRooms, &b""[..]))
        .await
        .unwrap();

    let listing = recv_matching(&mut a, MessageType::ListRooms).await;
    let mut buf = listing.data().clone();
    let rooms: serde_json::Value = decode_json(&mut buf).unwrap();
    assert_eq!(rooms.as_array().map(Vec::len), Some(1));
}
