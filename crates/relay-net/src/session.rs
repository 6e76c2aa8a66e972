use std::net::SocketAddr;

use futures::{SinkExt, Stream, StreamExt};
use relay_proto::{Command, FrameCodec};
use tokio::{
    io::{ReadHalf, WriteHalf},
    net::TcpStream,
};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{error::RelayError, RelayResult};

/// One accepted TCP socket, split into an independent read half and write
/// half so a connection's read loop and its outbound-queue drain can each
/// own their side without fighting over a single `Framed`.
pub struct RelaySession {
    r: FramedRead<ReadHalf<TcpStream>, FrameCodec>,
    w: FramedWrite<WriteHalf<TcpStream>, FrameCodec>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl RelaySession {
    pub fn new(io: TcpStream) -> std::io::Result<Self> {
        let local_addr = io.local_addr()?;
        let peer_addr = io.peer_addr()?;
        let (r, w) = tokio::io::split(io);
        Ok(Self {
            r: FramedRead::new(r, FrameCodec::new()),
            w: FramedWrite::new(w, FrameCodec::new()),
            local_addr,
            peer_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn read_command(&mut self) -> RelayResult<Command> {
        match self.r.next().await {
            Some(Ok(cmd)) => Ok(cmd),
            Some(Err(e)) => Err(e.into()),
            None => Err(RelayError::Disconnected),
        }
    }

    pub async fn send_command(&mut self, cmd: Command) -> RelayResult<()> {
        self.w.send(cmd).await?;
        Ok(())
    }

    pub async fn close(mut self) -> RelayResult<()> {
        self.w.close().await?;
        Ok(())
    }
}

impl Stream for RelaySession {
    type Item = RelayResult<Command>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.get_mut()
            .r
            .poll_next_unpin(cx)
            .map(|opt| opt.map(|res| res.map_err(RelayError::from)))
    }
}
