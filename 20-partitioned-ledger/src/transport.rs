//! Persistent line-delimited socket channel.
//!
//! A [`Channel`] is the dialling side of a connection: it announces itself
//! with an identity frame, reads replies with a deadline and can rebuild its
//! socket after a timeout or a reset. Re-authentication carries the logical
//! session across the new physical connection.

use std::{io, time::Duration};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    error::TransportError,
    protocol::{ClientRequest, Identity, REAUTH_OK, UserId},
};

const LINE_ENDINGS: &[char] = &['\n', '\r'];
/// Payload some peers send in place of a reply when they have nothing to say.
const SENTINEL: &str = "-1";

/// Default read deadline on node-to-node links.
pub const PEER_READ_TIMEOUT: Duration = Duration::from_secs(7);

/// Reads one line, stripping the terminator. `Ok(None)` means end of stream.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

/// Like [`read_line`], but gives up after `deadline` when one is set.
pub async fn read_line_within<R>(
    reader: &mut R,
    deadline: Option<Duration>,
) -> Result<Option<String>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    match deadline {
        Some(deadline) => match timeout(deadline, read_line(reader)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::Timeout),
        },
        None => Ok(read_line(reader).await?),
    }
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}

pub struct Channel {
    addr: String,
    identity: Identity,
    read_timeout: Duration,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Channel {
    /// Opens a socket to `addr` and sends the identity frame.
    pub async fn connect(
        addr: &str,
        identity: Identity,
        read_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let (reader, writer) = open(addr, identity).await?;
        info!(peer = %addr, identity = identity.as_str(), "channel connected");
        Ok(Self {
            addr: addr.to_string(),
            identity,
            read_timeout,
            reader,
            writer,
        })
    }

    pub fn peer(&self) -> &str {
        &self.addr
    }

    pub async fn send(&mut self, line: &str) -> Result<(), TransportError> {
        debug!(peer = %self.addr, line, "sending");
        write_line(&mut self.writer, line).await?;
        Ok(())
    }

    /// Waits for the next reply line.
    ///
    /// Fails with [`TransportError::Timeout`] when the deadline passes or the
    /// peer answers with an empty or sentinel payload.
    pub async fn read(&mut self) -> Result<String, TransportError> {
        match read_line_within(&mut self.reader, Some(self.read_timeout)).await? {
            None => Err(TransportError::Closed),
            Some(line) if line.trim().is_empty() || line.trim() == SENTINEL => {
                Err(TransportError::Timeout)
            }
            Some(line) => Ok(line),
        }
    }

    /// Sends one line and waits for its reply.
    pub async fn request(&mut self, line: &str) -> Result<String, TransportError> {
        self.send(line).await?;
        self.read().await
    }

    /// Sends a request, reconnecting and resending exactly once if the first
    /// attempt times out or the connection breaks.
    pub async fn query(
        &mut self,
        line: &str,
        reauth: Option<UserId>,
    ) -> Result<String, TransportError> {
        match self.request(line).await {
            Ok(reply) => Ok(reply),
            Err(err) if err.is_recoverable() => {
                warn!(peer = %self.addr, error = %err, "request failed, reconnecting");
                self.reconnect(reauth).await?;
                self.request(line).await
            }
            Err(err) => Err(err),
        }
    }

    /// Replaces the socket with a fresh connection to the same peer.
    ///
    /// With `reauth` set, a `RE <user>` frame follows the identity frame and
    /// the peer must answer `OK` before the channel is usable again.
    pub async fn reconnect(&mut self, reauth: Option<UserId>) -> Result<(), TransportError> {
        let (reader, writer) = open(&self.addr, self.identity).await?;
        self.reader = reader;
        self.writer = writer;
        info!(peer = %self.addr, "channel reconnected");

        if let Some(user_id) = reauth {
            let reply = self
                .request(&ClientRequest::Reauth { user_id }.to_line())
                .await?;
            if reply.trim() != REAUTH_OK {
                return Err(TransportError::Rejected(reply));
            }
            debug!(peer = %self.addr, user_id, "session re-authenticated");
        }
        Ok(())
    }

    pub async fn close(mut self) {
        if let Err(error) = self.writer.shutdown().await {
            debug!(?error, peer = %self.addr, "failed to shutdown channel cleanly");
        }
    }
}

async fn open(
    addr: &str,
    identity: Identity,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf), TransportError> {
    let stream = TcpStream::connect(addr).await?;
    let (reader, mut writer) = stream.into_split();
    write_line(&mut writer, identity.as_str()).await?;
    Ok((BufReader::new(reader), writer))
}
