use futures::{SinkExt, StreamExt};
use plug_in_error::{PlugInError, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::WireCodec;
use crate::messages::Message;

/// Outgoing bytes are buffered up to this size before the writer flushes
/// on its own.
pub const WRITE_BUFFER_SIZE: usize = 4096;

/// Read half of a plug-in connection
pub struct MessageReader<R> {
    inner: FramedRead<R, WireCodec>,
}

impl<R> MessageReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            inner: FramedRead::new(reader, WireCodec::new()),
        }
    }

    /// Receive the next message.
    ///
    /// Returns None once the peer has closed its end cleanly.
    pub async fn next(&mut self) -> Option<Result<Message>> {
        self.inner.next().await
    }

    /// Receive the next message, treating end of stream as an error
    pub async fn recv(&mut self) -> Result<Message> {
        match self.inner.next().await {
            Some(result) => result,
            None => Err(PlugInError::Closed),
        }
    }
}

/// Write half of a plug-in connection.
///
/// Messages queued with [`MessageWriter::feed`] sit in a bounded buffer;
/// they reach the peer when the buffer fills or on
/// [`MessageWriter::flush`].
pub struct MessageWriter<W> {
    inner: FramedWrite<W, WireCodec>,
}

impl<W> MessageWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W) -> Self {
        let mut inner = FramedWrite::new(writer, WireCodec::new());
        inner.set_backpressure_boundary(WRITE_BUFFER_SIZE);
        Self { inner }
    }

    /// Queue a message without forcing it out
    pub async fn feed(&mut self, message: Message) -> Result<()> {
        self.inner.feed(message).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await
    }

    /// Queue a message and flush everything buffered so far
    pub async fn send(&mut self, message: Message) -> Result<()> {
        self.inner.send(message).await
    }

    pub fn get_ref(&self) -> &W {
        self.inner.get_ref()
    }
}

/// Bidirectional transport over any pair of byte streams
pub struct Transport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    reader: MessageReader<R>,
    writer: MessageWriter<W>,
}

impl<R, W> Transport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new_with_streams(reader: R, writer: W) -> Self {
        Self {
            reader: MessageReader::new(reader),
            writer: MessageWriter::new(writer),
        }
    }

    pub async fn send(&mut self, message: Message) -> Result<()> {
        self.writer.send(message).await
    }

    pub async fn feed(&mut self, message: Message) -> Result<()> {
        self.writer.feed(message).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await
    }

    /// Receive the next message, `Err(Closed)` on end of stream
    pub async fn recv(&mut self) -> Result<Message> {
        self.reader.recv().await
    }

    /// Send a message and wait for the next one from the peer
    pub async fn request(&mut self, message: Message) -> Result<Message> {
        self.send(message).await?;
        self.recv().await
    }

    pub fn into_split(self) -> (MessageReader<R>, MessageWriter<W>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ProcRun, TileReq};
    use plug_in_types::ParamValue;

    #[tokio::test]
    async fn test_duplex_exchange() {
        let (host, plug_in) = tokio::io::duplex(1024);
        let (host_r, host_w) = tokio::io::split(host);
        let (pi_r, pi_w) = tokio::io::split(plug_in);

        let mut host = Transport::new_with_streams(host_r, host_w);
        let mut plug_in = Transport::new_with_streams(pi_r, pi_w);

        let run = Message::ProcRun(ProcRun {
            name: "plug-in-test".to_string(),
            params: vec![ParamValue::Int32(0)],
        });
        host.send(run.clone()).await.unwrap();
        assert_eq!(plug_in.recv().await.unwrap(), run);

        let req = Message::TileReq(TileReq::put());
        let reply = tokio::spawn(async move {
            let got = plug_in.recv().await.unwrap();
            plug_in.send(Message::TileAck).await.unwrap();
            got
        });
        assert_eq!(host.request(req.clone()).await.unwrap(), Message::TileAck);
        assert_eq!(reply.await.unwrap(), req);
    }

    #[tokio::test]
    async fn test_feed_is_not_visible_until_flush() {
        let (host, plug_in) = tokio::io::duplex(1024);
        let (_host_r, host_w) = tokio::io::split(host);
        let (pi_r, _pi_w) = tokio::io::split(plug_in);

        let mut writer = MessageWriter::new(host_w);
        let mut reader = MessageReader::new(pi_r);

        writer.feed(Message::HasInit).await.unwrap();
        let early = tokio::time::timeout(std::time::Duration::from_millis(20), reader.next()).await;
        assert!(early.is_err());

        writer.flush().await.unwrap();
        assert_eq!(reader.recv().await.unwrap(), Message::HasInit);
    }

    #[tokio::test]
    async fn test_eof_reports_closed() {
        let (host, plug_in) = tokio::io::duplex(64);
        drop(host);
        let mut reader = MessageReader::new(plug_in);
        assert!(matches!(reader.recv().await, Err(PlugInError::Closed)));
    }
}
