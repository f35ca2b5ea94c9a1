//! Framed, timeout-bounded access to the worker pipes.
//!
//! - **codec**: newline framing plus armed fixed-length payload frames
//!
//! [`LineChannel`] works over any AsyncRead/AsyncWrite pair: the child's
//! stdout/stdin in production, `tokio::io::duplex` halves in tests.

pub mod codec;

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::{BridgeError, Result};
use crate::protocol::CommandLine;
use codec::{Frame, WireCodec};

pub struct LineChannel<R, W> {
    reader: FramedRead<R, WireCodec>,
    writer: FramedWrite<W, WireCodec>,
}

impl<R, W> LineChannel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(read_half: R, write_half: W) -> Self {
        Self {
            reader: FramedRead::new(read_half, WireCodec::new()),
            writer: FramedWrite::new(write_half, WireCodec::new()),
        }
    }

    /// Write one command line and flush it.
    pub async fn write_line(&mut self, command: &CommandLine) -> Result<()> {
        tracing::debug!(command = %command, "Sending command");
        self.writer
            .send(command)
            .await
            .map_err(|e| BridgeError::ChannelWrite(e.to_string()))
    }

    /// Write a raw payload and flush it.
    pub async fn write_payload(&mut self, payload: Bytes) -> Result<()> {
        tracing::trace!(payload_bytes = payload.len(), "Sending payload");
        self.writer
            .send(payload)
            .await
            .map_err(|e| BridgeError::ChannelWrite(e.to_string()))
    }

    /// Next line from the worker, terminator stripped.
    pub async fn read_line(&mut self, max_wait: Duration) -> Result<String> {
        match self.next_frame(max_wait).await? {
            Frame::Line(line) => {
                tracing::trace!(line = %line, "Received line");
                Ok(line)
            }
            Frame::Payload(_) => Err(BridgeError::desync(
                "payload frame where a line was expected",
            )),
        }
    }

    /// Exactly `len` bytes from the worker.
    pub async fn read_exact(&mut self, len: usize, max_wait: Duration) -> Result<Bytes> {
        self.reader.decoder_mut().expect_payload(len);
        match self.next_frame(max_wait).await? {
            Frame::Payload(bytes) => {
                tracing::trace!(payload_bytes = bytes.len(), "Received payload");
                Ok(bytes)
            }
            Frame::Line(_) => Err(BridgeError::desync("line frame where a payload was expected")),
        }
    }

    async fn next_frame(&mut self, max_wait: Duration) -> Result<Frame> {
        match tokio::time::timeout(max_wait, self.reader.next()).await {
            Err(_) => Err(BridgeError::ChannelTimeout(max_wait)),
            Ok(None) => Err(BridgeError::ChannelClosed(
                "worker closed its output".to_string(),
            )),
            Ok(Some(Err(e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(BridgeError::ChannelClosed(e.to_string()))
            }
            Ok(Some(Err(e))) if e.kind() == std::io::ErrorKind::InvalidData => {
                Err(BridgeError::desync(e.to_string()))
            }
            Ok(Some(Err(e))) => Err(BridgeError::ChannelClosed(e.to_string())),
            Ok(Some(Ok(frame))) => Ok(frame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf, duplex};

    const WAIT: Duration = Duration::from_secs(5);

    type TestChannel = LineChannel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    /// Channel plus the worker's end of the pipe.
    fn channel_pair() -> (TestChannel, DuplexStream) {
        let (host, worker) = duplex(64 * 1024);
        let (read, write) = tokio::io::split(host);
        (LineChannel::new(read, write), worker)
    }

    #[tokio::test]
    async fn writes_newline_terminated_commands() {
        let (mut channel, mut worker) = channel_pair();
        channel
            .write_line(&CommandLine::new("describe").arg("a.fake"))
            .await
            .unwrap();

        let mut buf = vec![0u8; 16];
        worker.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], b"describe a.fake\n");
    }

    #[tokio::test]
    async fn reads_lines_then_payload_then_lines() {
        let (mut channel, mut worker) = channel_pair();
        worker.write_all(b"bytes 3\n\n\x01\ndone\n").await.unwrap();

        assert_eq!(channel.read_line(WAIT).await.unwrap(), "bytes 3");
        assert_eq!(&channel.read_exact(3, WAIT).await.unwrap()[..], b"\n\x01\n");
        assert_eq!(channel.read_line(WAIT).await.unwrap(), "done");
    }

    #[tokio::test]
    async fn payload_split_across_writes() {
        let (mut channel, mut worker) = channel_pair();
        let writer = tokio::spawn(async move {
            worker.write_all(&[1, 2]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            worker.write_all(&[3, 4, 5]).await.unwrap();
            worker
        });

        let payload = channel.read_exact(5, WAIT).await.unwrap();
        assert_eq!(&payload[..], &[1, 2, 3, 4, 5]);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn silence_times_out() {
        let (mut channel, _worker) = channel_pair();
        let err = channel
            .read_line(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ChannelTimeout(_)));
    }

    #[tokio::test]
    async fn eof_before_data_is_closed() {
        let (mut channel, worker) = channel_pair();
        drop(worker);
        let err = channel.read_line(WAIT).await.unwrap_err();
        assert!(matches!(err, BridgeError::ChannelClosed(_)));
    }

    #[tokio::test]
    async fn eof_mid_payload_is_closed() {
        let (mut channel, mut worker) = channel_pair();
        worker.write_all(&[0u8; 10]).await.unwrap();
        drop(worker);
        let err = channel.read_exact(100, WAIT).await.unwrap_err();
        assert!(matches!(err, BridgeError::ChannelClosed(_)));
    }

    #[tokio::test]
    async fn write_after_worker_gone_fails() {
        let (mut channel, worker) = channel_pair();
        drop(worker);
        let err = channel
            .write_line(&CommandLine::new("close"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ChannelWrite(_)));
    }

    #[tokio::test]
    async fn non_utf8_line_is_desync() {
        let (mut channel, mut worker) = channel_pair();
        worker.write_all(b"\xff\xfe\n").await.unwrap();
        let err = channel.read_line(WAIT).await.unwrap_err();
        assert!(matches!(err, BridgeError::ProtocolDesync(_)));
    }
}
