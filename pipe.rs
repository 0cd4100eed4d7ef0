//! Bounded in-memory pipe between a producer task and a stream consumer.
//!
//! Decrypted plaintext for ephemeral access must never touch persistent
//! storage: a producer task writes into the [`PipeWriter`] while the caller
//! reads from the [`PipeReader`], with channel backpressure in between.
//!
//! Failure semantics matter more than the happy path here: when the producer
//! hits an error it pushes that error *into* the pipe via
//! [`PipeWriter::abort`], so the consumer's next read fails instead of
//! hanging or silently reporting EOF on a truncated stream.

use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::PollSender;

/// Read half: an `AsyncRead` over the channel. EOF when the writer is
/// dropped cleanly; an I/O error when the producer aborted.
pub type PipeReader = StreamReader<ReceiverStream<io::Result<Bytes>>, Bytes>;

/// Creates a pipe with room for `capacity` in-flight chunks.
pub fn plaintext_pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(capacity);
    let writer = PipeWriter {
        sender: PollSender::new(tx.clone()),
        error_tx: tx,
    };
    (writer, StreamReader::new(ReceiverStream::new(rx)))
}

/// Write half handed to the producer task.
pub struct PipeWriter {
    sender: PollSender<io::Result<Bytes>>,
    error_tx: mpsc::Sender<io::Result<Bytes>>,
}

impl PipeWriter {
    /// Terminates the pipe with an error. The consumer's next read returns
    /// `err`; if the consumer already went away this is a no-op.
    pub async fn abort(self, err: io::Error) {
        let _ = self.error_tx.send(Err(err)).await;
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = self.get_mut();
        match this.sender.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let n = buf.len();
                if this.sender.send_item(Ok(Bytes::copy_from_slice(buf))).is_err() {
                    return Poll::Ready(Err(broken_pipe()));
                }
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(broken_pipe())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader dropped")
}
