//! Glue between pieces and byte-stream transports.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::{Backlog, Sink};

pub const READ_CHUNK: usize = 16 * 1024;

/// Reads whatever is available, up to one chunk. `None` on EOF.
pub async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> io::Result<Option<Bytes>> {
    buf.reserve(READ_CHUNK);
    let n = (&mut *reader).take(READ_CHUNK as u64).read_buf(buf).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(buf.split().freeze()))
}

/// Write queue drained by a dedicated writer task.
///
/// Dropping the outbox lets the writer flush what is queued and then shut
/// the write side down.
pub struct Outbox {
    tx: mpsc::UnboundedSender<Bytes>,
    backlog: Backlog,
}

impl Outbox {
    /// Spawns the writer task. `on_error` runs if a write fails; queued
    /// bytes are discarded at that point.
    pub fn spawn<W>(
        writer: W,
        high_watermark: usize,
        on_error: impl FnOnce(io::Error) + Send + 'static,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Backlog::new(high_watermark);
        let drain_backlog = backlog.clone();
        tokio::spawn(async move {
            if let Err(e) = drain(rx, writer, drain_backlog).await {
                on_error(e);
            }
        });
        Self { tx, backlog }
    }

    pub fn push(&self, data: Bytes) -> bool {
        let n = data.len();
        self.backlog.add(n);
        if self.tx.send(data).is_err() {
            self.backlog.release(n);
            return false;
        }
        true
    }

    pub fn backlog(&self) -> &Backlog {
        &self.backlog
    }

    pub fn into_sink(self) -> Sink {
        let backlog = self.backlog.clone();
        Sink::new(move |data| {
            self.push(data);
        })
        .with_backlog(backlog)
    }
}

async fn drain<W: AsyncWrite + Unpin>(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut writer: W,
    backlog: Backlog,
) -> io::Result<()> {
    while let Some(data) = rx.recv().await {
        writer.write_all(&data).await?;
        backlog.release(data.len());
    }
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn outbox_flushes_then_shuts_down() {
        let (near, mut far) = duplex(64);
        let outbox = Outbox::spawn(near, 1024, |_| {});
        assert!(outbox.push(Bytes::from_static(b"hello ")));
        assert!(outbox.push(Bytes::from_static(b"world")));
        drop(outbox);

        let mut got = Vec::new();
        far.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"hello world");
    }

    #[tokio::test]
    async fn backlog_drains_as_bytes_are_written() {
        let (near, mut far) = duplex(4);
        let outbox = Outbox::spawn(near, 8, |_| {});
        outbox.push(Bytes::from(vec![7u8; 32]));
        assert!(!outbox.backlog().is_writable());

        let mut got = vec![0u8; 32];
        far.read_exact(&mut got).await.unwrap();
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            outbox.backlog().wait_writable(),
        )
        .await
        .unwrap();
        assert_eq!(outbox.backlog().queued(), 0);
    }

    #[tokio::test]
    async fn write_failure_is_reported() {
        let (near, far) = duplex(4);
        drop(far);
        let failed = Arc::new(Mutex::new(None));
        let slot = failed.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let outbox = Outbox::spawn(near, 8, move |e| {
            *slot.lock() = Some(e.kind());
            let _ = tx.send(());
        });
        outbox.push(Bytes::from_static(b"nobody listens"));

        tokio::time::timeout(std::time::Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*failed.lock(), Some(io::ErrorKind::BrokenPipe));
    }

    #[tokio::test]
    async fn read_chunk_reports_eof() {
        let (mut near, far) = duplex(64);
        drop(far);
        let mut buf = BytesMut::new();
        assert!(read_chunk(&mut near, &mut buf).await.unwrap().is_none());
    }
}
