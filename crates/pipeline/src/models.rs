use bytes::Bytes;
use futures::{Stream, stream::BoxStream};
use std::{
    collections::BTreeMap,
    io,
    pin::Pin,
    task::{Context, Poll},
};

/// One artifact as reported by the source catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecord {
    /// Slash separated directory of the artifact, without a trailing slash.
    pub source_path: String,
    pub name: String,
    pub size: u64,
    pub created_by: String,
}

/// A record projected into destination coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferUnit {
    pub destination_path: String,
    pub record: ArtifactRecord,
}

/// Custom key/value properties, one value per key.
pub type PropertySet = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Skipped,
    Succeeded,
    Failed,
}

/// Streamed artifact body.
///
/// Dropping the value releases the underlying connection, so every exit path
/// of a transfer closes it without further bookkeeping.
pub struct ArtifactContent {
    size: u64,
    stream: BoxStream<'static, io::Result<Bytes>>,
}

impl ArtifactContent {
    pub fn new(size: u64, stream: BoxStream<'static, io::Result<Bytes>>) -> Self {
        Self { size, stream }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Wraps the body so that it fails if it yields more or fewer bytes than
    /// the declared size.
    pub fn into_checked_stream(self) -> SizeCheckedStream {
        SizeCheckedStream {
            inner: self.stream,
            expected: self.size,
            seen: 0,
            done: false,
        }
    }
}

impl std::fmt::Debug for ArtifactContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactContent")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

pub struct SizeCheckedStream {
    inner: BoxStream<'static, io::Result<Bytes>>,
    expected: u64,
    seen: u64,
    done: bool,
}

impl Stream for SizeCheckedStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                let len = u64::try_from(chunk.len()).unwrap_or(u64::MAX);
                this.seen = this.seen.saturating_add(len);
                if this.seen > this.expected {
                    this.done = true;
                    return Poll::Ready(Some(Err(size_mismatch(this.expected, this.seen))));
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => {
                this.done = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                this.done = true;
                if this.seen != this.expected {
                    return Poll::Ready(Some(Err(size_mismatch(this.expected, this.seen))));
                }
                Poll::Ready(None)
            }
        }
    }
}

fn size_mismatch(expected: u64, seen: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("artifact body size mismatch: expected {expected} bytes, got at least {seen}"),
    )
}
