//! Stream-mode I/O over pooled sessions.
//!
//! A [`GridStream`] binds one pooled session to one open transfer and moves
//! through it sequentially. Positioned reads and writes at the current
//! offset ride the sequential transfer; out-of-order access runs on an
//! ephemeral session acquired from the pool for just that operation, so the
//! sequential transfer is never corrupted.

use crate::config::GridFtpConfig;
use crate::error::Result;
use crate::request::{OpKind, StreamState};
use crate::session::{PooledSession, SessionPool};
use crate::uri;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Chunk size used when pulling directory listings.
const LIST_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamMode {
    Read,
    Write,
}

/// An open sequential transfer on a pooled session.
pub struct GridStream {
    url: String,
    mode: StreamMode,
    pool: Arc<SessionPool>,
    session: PooledSession,
    state: StreamState,
    op_timeout: Duration,
}

impl GridStream {
    /// Open a get transfer for sequential reading.
    pub async fn open_read(
        pool: &Arc<SessionPool>,
        config: &GridFtpConfig,
        url: &str,
    ) -> Result<GridStream> {
        Self::open(pool, config, url, StreamMode::Read).await
    }

    /// Open a put transfer for sequential writing.
    pub async fn open_write(
        pool: &Arc<SessionPool>,
        config: &GridFtpConfig,
        url: &str,
    ) -> Result<GridStream> {
        Self::open(pool, config, url, StreamMode::Write).await
    }

    async fn open(
        pool: &Arc<SessionPool>,
        config: &GridFtpConfig,
        url: &str,
        mode: StreamMode,
    ) -> Result<GridStream> {
        let host = uri::hostname_of(url)?;
        let session = pool.acquire(&host).await?;
        let state = StreamState::new(OpKind::Data).with_transport(session.transport());
        match mode {
            StreamMode::Read => session.transport().start_read(url, None, &state)?,
            StreamMode::Write => session.transport().start_write(url, None, &state)?,
        }
        debug!("opened {:?} stream on {}", mode, url);
        Ok(GridStream {
            url: url.to_string(),
            mode,
            pool: Arc::clone(pool),
            session,
            state,
            op_timeout: Duration::from_secs(config.operation_timeout_secs),
        })
    }

    /// Current stream offset.
    pub fn offset(&self) -> u64 {
        self.state.offset()
    }

    /// Whether end of file has been reached.
    pub fn eof(&self) -> bool {
        self.state.eof()
    }

    /// Read the next chunk, up to `len` bytes. An empty chunk means end of
    /// file.
    pub async fn read(&mut self, len: usize) -> Result<Bytes> {
        if self.state.eof() {
            return Ok(Bytes::new());
        }
        self.state.request().start("read")?;
        self.session.transport().register_read(len, &self.state)?;
        if let Err(e) = self.state.request().wait(Some(self.op_timeout)).await {
            self.session.disable_reuse();
            return Err(e);
        }
        Ok(self.state.take_chunk())
    }

    /// Append a chunk to the transfer. `eof` marks the final block.
    pub async fn write(&mut self, data: Bytes, eof: bool) -> Result<usize> {
        let len = data.len();
        self.state.request().start("write")?;
        self.session
            .transport()
            .register_write(data, eof, &self.state)?;
        if let Err(e) = self.state.request().wait(Some(self.op_timeout)).await {
            self.session.disable_reuse();
            return Err(e);
        }
        if eof {
            self.state.set_eof();
        }
        Ok(len)
    }

    /// Read `len` bytes at an absolute offset. A read at the current offset
    /// rides the sequential transfer; anything else runs on an ephemeral
    /// session that goes straight back to the pool.
    pub async fn pread(&mut self, len: usize, offset: u64) -> Result<Bytes> {
        if self.mode == StreamMode::Read && offset == self.state.offset() {
            return self.read(len).await;
        }
        let mut session = self.pool.acquire(&uri::hostname_of(&self.url)?).await?;
        let state = StreamState::new(OpKind::Data).with_transport(session.transport());
        session.transport().start_read(&self.url, Some(offset), &state)?;
        state.request().start("pread")?;
        session.transport().register_read(len, &state)?;
        if let Err(e) = state.request().wait(Some(self.op_timeout)).await {
            session.disable_reuse();
            return Err(e);
        }
        Ok(state.take_chunk())
    }

    /// Write a chunk at an absolute offset; same dispatch rule as
    /// [`pread`](Self::pread).
    pub async fn pwrite(&mut self, data: Bytes, offset: u64) -> Result<usize> {
        if self.mode == StreamMode::Write && offset == self.state.offset() {
            return self.write(data, false).await;
        }
        let len = data.len();
        let mut session = self.pool.acquire(&uri::hostname_of(&self.url)?).await?;
        let state = StreamState::new(OpKind::Data).with_transport(session.transport());
        session.transport().start_write(&self.url, Some(offset), &state)?;
        state.request().start("pwrite")?;
        session.transport().register_write(data, true, &state)?;
        if let Err(e) = state.request().wait(Some(self.op_timeout)).await {
            session.disable_reuse();
            return Err(e);
        }
        Ok(len)
    }

    /// Finish the transfer. A write stream flushes its final empty block; a
    /// read stream abandoned before EOF aborts the transfer and retires the
    /// session.
    pub async fn close(mut self) -> Result<()> {
        match self.mode {
            StreamMode::Write => {
                if !self.state.eof() {
                    self.state.request().start("close")?;
                    self.session
                        .transport()
                        .register_write(Bytes::new(), true, &self.state)?;
                    if let Err(e) = self.state.request().wait(Some(self.op_timeout)).await {
                        self.session.disable_reuse();
                        return Err(e);
                    }
                }
                Ok(())
            }
            StreamMode::Read => {
                if !self.state.eof() {
                    let _ = self.state.request().cancel("stream closed before EOF");
                    self.session.disable_reuse();
                }
                Ok(())
            }
        }
    }
}

/// Incremental directory listing reader. Entries arrive from the transport
/// as newline-separated records; partial records are buffered until the
/// next chunk completes them. A zero-byte refill marks the end of the
/// listing.
pub struct DirReader {
    stream: GridStream,
    remainder: Vec<u8>,
}

impl DirReader {
    pub async fn open(
        pool: &Arc<SessionPool>,
        config: &GridFtpConfig,
        url: &str,
    ) -> Result<DirReader> {
        let host = uri::hostname_of(url)?;
        let session = pool.acquire(&host).await?;
        let state = StreamState::new(OpKind::Data).with_transport(session.transport());
        session.transport().start_list(url, &state)?;
        Ok(DirReader {
            stream: GridStream {
                url: url.to_string(),
                mode: StreamMode::Read,
                pool: Arc::clone(pool),
                session,
                state,
                op_timeout: Duration::from_secs(config.operation_timeout_secs),
            },
            remainder: Vec::new(),
        })
    }

    /// Next entry name, or `None` at the end of the listing.
    pub async fn next_entry(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(pos) = self.remainder.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.remainder.drain(..=pos).collect();
                line.pop(); // the newline
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            let chunk = self.stream.read(LIST_CHUNK).await?;
            if chunk.is_empty() {
                // End of listing; a trailing record without a newline still counts.
                if !self.remainder.is_empty() {
                    let mut line = std::mem::take(&mut self.remainder);
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    if !line.is_empty() {
                        return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
                    }
                }
                return Ok(None);
            }
            self.remainder.extend_from_slice(&chunk);
        }
    }

    pub async fn close(self) -> Result<()> {
        self.stream.close().await
    }
}
