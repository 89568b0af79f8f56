//! Bidirectional byte relay.
//!
//! Couples two streams and copies bytes in both directions until either side
//! reaches EOF, fails, or the association stays idle past the timeout. Both
//! directions are driven as poll-based state machines inside a single task,
//! so back-pressure on one direction never stalls the other.
//!
//! Flushes are deferred: a direction only flushes when its reader has no
//! more data immediately available or at EOF, which batches consecutive
//! chunks into one flush on buffered writers such as TLS streams.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

/// Sink for per-direction byte accounting.
///
/// The trojan server charges bytes to the authenticated user; other callers
/// use [`NoTraffic`].
pub trait Traffic {
    /// Bytes copied from the inbound side to the outbound side.
    fn add_tx(&self, bytes: u64);
    /// Bytes copied from the outbound side to the inbound side.
    fn add_rx(&self, bytes: u64);
}

/// Accounting sink that discards all counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTraffic;

impl Traffic for NoTraffic {
    #[inline]
    fn add_tx(&self, _bytes: u64) {}
    #[inline]
    fn add_rx(&self, _bytes: u64) {}
}

/// Bytes moved in each direction during a relay.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayStats {
    /// Inbound → outbound bytes.
    pub tx: u64,
    /// Outbound → inbound bytes.
    pub rx: u64,
}

impl RelayStats {
    /// Total bytes moved in both directions.
    #[inline]
    pub fn total(self) -> u64 {
        self.tx + self.rx
    }
}

/// One copy direction.
struct Direction {
    buf: Box<[u8]>,
    /// Bytes in `buf[pos..end]` still to be written.
    pos: usize,
    end: usize,
    /// Bytes written since the last flush.
    unflushed: usize,
    /// Reader returned EOF; flush and shut the writer down.
    eof: bool,
    /// Writer has been shut down; this direction is finished.
    done: bool,
}

/// Outcome of one `poll_step` on a direction.
enum Step {
    /// Bytes were flushed to the writer.
    Flushed(usize),
    /// EOF reached and the writer shut down.
    Finished,
}

impl Direction {
    fn new(buffer_size: usize) -> Self {
        Self {
            buf: vec![0u8; buffer_size].into_boxed_slice(),
            pos: 0,
            end: 0,
            unflushed: 0,
            eof: false,
            done: false,
        }
    }

    /// Drive read → write → (deferred) flush until nothing can make progress.
    fn poll_step<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        reader: &mut R,
        writer: &mut W,
    ) -> Poll<io::Result<Step>>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            // Drain any pending write before touching the reader again.
            while self.pos < self.end {
                match Pin::new(&mut *writer).poll_write(cx, &self.buf[self.pos..self.end]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                    }
                    Poll::Ready(Ok(n)) => {
                        self.pos += n;
                        self.unflushed += n;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }

            if self.eof {
                // Flush whatever is left, then shut the writer down.
                if self.unflushed > 0 {
                    match Pin::new(&mut *writer).poll_flush(cx) {
                        Poll::Ready(Ok(())) => {
                            let n = std::mem::take(&mut self.unflushed);
                            return Poll::Ready(Ok(Step::Flushed(n)));
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                return match Pin::new(&mut *writer).poll_shutdown(cx) {
                    Poll::Ready(_) => {
                        self.done = true;
                        Poll::Ready(Ok(Step::Finished))
                    }
                    Poll::Pending => Poll::Pending,
                };
            }

            let mut read_buf = ReadBuf::new(&mut self.buf);
            match Pin::new(&mut *reader).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let n = read_buf.filled().len();
                    if n == 0 {
                        self.eof = true;
                    } else {
                        self.pos = 0;
                        self.end = n;
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {
                    // No more data right now: flush the batch accumulated
                    // since the last flush, if any.
                    if self.unflushed > 0 {
                        match Pin::new(&mut *writer).poll_flush(cx) {
                            Poll::Ready(Ok(())) => {
                                let n = std::mem::take(&mut self.unflushed);
                                return Poll::Ready(Ok(Step::Flushed(n)));
                            }
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

/// Copy bytes between `inbound` and `outbound` in both directions.
///
/// Returns when both directions finished (EOF propagated and writers shut
/// down), when either direction fails, or when **neither** direction moved
/// data within `idle_timeout`.
pub async fn relay_stream<A, B, T>(
    inbound: A,
    outbound: B,
    idle_timeout: Duration,
    buffer_size: usize,
    traffic: &T,
) -> io::Result<RelayStats>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
    T: Traffic,
{
    let (mut in_r, mut in_w) = tokio::io::split(inbound);
    let (mut out_r, mut out_w) = tokio::io::split(outbound);

    let mut fwd = Direction::new(buffer_size);
    let mut rev = Direction::new(buffer_size);
    let mut stats = RelayStats::default();

    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        if fwd.done && rev.done {
            return Ok(stats);
        }

        // Poll both directions with the same waker so either can progress
        // independently; report whether any bytes moved this round.
        let round = std::future::poll_fn(|cx| {
            let mut moved = false;
            let mut ready = false;
            let mut failure: Option<io::Error> = None;

            if !fwd.done {
                match fwd.poll_step(cx, &mut in_r, &mut out_w) {
                    Poll::Ready(Ok(Step::Flushed(n))) => {
                        traffic.add_tx(n as u64);
                        stats.tx += n as u64;
                        moved = true;
                        ready = true;
                    }
                    Poll::Ready(Ok(Step::Finished)) => ready = true,
                    Poll::Ready(Err(e)) => {
                        failure = Some(e);
                        ready = true;
                    }
                    Poll::Pending => {}
                }
            }

            if !rev.done {
                match rev.poll_step(cx, &mut out_r, &mut in_w) {
                    Poll::Ready(Ok(Step::Flushed(n))) => {
                        traffic.add_rx(n as u64);
                        stats.rx += n as u64;
                        moved = true;
                        ready = true;
                    }
                    Poll::Ready(Ok(Step::Finished)) => ready = true,
                    Poll::Ready(Err(e)) => {
                        failure = Some(e);
                        ready = true;
                    }
                    Poll::Pending => {}
                }
            }

            if let Some(e) = failure {
                return Poll::Ready(Err(e));
            }
            if ready {
                Poll::Ready(Ok(moved))
            } else {
                Poll::Pending
            }
        });

        tokio::select! {
            result = round => {
                if result? {
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                }
            }
            _ = &mut idle => return Ok(stats),
        }
    }
}
