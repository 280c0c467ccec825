use std::io;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Relays bytes bidirectionally between two half-duplex streams until
/// either side reaches EOF or errors, then shuts down both writers.
///
/// This is the IO stage's relay primitive (spec.md §4.8, C8): once a
/// session has been accepted past the request stage there is nothing
/// left to decide, only bytes to move until one side closes. Bandwidth
/// limiting and session counters are applied by the caller by wrapping
/// `a`/`b` in a metered stream before calling `relay`; this function only
/// owns the copy loop and the byte counts it returns.
pub struct Duplex;

impl Duplex {
    /// Runs the copy loop to completion and returns `(a_to_b, b_to_a)` byte
    /// counts, mirroring `tokio::io::copy_bidirectional`'s shape.
    pub async fn new<A, B>(mut a: A, mut b: B) -> io::Result<(u64, u64)>
    where
        A: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        let result = tokio::io::copy_bidirectional(&mut a, &mut b).await;
        // Best-effort shutdown of both sides regardless of which one ended
        // the copy; a peer that already closed will just no-op here.
        let _ = a.shutdown().await;
        let _ = b.shutdown().await;
        match &result {
            Ok((atb, bta)) => debug!("relay finished, {} bytes a->b, {} bytes b->a", atb, bta),
            Err(e) => debug!("relay ended with error: {}", e),
        }
        result
    }

    /// Same as [`Duplex::new`] but tears the relay down if either
    /// direction goes `idle` without a single byte moving (spec.md §5
    /// "the IO worker enforces an idle timeout configurable per rule").
    /// `copy_bidirectional` has no hook for this, so each direction gets
    /// its own read-then-write loop instead; the timeout wraps each
    /// individual read, so it resets on every byte seen rather than
    /// bounding the connection's total lifetime.
    pub async fn with_idle_timeout<A, B>(a: A, b: B, idle: Duration) -> io::Result<(u64, u64)>
    where
        A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ar, mut aw) = tokio::io::split(a);
        let (mut br, mut bw) = tokio::io::split(b);

        let a_to_b = tokio::spawn(async move {
            let result = copy_with_idle_timeout(&mut ar, &mut bw, idle).await;
            let _ = bw.shutdown().await;
            result
        });
        let b_to_a = tokio::spawn(async move {
            let result = copy_with_idle_timeout(&mut br, &mut aw, idle).await;
            let _ = aw.shutdown().await;
            result
        });

        let (atb, bta) = tokio::try_join!(a_to_b, b_to_a)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let result = atb.and_then(|n| bta.map(|m| (n, m)));
        match &result {
            Ok((atb, bta)) => debug!(
                "idle-bounded relay finished, {} bytes a->b, {} bytes b->a",
                atb, bta
            ),
            Err(e) => debug!("idle-bounded relay ended with error: {}", e),
        }
        result
    }
}

async fn copy_with_idle_timeout<R, W>(r: &mut R, w: &mut W, idle: Duration) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = match tokio::time::timeout(idle, r.read(&mut buf)).await {
            Ok(Ok(0)) => return Ok(total),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "relay idle timeout")),
        };
        w.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idle_timeout_fires_when_no_bytes_ever_arrive() {
        let (a1, _a2) = tokio::io::duplex(64);
        let (b1, _b2) = tokio::io::duplex(64);
        let result = Duplex::with_idle_timeout(a1, b1, Duration::from_millis(20)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn bytes_flow_through_before_either_side_closes() {
        let (mut a1, a2) = tokio::io::duplex(64);
        let (mut b1, b2) = tokio::io::duplex(64);
        a1.write_all(b"ping").await.unwrap();
        b1.write_all(b"pong").await.unwrap();
        drop(a1);
        drop(b1);
        let (a_to_b, b_to_a) = Duplex::with_idle_timeout(a2, b2, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(a_to_b, 4);
        assert_eq!(b_to_a, 4);
    }
}
