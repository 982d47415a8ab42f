use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

/// Shared "last traffic seen" clock, in milliseconds since `start`.
#[derive(Clone)]
pub struct Activity {
    start: Instant,
    last: Arc<AtomicU64>,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            last: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn touch(&self) {
        self.last
            .store(self.start.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn idle(&self) -> Duration {
        let now = self.start.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last.load(Ordering::Relaxed)))
    }

    /// Resolves once nothing has touched this clock for `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> Duration {
        let period = (timeout / 4).max(Duration::from_millis(100));
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let idle = self.idle();
            if idle >= timeout {
                return idle;
            }
        }
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

pin_project! {
    struct TimedStream<S> {
        #[pin]
        inner: S,
        activity: Activity,
    }
}

impl<S> TimedStream<S> {
    fn new(inner: S, activity: Activity) -> Self {
        Self { inner, activity }
    }
}

impl<S: AsyncRead> AsyncRead for TimedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if matches!(&result, Poll::Ready(Ok(())) if buf.filled().len() > before) {
            this.activity.touch();
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for TimedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if matches!(&result, Poll::Ready(Ok(n)) if *n > 0) {
            this.activity.touch();
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Outcome of a finished relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Both directions reached EOF
    Finished { uplink: u64, downlink: u64 },
    /// No traffic in either direction for the idle timeout
    Idle,
}

/// Bidirectional copy between `a` and `b` that gives up after `idle_timeout`
/// without traffic.
pub async fn copy_bidirectional_with_idle_timeout<A, B>(
    a: A,
    b: B,
    idle_timeout: Duration,
    buffer_size: usize,
) -> std::io::Result<RelayOutcome>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let activity = Activity::new();

    let mut stream_a = TimedStream::new(a, activity.clone());
    let mut stream_b = TimedStream::new(b, activity.clone());

    let copy_task = tokio::io::copy_bidirectional_with_sizes(
        &mut stream_a,
        &mut stream_b,
        buffer_size,
        buffer_size,
    );

    tokio::select! {
        result = copy_task => {
            let (uplink, downlink) = result?;
            Ok(RelayOutcome::Finished { uplink, downlink })
        }
        _ = activity.wait_idle(idle_timeout) => Ok(RelayOutcome::Idle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_relay_copies_both_ways() {
        let (client, relay_a) = tokio::io::duplex(1024);
        let (relay_b, server) = tokio::io::duplex(1024);

        let relay = tokio::spawn(copy_bidirectional_with_idle_timeout(
            relay_a,
            relay_b,
            Duration::from_secs(60),
            1024,
        ));

        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        let (mut server_rd, mut server_wr) = tokio::io::split(server);

        client_wr.write_all(b"ping").await.unwrap();
        client_wr.shutdown().await.unwrap();
        let mut got = Vec::new();
        server_rd.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"ping");

        server_wr.write_all(b"pong!").await.unwrap();
        server_wr.shutdown().await.unwrap();
        let mut got = Vec::new();
        client_rd.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"pong!");

        let outcome = relay.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            RelayOutcome::Finished {
                uplink: 4,
                downlink: 5
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_idle_timeout() {
        let (_client, relay_a) = tokio::io::duplex(64);
        let (relay_b, _server) = tokio::io::duplex(64);

        let outcome =
            copy_bidirectional_with_idle_timeout(relay_a, relay_b, Duration::from_secs(2), 64)
                .await
                .unwrap();
        assert_eq!(outcome, RelayOutcome::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_idle() {
        let activity = Activity::new();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(activity.idle() >= Duration::from_secs(3));
        activity.touch();
        assert!(activity.idle() < Duration::from_secs(1));
    }
}
