//! Bandwidth throttling for request and response bodies.
//!
//! A rate in kb/s is turned into a piece size released once per window.
//! Incoming data frames are split into pieces which are queued in arrival
//! order; each piece is flushed one window after the previous flush (or
//! after its own arrival when the queue was idle).

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use hyper::HeaderMap;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::time::Sleep;

/// Largest piece flushed at once, bytes.
pub const MAX_PACKET_SIZE: u64 = 8192;

/// Bytes released per window for each kb/s of configured rate.
const BYTES_PER_KBPS: f64 = 128.0;

const WINDOW_MS: u64 = 1000;

/// Halve piece size and window until the piece fits `MAX_PACKET_SIZE`.
pub fn balance(mut chunk_size: u64, mut window_ms: u64) -> (u64, u64) {
    while chunk_size > MAX_PACKET_SIZE {
        chunk_size = chunk_size.div_ceil(2);
        window_ms = window_ms.div_ceil(2);
    }
    (chunk_size, window_ms)
}

/// Release schedule derived from a rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    Rate { chunk_size: usize, window: Duration },
    /// Zero rate: nothing is ever released and the stream stays open.
    Stall,
}

impl Throttle {
    pub fn from_rate(kbps: f64) -> Self {
        let chunk_size = (kbps.max(0.0) * BYTES_PER_KBPS).ceil() as u64;
        if chunk_size == 0 {
            return Throttle::Stall;
        }
        let (chunk_size, window_ms) = balance(chunk_size, WINDOW_MS);
        Throttle::Rate {
            chunk_size: chunk_size as usize,
            window: Duration::from_millis(window_ms),
        }
    }
}

/// Body wrapper releasing the inner body's data at a bounded rate.
///
/// Errors from the inner body are passed through immediately. Trailers are
/// held until every queued piece has been released.
pub struct ThrottledBody<B> {
    inner: B,
    throttle: Throttle,
    queue: VecDeque<Bytes>,
    queued_bytes: u64,
    sleep: Option<Pin<Box<Sleep>>>,
    trailers: Option<HeaderMap>,
    inner_done: bool,
}

impl<B> ThrottledBody<B> {
    pub fn new(inner: B, throttle: Throttle) -> Self {
        Self {
            inner,
            throttle,
            queue: VecDeque::new(),
            queued_bytes: 0,
            sleep: None,
            trailers: None,
            inner_done: false,
        }
    }

    fn enqueue(&mut self, mut data: Bytes, chunk_size: usize) {
        while !data.is_empty() {
            let piece = data.split_to(chunk_size.min(data.len()));
            self.queued_bytes += piece.len() as u64;
            self.queue.push_back(piece);
        }
    }
}

impl<B> Body for ThrottledBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        let (chunk_size, window) = match this.throttle {
            // The inner body is kept alive so the peer sees an open connection.
            Throttle::Stall => return Poll::Pending,
            Throttle::Rate { chunk_size, window } => (chunk_size, window),
        };

        loop {
            if let Some(sleep) = this.sleep.as_mut() {
                ready!(sleep.as_mut().poll(cx));
                this.sleep = None;
                if let Some(piece) = this.queue.pop_front() {
                    this.queued_bytes -= piece.len() as u64;
                    if !this.queue.is_empty() {
                        this.sleep = Some(Box::pin(tokio::time::sleep(window)));
                    }
                    return Poll::Ready(Some(Ok(Frame::data(piece))));
                }
                continue;
            }

            if !this.queue.is_empty() {
                this.sleep = Some(Box::pin(tokio::time::sleep(window)));
                continue;
            }

            if this.inner_done {
                return Poll::Ready(this.trailers.take().map(|t| Ok(Frame::trailers(t))));
            }

            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                None => this.inner_done = true,
                Some(Err(e)) => return Poll::Ready(Some(Err(e))),
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => this.enqueue(data, chunk_size),
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            this.trailers = Some(trailers);
                        }
                    }
                },
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match self.throttle {
            Throttle::Stall => false,
            Throttle::Rate { .. } => {
                self.queue.is_empty()
                    && self.trailers.is_none()
                    && (self.inner_done || self.inner.is_end_stream())
            }
        }
    }

    fn size_hint(&self) -> SizeHint {
        if self.inner_done {
            return SizeHint::with_exact(self.queued_bytes);
        }
        let inner = self.inner.size_hint();
        let mut hint = SizeHint::new();
        hint.set_lower(inner.lower() + self.queued_bytes);
        if let Some(upper) = inner.upper() {
            hint.set_upper(upper + self.queued_bytes);
        }
        hint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full, StreamBody};
    use std::convert::Infallible;
    use tokio::time::Instant;

    type Frames = futures::stream::Iter<std::vec::IntoIter<Result<Frame<Bytes>, Infallible>>>;

    fn chunked(parts: &[&'static str]) -> StreamBody<Frames> {
        let frames: Vec<Result<Frame<Bytes>, Infallible>> = parts
            .iter()
            .map(|p| Ok(Frame::data(Bytes::from_static(p.as_bytes()))))
            .collect();
        StreamBody::new(futures::stream::iter(frames))
    }

    #[test]
    fn test_balance_halves_size_and_window() {
        assert_eq!(balance(10_000, 1000), (5000, 500));
        assert_eq!(balance(8192, 1000), (8192, 1000));
        assert_eq!(balance(128_000, 1000), (8000, 63));
    }

    #[test]
    fn test_from_rate() {
        assert_eq!(
            Throttle::from_rate(1.0),
            Throttle::Rate {
                chunk_size: 128,
                window: Duration::from_millis(1000)
            }
        );
        assert_eq!(
            Throttle::from_rate(100.0),
            Throttle::Rate {
                chunk_size: 6400,
                window: Duration::from_millis(500)
            }
        );
        assert_eq!(
            Throttle::from_rate(0.5),
            Throttle::Rate {
                chunk_size: 64,
                window: Duration::from_millis(1000)
            }
        );
    }

    #[test]
    fn test_zero_rate_is_stall() {
        assert_eq!(Throttle::from_rate(0.0), Throttle::Stall);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_bounds_elapsed_time() {
        // 1 kb/s = 128 bytes per second; 1000 bytes = 8 pieces
        let body = ThrottledBody::new(
            Full::new(Bytes::from(vec![7u8; 1000])),
            Throttle::from_rate(1.0),
        );

        let started = Instant::now();
        let collected = body.collect().await.unwrap().to_bytes();
        let elapsed = started.elapsed();

        assert_eq!(collected.len(), 1000);
        assert!(elapsed >= Duration::from_secs(8), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(9), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pieces_keep_order_across_frames() {
        // chunk size 2
        let throttle = Throttle::from_rate(2.0 / 128.0);
        let mut body = ThrottledBody::new(chunked(&["abc", "def"]), throttle);

        let mut pieces = Vec::new();
        while let Some(frame) = body.frame().await {
            pieces.push(frame.unwrap().into_data().unwrap());
        }

        assert_eq!(
            pieces,
            vec![
                Bytes::from_static(b"ab"),
                Bytes::from_static(b"c"),
                Bytes::from_static(b"de"),
                Bytes::from_static(b"f"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_piece_waits_one_window() {
        let throttle = Throttle::from_rate(1.0);
        let mut body = ThrottledBody::new(Full::new(Bytes::from(vec![1u8; 256])), throttle);

        let started = Instant::now();
        body.frame().await.unwrap().unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        body.frame().await.unwrap().unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert!(body.frame().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_never_completes() {
        let body = ThrottledBody::new(Full::new(Bytes::from_static(b"hello")), Throttle::Stall);
        let result = tokio::time::timeout(Duration::from_secs(3600), body.collect()).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_body_ends_without_delay() {
        let body = ThrottledBody::new(Full::new(Bytes::new()), Throttle::from_rate(1.0));
        let started = Instant::now();
        let collected = body.collect().await.unwrap().to_bytes();
        assert!(collected.is_empty());
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailers_follow_data() {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", "abc".parse().unwrap());
        let frames: Vec<Result<Frame<Bytes>, Infallible>> = vec![
            Ok(Frame::data(Bytes::from_static(b"data"))),
            Ok(Frame::trailers(trailers)),
        ];
        let body = ThrottledBody::new(
            StreamBody::new(futures::stream::iter(frames)),
            Throttle::from_rate(1.0),
        );

        let collected = body.collect().await.unwrap();
        assert_eq!(collected.trailers().unwrap()["x-checksum"], "abc");
        assert_eq!(collected.to_bytes(), Bytes::from_static(b"data"));
    }
}
