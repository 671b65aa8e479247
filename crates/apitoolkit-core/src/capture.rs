//! Body capture for observed exchanges.
//!
//! [`CaptureBody`] wraps a request or response body so the real consumer
//! reads exactly the frames it would have read anyway, while every data frame
//! is copied into a shared [`BodyCapture`] handle. The handle can be read at
//! any time and returns whatever has passed through so far.
//!
//! Retention is capped. Once a body grows past the limit its copy is
//! discarded and the handle reads as empty; a cut-off JSON document could not
//! be redacted, so nothing of it is kept. The consumer still sees every byte.
//!
//! For outbound responses the caller may never read the body before the
//! exchange is recorded, so [`drain`] reads the entity up front and hands
//! back a [`ReplayBody`] that yields the same frames again.

use bytes::{Buf, Bytes, BytesMut};
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use pin_project_lite::pin_project;
use std::io::IoSlice;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};

/// Maximum number of buffer segments copied from a single data frame.
const MAX_FRAME_SEGMENTS: usize = 64;

/// Default cap on retained body bytes: 1 MiB.
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

#[derive(Debug, Default)]
struct Retained {
    bytes: BytesMut,
    overflowed: bool,
}

/// Read handle for the bytes retained by a [`CaptureBody`].
///
/// A disabled handle never allocates and always returns an empty buffer.
#[derive(Clone, Debug, Default)]
pub struct BodyCapture {
    buffer: Option<Arc<Mutex<Retained>>>,
    limit: usize,
}

impl BodyCapture {
    /// Create a handle that retains up to [`DEFAULT_MAX_BODY_SIZE`] bytes.
    pub fn enabled() -> Self {
        Self::with_limit(DEFAULT_MAX_BODY_SIZE)
    }

    /// Create a handle that retains bodies of at most `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Some(Arc::new(Mutex::new(Retained::default()))),
            limit,
        }
    }

    /// Create a handle that retains nothing.
    pub fn disabled() -> Self {
        Self {
            buffer: None,
            limit: 0,
        }
    }

    /// Whether this handle retains bytes.
    pub fn is_enabled(&self) -> bool {
        self.buffer.is_some()
    }

    /// Whether the body outgrew the limit and its copy was dropped.
    pub fn overflowed(&self) -> bool {
        match &self.buffer {
            Some(buffer) => buffer.lock().unwrap_or_else(|e| e.into_inner()).overflowed,
            None => false,
        }
    }

    /// Copy of the bytes seen so far. Empty once the limit was exceeded.
    pub fn retrieve(&self) -> Bytes {
        match &self.buffer {
            Some(buffer) => {
                let guard = buffer.lock().unwrap_or_else(|e| e.into_inner());
                Bytes::copy_from_slice(&guard.bytes)
            }
            None => Bytes::new(),
        }
    }

    fn record<D: Buf>(&self, data: &D) {
        let Some(buffer) = &self.buffer else {
            return;
        };

        let mut guard = buffer.lock().unwrap_or_else(|e| e.into_inner());
        if guard.overflowed {
            return;
        }
        if guard.bytes.len() + data.remaining() > self.limit {
            tracing::trace!(limit = self.limit, "body exceeds capture limit, dropping copy");
            guard.bytes = BytesMut::new();
            guard.overflowed = true;
            return;
        }

        let mut segments = [IoSlice::new(&[]); MAX_FRAME_SEGMENTS];
        let filled = data.chunks_vectored(&mut segments);
        for segment in &segments[..filled] {
            guard.bytes.extend_from_slice(segment);
        }
    }
}

pin_project! {
    /// A body that copies every data frame into a [`BodyCapture`].
    ///
    /// Frames, end-of-stream signaling, size hints and errors are forwarded
    /// untouched.
    #[derive(Debug)]
    pub struct CaptureBody<B> {
        #[pin]
        inner: B,
        capture: BodyCapture,
    }
}

impl<B> CaptureBody<B> {
    /// Wrap `inner`, recording into `capture`.
    pub fn new(inner: B, capture: BodyCapture) -> Self {
        Self { inner, capture }
    }

    /// The handle this body records into.
    pub fn capture(&self) -> &BodyCapture {
        &self.capture
    }

    /// Unwrap the original body.
    pub fn into_inner(self) -> B {
        self.inner
    }
}

/// Wrap a body for capture.
///
/// Returns the pass-through body for the real consumer and the handle for the
/// observer. When `enabled` is false the handle is disabled and no bytes are
/// buffered; otherwise at most `limit` bytes are kept.
pub fn wrap<B>(body: B, enabled: bool, limit: usize) -> (CaptureBody<B>, BodyCapture) {
    let capture = if enabled {
        BodyCapture::with_limit(limit)
    } else {
        BodyCapture::disabled()
    };
    (CaptureBody::new(body, capture.clone()), capture)
}

impl<B: Body> Body for CaptureBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let result = ready!(this.inner.poll_frame(cx));
        if let Some(Ok(frame)) = &result {
            if let Some(data) = frame.data_ref() {
                this.capture.record(data);
            }
        }
        Poll::Ready(result)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

pin_project! {
    /// Replays what [`drain`] read, then streams whatever it left unread.
    ///
    /// Yields the buffered data as one frame. A body that fit under the limit
    /// follows it with any trailers, then the error that interrupted the
    /// original body, if there was one. A body that outgrew the limit
    /// continues from the original.
    #[derive(Debug)]
    pub struct ReplayBody<B, E> {
        data: Option<Bytes>,
        trailers: Option<HeaderMap>,
        error: Option<E>,
        rest: Option<Pin<Box<B>>>,
    }
}

impl<B> Body for ReplayBody<B, B::Error>
where
    B: Body,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        if let Some(data) = this.data.take() {
            return Poll::Ready(Some(Ok(Frame::data(data))));
        }
        if let Some(rest) = this.rest.as_mut() {
            return rest.as_mut().poll_frame(cx).map(|frame| {
                frame.map(|result| {
                    result.map(|frame| frame.map_data(|mut data| data.copy_to_bytes(data.remaining())))
                })
            });
        }
        if let Some(trailers) = this.trailers.take() {
            return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
        }
        if let Some(error) = this.error.take() {
            return Poll::Ready(Some(Err(error)));
        }
        Poll::Ready(None)
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_none()
            && self.trailers.is_none()
            && self.error.is_none()
            && self.rest.as_ref().map_or(true, |rest| rest.is_end_stream())
    }

    fn size_hint(&self) -> SizeHint {
        let buffered = self.data.as_ref().map_or(0, |d| d.len() as u64);
        if let Some(rest) = &self.rest {
            let remaining = rest.size_hint();
            let mut hint = SizeHint::new();
            hint.set_lower(buffered + remaining.lower());
            if let Some(upper) = remaining.upper() {
                hint.set_upper(buffered + upper);
            }
            return hint;
        }
        if self.error.is_some() {
            let mut hint = SizeHint::new();
            hint.set_lower(buffered);
            return hint;
        }
        SizeHint::with_exact(buffered)
    }
}

/// Read `body` up to `limit` bytes and return a replayable body plus the
/// bytes read.
///
/// The bytes are `None` when the body is longer than `limit`; reading stops
/// there and the replay body carries on with the unread remainder. A body
/// error stops the read; the bytes gathered before it are kept and the
/// replay body yields the same error after them.
pub async fn drain<B: Body>(body: B, limit: usize) -> (ReplayBody<B, B::Error>, Option<Bytes>) {
    let mut body = Box::pin(body);
    let mut buffer = BytesMut::new();
    let mut trailers: Option<HeaderMap> = None;
    let mut error = None;
    let mut overflowed = false;

    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => match frame.into_data() {
                Ok(mut data) => {
                    while data.has_remaining() {
                        let chunk = data.chunk();
                        let len = chunk.len();
                        buffer.extend_from_slice(chunk);
                        data.advance(len);
                    }
                    if buffer.len() > limit {
                        overflowed = true;
                        break;
                    }
                }
                Err(frame) => {
                    if let Ok(map) = frame.into_trailers() {
                        trailers.get_or_insert_with(HeaderMap::new).extend(map);
                    }
                }
            },
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }

    let bytes = buffer.freeze();
    let replay = ReplayBody {
        data: (!bytes.is_empty()).then(|| bytes.clone()),
        trailers,
        error,
        rest: overflowed.then_some(body),
    };
    if overflowed {
        tracing::trace!(limit, "response body exceeds capture limit, not retained");
        return (replay, None);
    }
    (replay, Some(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use http_body_util::{Full, StreamBody};
    use std::convert::Infallible;

    #[tokio::test]
    async fn test_capture_passes_bytes_through() {
        let (body, capture) = wrap(Full::new(Bytes::from("hello world")), true, 1024);

        let collected = body.collect().await.unwrap().to_bytes();

        assert_eq!(collected, Bytes::from("hello world"));
        assert_eq!(capture.retrieve(), Bytes::from("hello world"));
    }

    #[tokio::test]
    async fn test_disabled_capture_retains_nothing() {
        let (body, capture) = wrap(Full::new(Bytes::from("secret")), false, 1024);

        let collected = body.collect().await.unwrap().to_bytes();

        assert_eq!(collected, Bytes::from("secret"));
        assert!(!capture.is_enabled());
        assert!(capture.retrieve().is_empty());
    }

    #[tokio::test]
    async fn test_capture_reflects_partial_reads() {
        let chunks: Vec<Result<Frame<Bytes>, Infallible>> = vec![
            Ok(Frame::data(Bytes::from("first "))),
            Ok(Frame::data(Bytes::from("second"))),
        ];
        let (body, capture) = wrap(StreamBody::new(stream::iter(chunks)), true, 1024);
        let mut body = std::pin::pin!(body);

        assert!(capture.retrieve().is_empty());
        body.frame().await.unwrap().unwrap();
        assert_eq!(capture.retrieve(), Bytes::from("first "));
        body.frame().await.unwrap().unwrap();
        assert_eq!(capture.retrieve(), Bytes::from("first second"));
        assert!(body.frame().await.is_none());
    }

    #[tokio::test]
    async fn test_capture_forwards_errors() {
        let chunks: Vec<Result<Frame<Bytes>, &'static str>> =
            vec![Ok(Frame::data(Bytes::from("ok"))), Err("boom")];
        let (body, capture) = wrap(StreamBody::new(stream::iter(chunks)), true, 1024);

        let err = body.collect().await.unwrap_err();

        assert_eq!(err, "boom");
        assert_eq!(capture.retrieve(), Bytes::from("ok"));
    }

    #[tokio::test]
    async fn test_drain_replays_identical_bytes() {
        let (replay, bytes) = drain(Full::new(Bytes::from("{\"a\":1}")), 1024).await;

        let bytes = bytes.unwrap();
        assert_eq!(bytes, Bytes::from("{\"a\":1}"));
        assert_eq!(replay.size_hint().exact(), Some(7));
        let replayed = replay.collect().await.unwrap().to_bytes();
        assert_eq!(replayed, bytes);
    }

    #[tokio::test]
    async fn test_drain_keeps_error_after_data() {
        let chunks: Vec<Result<Frame<Bytes>, &'static str>> =
            vec![Ok(Frame::data(Bytes::from("partial"))), Err("reset")];

        let (replay, bytes) = drain(StreamBody::new(stream::iter(chunks)), 1024).await;

        assert_eq!(bytes, Some(Bytes::from("partial")));
        let mut replay = std::pin::pin!(replay);
        let first = replay.frame().await.unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), Bytes::from("partial"));
        assert_eq!(replay.frame().await.unwrap().unwrap_err(), "reset");
        assert!(replay.frame().await.is_none());
    }

    #[tokio::test]
    async fn test_drain_empty_body() {
        let (replay, bytes) = drain(Full::new(Bytes::new()), 1024).await;

        assert_eq!(bytes, Some(Bytes::new()));
        assert!(replay.is_end_stream());
    }

    #[tokio::test]
    async fn test_capture_over_limit_keeps_nothing() {
        let chunks: Vec<Result<Frame<Bytes>, Infallible>> = vec![
            Ok(Frame::data(Bytes::from("0123456789"))),
            Ok(Frame::data(Bytes::from("abcdef"))),
            Ok(Frame::data(Bytes::from("x"))),
        ];
        let (body, capture) = wrap(StreamBody::new(stream::iter(chunks)), true, 12);

        let collected = body.collect().await.unwrap().to_bytes();

        assert_eq!(collected, Bytes::from("0123456789abcdefx"));
        assert!(capture.overflowed());
        assert!(capture.retrieve().is_empty());
    }

    #[tokio::test]
    async fn test_capture_at_limit_is_kept() {
        let (body, capture) = wrap(Full::new(Bytes::from("exact")), true, 5);

        body.collect().await.unwrap();

        assert!(!capture.overflowed());
        assert_eq!(capture.retrieve(), Bytes::from("exact"));
    }

    #[tokio::test]
    async fn test_drain_over_limit_streams_remainder() {
        let chunks: Vec<Result<Frame<Bytes>, Infallible>> = vec![
            Ok(Frame::data(Bytes::from("aaaa"))),
            Ok(Frame::data(Bytes::from("bbbb"))),
            Ok(Frame::data(Bytes::from("cccc"))),
            Ok(Frame::trailers(HeaderMap::new())),
        ];

        let (replay, bytes) = drain(StreamBody::new(stream::iter(chunks)), 6).await;

        assert_eq!(bytes, None);
        assert!(!replay.is_end_stream());
        let replayed = replay.collect().await.unwrap().to_bytes();
        assert_eq!(replayed, Bytes::from("aaaabbbbcccc"));
    }
}
