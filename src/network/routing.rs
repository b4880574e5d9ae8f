//! Frame routing: tagged prefixes, demux dispatch, merged sources and null
//! endpoints

use crate::error::{DeployError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::sink::Sink;
use futures::stream::{BoxStream, StreamExt};
use futures::{FutureExt, SinkExt};
use std::collections::BTreeMap;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::error;

/// Size of the routing tag carried in front of demuxed and tagged frames
pub const TAG_LEN: usize = 4;

/// Stream of frames received on a port
pub type FrameSource = BoxStream<'static, Result<Bytes>>;

/// Channel on which frames that could not be routed are reported
pub type DeliveryErrors = mpsc::UnboundedSender<DeployError>;

type BoxSink = Pin<Box<dyn Sink<Bytes, Error = std::io::Error> + Send>>;

/// Prefix `payload` with a big-endian routing tag
pub fn prefix_tag(tag: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(TAG_LEN + payload.len());
    buf.put_u32(tag);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Split the routing tag off a frame
pub fn split_tag(frame: &Bytes) -> Option<(u32, Bytes)> {
    if frame.len() < TAG_LEN {
        return None;
    }
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&frame[..TAG_LEN]);
    Some((u32::from_be_bytes(tag), frame.slice(TAG_LEN..)))
}

/// Emitting side of a port
pub enum FrameSink {
    /// Length-delimited frames over a byte stream
    Framed(BoxSink),
    /// Prefix every frame with a tag
    Tagged(Box<FrameSink>, u32),
    /// Route by leading tag, stripping it
    Demux(BTreeMap<u32, FrameSink>, DeliveryErrors),
    /// Discard everything
    Null,
    /// Sending is not possible on this port
    Closed(String),
}

impl FrameSink {
    /// Length-delimited sink over any async writer
    pub fn framed<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        FrameSink::Framed(Box::pin(FramedWrite::new(writer, LengthDelimitedCodec::new())))
    }

    /// Send one frame. Frames sent through one sink arrive in order.
    pub fn send(&mut self, frame: Bytes) -> BoxFuture<'_, Result<()>> {
        async move {
            match self {
                FrameSink::Framed(sink) => {
                    sink.send(frame).await?;
                    Ok(())
                }
                FrameSink::Tagged(inner, tag) => inner.send(prefix_tag(*tag, &frame)).await,
                FrameSink::Demux(routes, errors) => {
                    let Some((tag, body)) = split_tag(&frame) else {
                        error!(len = frame.len(), "Demux frame shorter than its tag, dropping");
                        let _ = errors.send(DeployError::Internal(format!(
                            "demux frame of {} bytes has no tag",
                            frame.len()
                        )));
                        return Ok(());
                    };

                    match routes.get_mut(&tag) {
                        Some(route) => route.send(body).await,
                        None => {
                            error!(tag, "No demux destination for tag, dropping frame");
                            let _ = errors.send(DeployError::DemuxTag(tag));
                            Ok(())
                        }
                    }
                }
                FrameSink::Null => Ok(()),
                FrameSink::Closed(reason) => Err(DeployError::StreamClosed(reason.clone())),
            }
        }
        .boxed()
    }

    /// Flush and close every underlying stream
    pub fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        async move {
            match self {
                FrameSink::Framed(sink) => {
                    sink.close().await?;
                    Ok(())
                }
                FrameSink::Tagged(inner, _) => inner.close().await,
                FrameSink::Demux(routes, _) => {
                    for route in routes.values_mut() {
                        route.close().await?;
                    }
                    Ok(())
                }
                FrameSink::Null | FrameSink::Closed(_) => Ok(()),
            }
        }
        .boxed()
    }
}

impl std::fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameSink::Framed(_) => write!(f, "Framed"),
            FrameSink::Tagged(inner, tag) => f.debug_tuple("Tagged").field(inner).field(tag).finish(),
            FrameSink::Demux(routes, _) => f.debug_tuple("Demux").field(routes).finish(),
            FrameSink::Null => write!(f, "Null"),
            FrameSink::Closed(reason) => f.debug_tuple("Closed").field(reason).finish(),
        }
    }
}

/// Length-delimited source over any async reader
pub fn framed_source<R>(reader: R) -> FrameSource
where
    R: AsyncRead + Send + 'static,
{
    FramedRead::new(reader, LengthDelimitedCodec::new())
        .map(|frame| frame.map(BytesMut::freeze).map_err(DeployError::from))
        .boxed()
}

/// Read several sources as one. Order is kept per source.
pub fn merge_sources(sources: Vec<FrameSource>) -> FrameSource {
    futures::stream::select_all(sources).boxed()
}

/// A source that never yields
pub fn null_source() -> FrameSource {
    futures::stream::pending().boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pipe() -> (FrameSink, FrameSource) {
        let (a, b) = tokio::io::duplex(1024);
        (FrameSink::framed(a), framed_source(b))
    }

    #[test]
    fn test_tag_helpers() {
        let frame = prefix_tag(258, b"hi");
        assert_eq!(&frame[..], &[0, 0, 1, 2, b'h', b'i']);
        assert_eq!(split_tag(&frame), Some((258, Bytes::from_static(b"hi"))));
        assert_eq!(split_tag(&Bytes::from_static(b"abc")), None);
    }

    #[tokio::test]
    async fn test_demux_delivers_to_tagged_destination_only() {
        let (sink0, mut source0) = pipe();
        let (sink1, mut source1) = pipe();
        let (errors, _errors_rx) = mpsc::unbounded_channel();

        let mut routes = BTreeMap::new();
        routes.insert(0, sink0);
        routes.insert(1, sink1);
        let mut demux = FrameSink::Demux(routes, errors);

        demux.send(prefix_tag(0, b"payload")).await.unwrap();
        let got = source0.next().await.unwrap().unwrap();
        assert_eq!(&got[..], b"payload");

        let nothing = tokio::time::timeout(Duration::from_millis(50), source1.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_tagged_into_demux_strips_tag() {
        let (sink0, mut source0) = pipe();
        let (errors, _errors_rx) = mpsc::unbounded_channel();
        let mut routes = BTreeMap::new();
        routes.insert(9, sink0);

        let mut sink = FrameSink::Tagged(Box::new(FrameSink::Demux(routes, errors)), 9);
        sink.send(Bytes::from_static(b"\x00\x01exact")).await.unwrap();

        let got = source0.next().await.unwrap().unwrap();
        assert_eq!(&got[..], b"\x00\x01exact");
    }

    #[tokio::test]
    async fn test_demux_unknown_tag_is_reported() {
        let (sink0, _source0) = pipe();
        let (errors, mut errors_rx) = mpsc::unbounded_channel();
        let mut routes = BTreeMap::new();
        routes.insert(0, sink0);
        let mut demux = FrameSink::Demux(routes, errors);

        demux.send(prefix_tag(5, b"lost")).await.unwrap();
        demux.send(Bytes::from_static(b"x")).await.unwrap();

        assert!(matches!(errors_rx.recv().await, Some(DeployError::DemuxTag(5))));
        assert!(matches!(errors_rx.recv().await, Some(DeployError::Internal(_))));
    }

    #[tokio::test]
    async fn test_merge_keeps_per_sender_order() {
        let (mut a, source_a) = pipe();
        let (mut b, source_b) = pipe();
        let mut merged = merge_sources(vec![source_a, source_b]);

        for n in [1u8, 2, 3] {
            a.send(Bytes::from(vec![n])).await.unwrap();
        }
        for c in [b'x', b'y'] {
            b.send(Bytes::from(vec![c])).await.unwrap();
        }

        let mut from_a = Vec::new();
        let mut from_b = Vec::new();
        for _ in 0..5 {
            let frame = merged.next().await.unwrap().unwrap();
            if frame[0] < 10 {
                from_a.push(frame[0]);
            } else {
                from_b.push(frame[0]);
            }
        }
        assert_eq!(from_a, vec![1, 2, 3]);
        assert_eq!(from_b, vec![b'x', b'y']);
    }

    #[tokio::test]
    async fn test_null_endpoints() {
        let mut sink = FrameSink::Null;
        for _ in 0..100 {
            sink.send(Bytes::from_static(b"dropped")).await.unwrap();
        }

        let mut source = null_source();
        let next = tokio::time::timeout(Duration::from_millis(50), source.next()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn test_closed_sink() {
        let mut sink = FrameSink::Closed("merge port".to_string());
        let err = sink.send(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, DeployError::StreamClosed(_)));
    }
}
