//! Per-flow data buffers.
//!
//! - [`SendBuffer`]: application writes not yet released to the provider.
//!   Stream data is a byte queue; datagrams are kept whole with a cursor so
//!   a datagram interrupted by backpressure resumes with its next fragment.
//! - [`RecvBuffer`]: provider data that did not fit the socket's receive
//!   buffer, plus reassembly of fragmented datagrams.

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::net::SocketAddr;

#[derive(Debug, Clone)]
struct Segment {
    data: Bytes,
    to: Option<SocketAddr>,
    /// Bytes of `data` already sent.
    sent: usize,
}

/// A chunk of a datagram ready to be framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramChunk {
    pub payload: Bytes,
    pub to: Option<SocketAddr>,
    /// Total datagram size, set on the first chunk of a fragmented datagram.
    pub datagram_size: Option<u32>,
    pub fragment: bool,
}

#[derive(Debug)]
pub struct SendBuffer {
    segments: VecDeque<Segment>,
    /// Unsent bytes across all segments.
    len: usize,
    limit: usize,
}

impl SendBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            segments: VecDeque::new(),
            len: 0,
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn space(&self) -> usize {
        self.limit.saturating_sub(self.len)
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.len = 0;
    }

    /// Queue stream bytes. Takes as much as fits and returns the count.
    pub fn push_stream(&mut self, mut data: Bytes) -> Result<usize> {
        let n = data.len().min(self.space());
        if n == 0 && !data.is_empty() {
            return Err(Error::NoBufferSpace);
        }
        data.truncate(n);
        if n > 0 {
            self.segments.push_back(Segment {
                data,
                to: None,
                sent: 0,
            });
            self.len += n;
        }
        Ok(n)
    }

    /// Queue one datagram, whole or not at all.
    pub fn push_datagram(&mut self, data: Bytes, to: Option<SocketAddr>) -> Result<usize> {
        if data.len() > self.limit || u32::try_from(data.len()).is_err() {
            return Err(Error::MessageTooLarge);
        }
        if data.len() > self.space() {
            return Err(Error::NoBufferSpace);
        }
        let n = data.len();
        self.segments.push_back(Segment { data, to, sent: 0 });
        self.len += n;
        Ok(n)
    }

    /// Take up to `max` stream bytes from the front.
    pub fn take_stream(&mut self, max: usize) -> Bytes {
        let n = max.min(self.len);
        if n == 0 {
            return Bytes::new();
        }
        if let Some(front) = self.segments.front_mut() {
            // Common case: served from a single segment without copying.
            if front.data.len() >= n {
                let chunk = front.data.split_to(n);
                if front.data.is_empty() {
                    self.segments.pop_front();
                }
                self.len -= n;
                return chunk;
            }
        }
        let mut out = BytesMut::with_capacity(n);
        while out.len() < n {
            let Some(front) = self.segments.front_mut() else { break };
            let want = n - out.len();
            if front.data.len() <= want {
                out.extend_from_slice(&front.data);
                self.segments.pop_front();
            } else {
                out.extend_from_slice(&front.data.split_to(want));
            }
        }
        self.len -= out.len();
        out.freeze()
    }

    /// Put back stream bytes that could not be sent.
    pub fn unget_stream(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.segments.push_front(Segment {
            data,
            to: None,
            sent: 0,
        });
    }

    /// Empty the buffer, returning the unsent part of every write in order.
    pub fn take_all(&mut self) -> Vec<(Bytes, Option<SocketAddr>)> {
        self.len = 0;
        self.segments
            .drain(..)
            .map(|s| (s.data.slice(s.sent..), s.to))
            .collect()
    }

    /// Describe the next chunk of the front datagram without consuming it.
    pub fn peek_datagram_chunk(&self, chunk_size: usize) -> Option<DatagramChunk> {
        let front = self.segments.front()?;
        let total = front.data.len();
        let end = (front.sent + chunk_size).min(total);
        let first = front.sent == 0;
        Some(DatagramChunk {
            payload: front.data.slice(front.sent..end),
            to: if first { front.to } else { None },
            // Lossless: push_datagram refused anything wider than 32 bits.
            datagram_size: (first && total > chunk_size).then_some(total as u32),
            fragment: !first,
        })
    }

    /// Mark `n` bytes of the front datagram as sent.
    pub fn consume_datagram(&mut self, n: usize) {
        let Some(front) = self.segments.front_mut() else { return };
        let n = n.min(front.data.len() - front.sent);
        front.sent += n;
        self.len -= n;
        if front.sent == front.data.len() {
            self.segments.pop_front();
        }
    }
}

#[derive(Debug)]
struct Reassembly {
    total: usize,
    buf: BytesMut,
    from: Option<SocketAddr>,
}

/// Outcome of feeding one inbound datagram record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembled {
    /// A complete datagram.
    Complete(Bytes, Option<SocketAddr>),
    /// More fragments are expected.
    Partial,
    /// The fragment was dropped.
    Dropped(&'static str),
}

#[derive(Debug)]
pub struct RecvBuffer {
    pending: VecDeque<(Bytes, Option<SocketAddr>)>,
    len: usize,
    limit: usize,
    reassembly: Option<Reassembly>,
}

impl RecvBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            len: 0,
            limit,
            reassembly: None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Hold data the socket could not take. Fails when over the limit.
    pub fn hold(&mut self, data: Bytes, from: Option<SocketAddr>) -> Result<()> {
        if self.len + data.len() > self.limit {
            return Err(Error::NoBufferSpace);
        }
        self.len += data.len();
        self.pending.push_back((data, from));
        Ok(())
    }

    pub fn front(&self) -> Option<&(Bytes, Option<SocketAddr>)> {
        self.pending.front()
    }

    pub fn pop_front(&mut self) -> Option<(Bytes, Option<SocketAddr>)> {
        let item = self.pending.pop_front()?;
        self.len -= item.0.len();
        Some(item)
    }

    /// Drop `n` bytes from the front entry after a partial stream delivery.
    pub fn advance_front(&mut self, n: usize) {
        if let Some((data, _)) = self.pending.front_mut() {
            let n = n.min(data.len());
            let _ = data.split_to(n);
            self.len -= n;
            if data.is_empty() {
                self.pending.pop_front();
            }
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.len = 0;
        self.reassembly = None;
    }

    /// Feed one inbound datagram record.
    ///
    /// A record with `datagram_size` starts a new datagram (abandoning any
    /// incomplete one); a `fragment` record continues the current one; a
    /// record with neither is a datagram on its own.
    pub fn reassemble(
        &mut self,
        payload: Bytes,
        from: Option<SocketAddr>,
        datagram_size: Option<u32>,
        fragment: bool,
        max_size: usize,
    ) -> Reassembled {
        if fragment {
            let Some(current) = self.reassembly.as_mut() else {
                return Reassembled::Dropped("fragment without a datagram in progress");
            };
            if current.buf.len() + payload.len() > current.total {
                self.reassembly = None;
                return Reassembled::Dropped("fragment overruns declared datagram size");
            }
            current.buf.extend_from_slice(&payload);
        } else if let Some(total) = datagram_size {
            let total = total as usize;
            if total > max_size || payload.len() > total {
                self.reassembly = None;
                return Reassembled::Dropped("declared datagram size out of range");
            }
            let mut buf = BytesMut::with_capacity(total);
            buf.extend_from_slice(&payload);
            self.reassembly = Some(Reassembly { total, buf, from });
        } else {
            self.reassembly = None;
            return Reassembled::Complete(payload, from);
        }

        match self.reassembly.take() {
            Some(done) if done.buf.len() == done.total => {
                Reassembled::Complete(done.buf.freeze(), done.from)
            }
            other => {
                self.reassembly = other;
                Reassembled::Partial
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_limit_and_partial_accept() {
        let mut buf = SendBuffer::new(10);
        assert_eq!(buf.push_stream(Bytes::from_static(b"abcdefgh")).unwrap(), 8);
        assert_eq!(buf.push_stream(Bytes::from_static(b"ijkl")).unwrap(), 2);
        assert!(matches!(
            buf.push_stream(Bytes::from_static(b"x")),
            Err(Error::NoBufferSpace)
        ));
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn test_take_stream_spans_segments() {
        let mut buf = SendBuffer::new(100);
        buf.push_stream(Bytes::from_static(b"abc")).unwrap();
        buf.push_stream(Bytes::from_static(b"defg")).unwrap();
        assert_eq!(&buf.take_stream(2)[..], b"ab");
        assert_eq!(&buf.take_stream(4)[..], b"cdef");
        buf.unget_stream(Bytes::from_static(b"ef"));
        assert_eq!(&buf.take_stream(100)[..], b"efg");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_datagram_chunks() {
        let mut buf = SendBuffer::new(100);
        let to: SocketAddr = "8.8.8.8:53".parse().unwrap();
        buf.push_datagram(Bytes::from_static(b"0123456789"), Some(to)).unwrap();

        let first = buf.peek_datagram_chunk(4).unwrap();
        assert_eq!(&first.payload[..], b"0123");
        assert_eq!(first.to, Some(to));
        assert_eq!(first.datagram_size, Some(10));
        assert!(!first.fragment);
        buf.consume_datagram(4);

        let second = buf.peek_datagram_chunk(4).unwrap();
        assert_eq!(&second.payload[..], b"4567");
        assert_eq!(second.to, None);
        assert_eq!(second.datagram_size, None);
        assert!(second.fragment);
        buf.consume_datagram(4);
        buf.consume_datagram(2);
        assert!(buf.is_empty());
        assert!(buf.peek_datagram_chunk(4).is_none());
    }

    #[test]
    fn test_take_all_returns_unsent_writes_in_order() {
        let mut buf = SendBuffer::new(100);
        let to: SocketAddr = "8.8.8.8:53".parse().unwrap();
        buf.push_datagram(Bytes::from_static(b"0123456789"), Some(to)).unwrap();
        buf.push_datagram(Bytes::from_static(b"next"), None).unwrap();
        buf.consume_datagram(4);

        let pending = buf.take_all();
        assert_eq!(
            pending,
            vec![
                (Bytes::from_static(b"456789"), Some(to)),
                (Bytes::from_static(b"next"), None),
            ]
        );
        assert!(buf.is_empty());
        assert_eq!(buf.space(), 100);
    }

    #[test]
    fn test_small_datagram_is_not_fragmented() {
        let mut buf = SendBuffer::new(100);
        buf.push_datagram(Bytes::from_static(b"ping"), None).unwrap();
        let chunk = buf.peek_datagram_chunk(4096).unwrap();
        assert_eq!(chunk.datagram_size, None);
        assert!(!chunk.fragment);
    }

    #[test]
    fn test_reassembly() {
        let mut recv = RecvBuffer::new(1024);
        assert_eq!(
            recv.reassemble(Bytes::from_static(b"abc"), None, Some(6), false, 1024),
            Reassembled::Partial
        );
        assert_eq!(
            recv.reassemble(Bytes::from_static(b"def"), None, None, true, 1024),
            Reassembled::Complete(Bytes::from_static(b"abcdef"), None)
        );
        assert!(matches!(
            recv.reassemble(Bytes::from_static(b"zz"), None, None, true, 1024),
            Reassembled::Dropped(_)
        ));
    }

    #[test]
    fn test_reassembly_rejects_overrun() {
        let mut recv = RecvBuffer::new(1024);
        recv.reassemble(Bytes::from_static(b"ab"), None, Some(3), false, 1024);
        assert!(matches!(
            recv.reassemble(Bytes::from_static(b"cd"), None, None, true, 1024),
            Reassembled::Dropped(_)
        ));
        assert!(matches!(
            recv.reassemble(Bytes::from_static(b"x"), None, Some(4096), false, 1024),
            Reassembled::Dropped(_)
        ));
    }

    #[test]
    fn test_hold_limit() {
        let mut recv = RecvBuffer::new(4);
        recv.hold(Bytes::from_static(b"abc"), None).unwrap();
        assert!(recv.hold(Bytes::from_static(b"de"), None).is_err());
        recv.advance_front(2);
        assert_eq!(recv.len(), 1);
        assert_eq!(recv.pop_front().unwrap().0, Bytes::from_static(b"c"));
        assert!(recv.is_empty());
    }
}
