//! Frame encoding and reassembly shared by both transports.
//!
//! A frame is `[prefix][payload]`. TCP frames carry one frame per stream and
//! end with [`TCP_TERMINATOR`]; a UDP datagram is always exactly one frame.

use bytes::{BufMut, Bytes};
use std::io::{ErrorKind, Read};
use std::sync::Arc;

use super::buffer_pool::{BufferPool, PooledBuffer};
use super::prefix::{FrameError, MessagePrefix, TransportKind, PREFIX_SIZE};

/// Sentinel byte closing every TCP frame.
///
/// Frames carry no length, so a stream half-closed right after a payload byte
/// equal to the sentinel reads as a complete, shorter frame.
pub const TCP_TERMINATOR: u8 = 0x1A;

/// Number of bytes `payload` occupies on the wire for `kind`
pub fn encoded_len(payload_len: usize, kind: TransportKind) -> usize {
    match kind {
        TransportKind::Tcp => PREFIX_SIZE + payload_len + 1,
        TransportKind::Udp => PREFIX_SIZE + payload_len,
    }
}

/// Serialize a frame for `kind` into `buf`
pub fn encode_frame<B: BufMut>(
    prefix: &MessagePrefix,
    payload: &[u8],
    kind: TransportKind,
    buf: &mut B,
) {
    prefix.put(buf);
    buf.put_slice(payload);
    if kind == TransportKind::Tcp {
        buf.put_u8(TCP_TERMINATOR);
    }
}

/// Split a complete frame into its prefix and payload
pub fn decode_frame(
    frame: &[u8],
    kind: TransportKind,
) -> Result<(MessagePrefix, Bytes), FrameError> {
    let body = match kind {
        TransportKind::Tcp => match frame.split_last() {
            Some((&TCP_TERMINATOR, body)) if body.len() >= PREFIX_SIZE => body,
            _ => return Err(FrameError::Truncated(frame.len())),
        },
        TransportKind::Udp => frame,
    };

    let prefix = MessagePrefix::decode(body)?;
    Ok((prefix, Bytes::copy_from_slice(&body[PREFIX_SIZE..])))
}

/// Read one TCP frame until the peer closes its side of the stream.
///
/// Bytes land in pooled buffers; a fresh buffer is borrowed whenever the
/// current one fills up. The buffers are concatenated once the stream ends
/// and all of them go back to the pool, whatever the outcome.
pub fn read_stream_frame<R: Read>(
    reader: &mut R,
    pool: &Arc<BufferPool>,
    max_frame_size: usize,
) -> Result<(MessagePrefix, Bytes), FrameError> {
    let mut chunks: Vec<(PooledBuffer, usize)> = Vec::new();
    let mut total = 0usize;

    'stream: loop {
        let mut chunk = pool.get();
        let mut filled = 0usize;

        while filled < chunk.len() {
            match reader.read(&mut chunk[filled..]) {
                Ok(0) => {
                    chunks.push((chunk, filled));
                    break 'stream;
                }
                Ok(n) => {
                    filled += n;
                    total += n;
                    if total > max_frame_size {
                        return Err(FrameError::TooLarge {
                            limit: max_frame_size,
                        });
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        chunks.push((chunk, filled));
    }

    let mut frame = Vec::with_capacity(total);
    for (chunk, len) in &chunks {
        frame.extend_from_slice(&chunk[..*len]);
    }
    drop(chunks);

    decode_frame(&frame, TransportKind::Tcp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::prefix::{DeliveryMethod, MessageType};
    use std::io::{self, Cursor};

    const BUF: usize = 16;

    fn tcp_bytes(prefix: &MessagePrefix, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encode_frame(prefix, payload, TransportKind::Tcp, &mut out);
        out
    }

    /// Reader that hands out at most `step` bytes per call
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_stream_reassembly_across_buffer_sizes() {
        let pool = BufferPool::new(BUF, 2);
        let prefix = MessagePrefix::new(3, MessageType::Data, DeliveryMethod::ReliableOrdered, 11);

        let sizes = [
            0,
            1,
            BUF - PREFIX_SIZE - 1,
            BUF - PREFIX_SIZE,
            BUF,
            BUF * 3,
            BUF * 5 + 7,
        ];
        for size in sizes {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let wire = tcp_bytes(&prefix, &payload);
            assert_eq!(wire.len(), encoded_len(size, TransportKind::Tcp));

            let (decoded, body) =
                read_stream_frame(&mut Cursor::new(wire), &pool, 1 << 20).unwrap();
            assert_eq!(decoded, prefix);
            assert_eq!(&body[..], &payload[..], "payload size {}", size);
            assert_eq!(pool.available(), pool.allocated());
        }
    }

    #[test]
    fn test_partial_reads_are_not_frame_boundaries() {
        let pool = BufferPool::new(BUF, 1);
        let prefix = MessagePrefix::new(0, MessageType::Data, DeliveryMethod::ReliableUnordered, 1);
        let payload = vec![TCP_TERMINATOR; 40];
        let mut reader = Trickle {
            data: tcp_bytes(&prefix, &payload),
            pos: 0,
            step: 3,
        };

        let (_, body) = read_stream_frame(&mut reader, &pool, 1 << 20).unwrap();
        assert_eq!(&body[..], &payload[..]);
    }

    #[test]
    fn test_early_close_is_truncated() {
        let pool = BufferPool::new(BUF, 1);
        let prefix = MessagePrefix::new(0, MessageType::Data, DeliveryMethod::ReliableOrdered, 1);
        let mut wire = tcp_bytes(&prefix, b"hello world");
        wire.truncate(wire.len() - 4);

        let result = read_stream_frame(&mut Cursor::new(wire), &pool, 1 << 20);
        assert!(matches!(result, Err(FrameError::Truncated(_))));
        assert_eq!(pool.available(), pool.allocated());

        let result = read_stream_frame(&mut Cursor::new(Vec::new()), &pool, 1 << 20);
        assert!(matches!(result, Err(FrameError::Truncated(0))));
    }

    #[test]
    fn test_terminator_appended_even_when_buffer_is_exactly_filled() {
        let prefix = MessagePrefix::new(0, MessageType::Data, DeliveryMethod::ReliableOrdered, 1);
        for size in [0, BUF - PREFIX_SIZE - 1, BUF - PREFIX_SIZE] {
            let wire = tcp_bytes(&prefix, &vec![1u8; size]);
            assert_eq!(wire.last(), Some(&TCP_TERMINATOR));
            assert_eq!(wire.len(), PREFIX_SIZE + size + 1);
        }
    }

    #[test]
    fn test_cut_ending_on_terminator_reads_as_shorter_frame() {
        let pool = BufferPool::new(BUF, 1);
        let prefix = MessagePrefix::new(0, MessageType::Data, DeliveryMethod::ReliableOrdered, 1);
        let wire = tcp_bytes(&prefix, &[9, TCP_TERMINATOR, 9, 9]);

        // Cut right after the payload's own sentinel-valued byte.
        let cut = &wire[..PREFIX_SIZE + 2];
        let (_, body) = read_stream_frame(&mut Cursor::new(cut.to_vec()), &pool, 1 << 20).unwrap();
        assert_eq!(&body[..], &[9]);
    }

    #[test]
    fn test_frame_limit() {
        let pool = BufferPool::new(BUF, 1);
        let prefix = MessagePrefix::new(0, MessageType::Data, DeliveryMethod::ReliableOrdered, 1);
        let wire = tcp_bytes(&prefix, &[7u8; 100]);

        let result = read_stream_frame(&mut Cursor::new(wire), &pool, 64);
        assert!(matches!(result, Err(FrameError::TooLarge { limit: 64 })));
        assert_eq!(pool.available(), pool.allocated());
    }

    #[test]
    fn test_datagram_decode() {
        let prefix = MessagePrefix::new(9, MessageType::Data, DeliveryMethod::UnreliableSequenced, 4);
        let mut wire = Vec::new();
        encode_frame(&prefix, b"ping", TransportKind::Udp, &mut wire);
        assert_eq!(wire.len(), encoded_len(4, TransportKind::Udp));

        let (decoded, body) = decode_frame(&wire, TransportKind::Udp).unwrap();
        assert_eq!(decoded, prefix);
        assert_eq!(&body[..], b"ping");
    }

    #[test]
    fn test_bad_prefix_in_stream() {
        let pool = BufferPool::new(BUF, 1);
        let prefix = MessagePrefix::new(0, MessageType::Data, DeliveryMethod::ReliableOrdered, 1);
        let mut wire = tcp_bytes(&prefix, b"x");
        wire[4] = 0xEE;

        let result = read_stream_frame(&mut Cursor::new(wire), &pool, 1 << 20);
        assert!(matches!(result, Err(FrameError::UnknownMessageType(0xEE))));
    }
}
