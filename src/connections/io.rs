// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::io;
use std::task::Poll;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A duplex byte stream carrying tunnel traffic, such as a relay websocket or
/// a forwarded-port channel.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelStream for T {}

/// Owned boxed form of a tunnel stream, handed across the event and
/// forwarding APIs.
pub type BoxedTunnelStream = Box<dyn TunnelStream>;

/// Carry-over storage for poll-based readers that are fed whole messages.
/// A message larger than the caller's buffer has its tail parked here, and
/// later reads consume the tail through a cursor instead of reallocating
/// what is left.
#[derive(Default)]
pub(crate) struct ReadBuffer {
    parked: Vec<u8>,
    cursor: usize,
}

impl ReadBuffer {
    fn is_empty(&self) -> bool {
        self.cursor >= self.parked.len()
    }

    /// Moves parked bytes into the target, as many as fit. Returns whether
    /// the target received anything; when it did, the read is complete and
    /// the source must not be polled for more.
    pub fn drain(&mut self, target: &mut ReadBuf<'_>) -> bool {
        if self.is_empty() {
            return false;
        }

        let count = target.remaining().min(self.parked.len() - self.cursor);
        if count == 0 {
            return false;
        }
        target.put_slice(&self.parked[self.cursor..self.cursor + count]);
        self.cursor += count;
        if self.is_empty() {
            self.parked.clear();
            self.cursor = 0;
        }
        true
    }

    /// Hands a freshly-received message to the caller: what fits goes into
    /// the target now, the rest is parked for the next read. The message
    /// must not be empty, since a read that fills zero bytes means end of
    /// stream; callers skip empty messages instead.
    pub fn deliver(
        &mut self,
        target: &mut ReadBuf<'_>,
        message: &[u8],
    ) -> Poll<io::Result<()>> {
        debug_assert!(self.is_empty(), "parked bytes must drain before new messages");
        debug_assert!(!message.is_empty());

        let count = target.remaining().min(message.len());
        target.put_slice(&message[..count]);
        if count < message.len() {
            self.parked.extend_from_slice(&message[count..]);
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::ReadBuffer;

    #[test]
    fn oversized_messages_drain_across_reads() {
        let mut rb = ReadBuffer::default();

        let mut storage = [0u8; 3];
        let mut target = tokio::io::ReadBuf::new(&mut storage);
        assert!(!rb.drain(&mut target));
        assert!(rb.deliver(&mut target, &[1, 2, 3, 4, 5, 6, 7]).is_ready());
        assert_eq!(target.filled(), &[1, 2, 3]);

        let mut storage = [0u8; 3];
        let mut target = tokio::io::ReadBuf::new(&mut storage);
        assert!(rb.drain(&mut target));
        assert_eq!(target.filled(), &[4, 5, 6]);

        let mut storage = [0u8; 3];
        let mut target = tokio::io::ReadBuf::new(&mut storage);
        assert!(rb.drain(&mut target));
        assert_eq!(target.filled(), &[7]);
        assert!(!rb.drain(&mut target));
    }

    #[test]
    fn fitting_messages_leave_nothing_parked() {
        let mut rb = ReadBuffer::default();
        let mut storage = [0u8; 8];
        let mut target = tokio::io::ReadBuf::new(&mut storage);

        assert!(rb.deliver(&mut target, &[9, 8, 7]).is_ready());
        assert_eq!(target.filled(), &[9, 8, 7]);

        let mut storage = [0u8; 8];
        let mut target = tokio::io::ReadBuf::new(&mut storage);
        assert!(!rb.drain(&mut target));
    }
}
