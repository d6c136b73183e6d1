//! Message transport abstraction
//!
//! The core speaks to the outside world through a framed bidirectional
//! message stream. The wire serialization lives with the transport; the
//! connection only ever sees decoded [`Message`] values.

use async_trait::async_trait;

use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::message::Message;

/// A framed, bidirectional, reliable message stream.
///
/// Implementations must allow `send_message` and `recv_message` to be
/// driven concurrently from separate tasks.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Transmit one message. Blocks for transport-level backpressure.
    async fn send_message(&self, msg: Message) -> Result<()>;

    /// Receive the next message. Returns an error once the stream is
    /// closed or broken.
    async fn recv_message(&self) -> Result<Message>;

    /// Close the stream. Further sends and receives fail.
    async fn close(&self) -> Result<()>;
}

/// One end of an in-process transport pair.
///
/// Useful for connecting two vats in the same process and for driving a
/// connection from tests; messages move over bounded channels without
/// being serialized.
pub struct ChannelTransport {
    tx: mpsc::Sender<Message>,
    rx: Mutex<mpsc::Receiver<Message>>,
}

/// Create a connected transport pair with the given per-direction channel
/// capacity.
pub fn channel(capacity: usize) -> (ChannelTransport, ChannelTransport) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        ChannelTransport {
            tx: a_tx,
            rx: Mutex::new(a_rx),
        },
        ChannelTransport {
            tx: b_tx,
            rx: Mutex::new(b_rx),
        },
    )
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send_message(&self, msg: Message) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| Error::ConnClosed)
    }

    async fn recv_message(&self) -> Result<Message> {
        self.rx.lock().await.recv().await.ok_or(Error::ConnClosed)
    }

    async fn close(&self) -> Result<()> {
        // Stop accepting inbound traffic; the peer sees our end closed
        // once the sender side is dropped with the transport.
        self.rx.lock().await.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Exception;

    #[tokio::test]
    async fn pair_round_trip() {
        let (a, b) = channel(4);
        a.send_message(Message::Bootstrap { question_id: 0 })
            .await
            .unwrap();
        a.send_message(Message::Abort(Exception::new("bye")))
            .await
            .unwrap();

        assert_eq!(
            b.recv_message().await.unwrap(),
            Message::Bootstrap { question_id: 0 }
        );
        assert_eq!(
            b.recv_message().await.unwrap(),
            Message::Abort(Exception::new("bye"))
        );
    }

    #[tokio::test]
    async fn recv_fails_after_peer_drops() {
        let (a, b) = channel(1);
        drop(a);
        assert!(matches!(b.recv_message().await, Err(Error::ConnClosed)));
    }
}
