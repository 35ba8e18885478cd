//! Shared write side of an agent's control connection

use std::sync::Arc;
use tether_proto::{CodecError, Message, MessageCodec};
use tether_transport::BoxedStream;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

pub type ControlWriter = WriteHalf<BoxedStream>;

/// Cloneable handle to the control connection's writer.
///
/// The read half stays with the control task. Writers are serialized by the
/// lock, and the relay holds it for its whole duration so no control frame
/// can be interleaved with relayed bytes.
///
/// A failed write leaves the frame boundary unknown, so it closes the sender
/// for every clone; the control task observes that through [`closed`].
///
/// [`closed`]: ControlSender::closed
#[derive(Clone)]
pub struct ControlSender {
    writer: Arc<Mutex<ControlWriter>>,
    codec: MessageCodec,
    closed: Arc<watch::Sender<bool>>,
}

impl ControlSender {
    pub fn new(writer: ControlWriter, codec: MessageCodec) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
            codec,
            closed: Arc::new(watch::Sender::new(false)),
        }
    }

    /// Write one framed message. Any failure closes the sender.
    pub async fn send(&self, message: &Message) -> Result<u64, CodecError> {
        let mut writer = self.writer.lock().await;
        let result = self.codec.write_message(&mut *writer, message).await;
        drop(writer);

        if let Err(e) = &result {
            warn!("Control write failed, closing connection: {}", e);
            self.close();
        }
        result
    }

    /// Take exclusive access to the writer, e.g. for the duration of a relay
    pub async fn lock_owned(&self) -> OwnedMutexGuard<ControlWriter> {
        self.writer.clone().lock_owned().await
    }

    pub fn codec(&self) -> MessageCodec {
        self.codec
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the sender has been closed
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Shut the writer down on a detached task.
    ///
    /// Never blocks the caller; if a relay currently holds the writer the
    /// shutdown happens once it finishes. Only the first call has an effect.
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let writer = self.writer.clone();
        tokio::spawn(async move {
            let mut writer = writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!("Control connection shutdown failed: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_send_and_close() {
        let (local, mut remote) = duplex(1024);
        let (_reader, writer) = tokio::io::split(Box::new(local) as BoxedStream);
        let sender = ControlSender::new(writer, MessageCodec::default());

        sender.send(&Message::incoming("127.0.0.1:5000")).await.unwrap();
        let msg = MessageCodec::default().read_message(&mut remote).await.unwrap();
        assert_eq!(msg, Message::incoming("127.0.0.1:5000"));

        sender.close();
        let err = MessageCodec::default()
            .read_message(&mut remote)
            .await
            .unwrap_err();
        assert!(err.is_clean_close());
        assert!(sender.is_closed());
    }

    #[tokio::test]
    async fn test_failed_send_closes_every_clone() {
        let (local, remote) = duplex(1024);
        let (_reader, writer) = tokio::io::split(Box::new(local) as BoxedStream);
        let sender = ControlSender::new(writer, MessageCodec::default());
        let clone = sender.clone();
        drop(remote);

        assert!(!clone.is_closed());
        let err = sender.send(&Message::incoming("127.0.0.1:5000")).await.unwrap_err();
        assert!(matches!(err, CodecError::WriteError(_)));

        timeout(Duration::from_secs(1), clone.closed())
            .await
            .expect("clone did not observe the failed write");
        assert!(clone.is_closed());
    }
}
