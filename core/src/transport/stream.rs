// Broadcast-channel backed streams
//
// Each subscriber gets its own receiver, so `receive()` / `discover()` can be
// called again after a consumer goes away. A lagging subscriber skips the
// events it missed and keeps going; the stream ends only when the sending
// transport is dropped.

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tracing::warn;

/// Turn a broadcast receiver into a boxed stream
pub fn broadcast_stream<T>(rx: broadcast::Receiver<T>) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Stream subscriber lagged, skipped {} items", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_yields_in_order() {
        let (tx, rx) = broadcast::channel(8);
        let mut s = broadcast_stream(rx);
        tx.send(1u32).unwrap();
        tx.send(2u32).unwrap();
        assert_eq!(s.next().await, Some(1));
        assert_eq!(s.next().await, Some(2));
    }

    #[tokio::test]
    async fn test_stream_restartable() {
        let (tx, rx) = broadcast::channel(8);
        drop(broadcast_stream(rx));

        let mut again = broadcast_stream(tx.subscribe());
        tx.send("frame").unwrap();
        assert_eq!(again.next().await, Some("frame"));
    }

    #[tokio::test]
    async fn test_lagged_subscriber_recovers() {
        let (tx, rx) = broadcast::channel(2);
        let mut s = broadcast_stream(rx);
        for i in 0..5u32 {
            tx.send(i).unwrap();
        }
        // Oldest items were overwritten; the stream resumes at what is left
        assert_eq!(s.next().await, Some(3));
        assert_eq!(s.next().await, Some(4));
    }

    #[tokio::test]
    async fn test_stream_ends_when_sender_dropped() {
        let (tx, rx) = broadcast::channel::<u8>(2);
        let mut s = broadcast_stream(rx);
        drop(tx);
        assert_eq!(s.next().await, None);
    }
}
