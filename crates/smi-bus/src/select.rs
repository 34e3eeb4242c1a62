//! Round-robin receive across a set of channels.

use futures::future::poll_fn;
use std::task::Poll;

use tokio::sync::mpsc;

/// Wait until any receiver has a value and take it, scanning from `start`
/// so that the port after the last winner gets the first look.
///
/// Returns the index of the winning receiver and its value, or None once
/// every receiver is closed and empty.
pub async fn recv_round_robin<T>(receivers: &mut [mpsc::Receiver<T>], start: usize) -> Option<(usize, T)> {
    poll_fn(|cx| {
        let n = receivers.len();
        let mut closed = 0;
        for i in 0..n {
            let idx = (start + i) % n;
            match receivers[idx].poll_recv(cx) {
                Poll::Ready(Some(value)) => return Poll::Ready(Some((idx, value))),
                Poll::Ready(None) => closed += 1,
                Poll::Pending => {}
            }
        }
        if closed == n {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    })
    .await
}
