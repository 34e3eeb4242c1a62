//! Frame buffering helpers.
//!
//! Both helpers move exactly one frame from `input` to `output` through a
//! private queue of `capacity` flits and stop after the end-of-frame flit.
//! `forward_frame` lets flits through as they arrive; `assemble_frame`
//! holds the frame back until it is complete, so a frame whose producer
//! fails part way never reaches the output.

use tokio::sync::mpsc;

use smi_core::Flit;

use crate::link::{recv_flit, send_flit};
use crate::BusError;

/// Stream one frame from `input` to `output`. Returns the flit count.
pub async fn forward_frame(
    input: &mut mpsc::Receiver<Flit>,
    output: &mpsc::Sender<Flit>,
    capacity: usize,
) -> Result<usize, BusError> {
    let (tx, mut rx) = mpsc::channel::<Flit>(capacity.max(1));

    let intake = async move {
        loop {
            let flit = recv_flit(input).await?;
            let last = flit.is_last();
            send_flit(&tx, flit).await?;
            if last {
                return Ok::<_, BusError>(());
            }
        }
    };

    let drain = async move {
        let mut count = 0;
        while let Some(flit) = rx.recv().await {
            send_flit(output, flit).await?;
            count += 1;
        }
        Ok::<_, BusError>(count)
    };

    let (taken, forwarded) = tokio::join!(intake, drain);
    taken?;
    forwarded
}

/// Collect one complete frame from `input`, then send it to `output`.
/// Returns the flit count.
pub async fn assemble_frame(
    input: &mut mpsc::Receiver<Flit>,
    output: &mpsc::Sender<Flit>,
    capacity: usize,
) -> Result<usize, BusError> {
    let capacity = capacity.max(1);
    let (tx, mut rx) = mpsc::channel::<Flit>(capacity);

    loop {
        let flit = recv_flit(input).await?;
        let last = flit.is_last();
        tx.try_send(flit).map_err(|_| BusError::FrameOverflow(capacity))?;
        if last {
            break;
        }
    }
    drop(tx);

    let mut count = 0;
    while let Some(flit) = rx.recv().await {
        send_flit(output, flit).await?;
        count += 1;
    }
    tracing::trace!(flits = count, "assembled frame forwarded");
    Ok(count)
}
