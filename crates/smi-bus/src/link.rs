//! SMI links: a pair of bounded flit channels, one per direction.

use tokio::sync::mpsc;

use smi_core::Flit;

use crate::BusError;

/// Client side of a link: sends requests, receives responses.
#[derive(Debug)]
pub struct Link {
    pub request: mpsc::Sender<Flit>,
    pub response: mpsc::Receiver<Flit>,
}

/// Memory side of a link: receives requests, sends responses.
#[derive(Debug)]
pub struct LinkEndpoint {
    pub request: mpsc::Receiver<Flit>,
    pub response: mpsc::Sender<Flit>,
}

/// Create a connected link. Each direction buffers `capacity` flits.
pub fn link(capacity: usize) -> (Link, LinkEndpoint) {
    let (req_tx, req_rx) = mpsc::channel(capacity.max(1));
    let (resp_tx, resp_rx) = mpsc::channel(capacity.max(1));
    (
        Link {
            request: req_tx,
            response: resp_rx,
        },
        LinkEndpoint {
            request: req_rx,
            response: resp_tx,
        },
    )
}

/// Receive one flit, treating a closed channel as a torn-down link.
pub async fn recv_flit(rx: &mut mpsc::Receiver<Flit>) -> Result<Flit, BusError> {
    rx.recv().await.ok_or(BusError::LinkClosed)
}

pub async fn send_flit(tx: &mpsc::Sender<Flit>, flit: Flit) -> Result<(), BusError> {
    tx.send(flit).await.map_err(|_| BusError::LinkClosed)
}
