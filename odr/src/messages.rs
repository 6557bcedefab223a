use futures::channel::mpsc::UnboundedSender;
use log::debug;

use crate::{
    misc::{BlockHead, DialFailure, NodeAddress, PeerId, ServerAnnouncement},
    request::{Request, Response},
};

pub enum OdrToNetwork {
    SendRequest { peer_id: PeerId, request: Request },
    Dial(NodeAddress),
}

impl OdrToNetwork {
    pub fn send(self, tx: &UnboundedSender<Self>) {
        if tx.unbounded_send(self).is_err() {
            debug!("send from ODR to network failed because the receiver was dropped");
        }
    }
}

pub enum NetworkToOdr {
    PeerConnected(ServerAnnouncement),
    PeerDisconnected(PeerId),
    HeadAnnounced(PeerId, BlockHead),
    Response(Response),
    DialFailed(PeerId, DialFailure),
}

impl NetworkToOdr {
    pub fn send(self, tx: &UnboundedSender<Self>) {
        if tx.unbounded_send(self).is_err() {
            debug!("send from network to ODR failed because the receiver was dropped");
        }
    }
}
