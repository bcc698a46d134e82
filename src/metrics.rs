use commonware_utils::hex;
use prometheus_client::encoding::EncodeLabelSet;

use crate::types::PkiId;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Peer {
    pub peer: String,
}

impl Peer {
    pub fn new(peer: &PkiId) -> Self {
        Self { peer: hex(peer) }
    }
}
