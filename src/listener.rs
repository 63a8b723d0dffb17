// Copyright 2020 Joyent, Inc.

use std::sync::mpsc::Sender;
use std::sync::{Arc, PoisonError, RwLock};

use crate::node::NodeAddress;

/// Receives peer liveness information discovered as a side effect of pool
/// use. Notifications may repeat for the same node; implementers that care
/// must de-duplicate.
pub trait NodeStatusListener: Send + Sync {
    fn node_died(&self, address: &NodeAddress);
    fn node_alive(&self, address: &NodeAddress);
}

/// Messages sent by a `ChannelListener`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeStatusMsg {
    Died(NodeAddress),
    Alive(NodeAddress),
}

/// A `NodeStatusListener` that forwards every notification over a channel.
/// Send failures (the receiver is gone) are ignored.
#[derive(Debug)]
pub struct ChannelListener {
    tx: Sender<NodeStatusMsg>,
}

impl ChannelListener {
    pub fn new(tx: Sender<NodeStatusMsg>) -> Self {
        ChannelListener { tx }
    }
}

impl NodeStatusListener for ChannelListener {
    fn node_died(&self, address: &NodeAddress) {
        let _ = self.tx.send(NodeStatusMsg::Died(address.clone()));
    }

    fn node_alive(&self, address: &NodeAddress) {
        let _ = self.tx.send(NodeStatusMsg::Alive(address.clone()));
    }
}

// The set of listeners registered with a pool.
#[derive(Default)]
pub(crate) struct NodeStatusListeners {
    listeners: RwLock<Vec<Arc<dyn NodeStatusListener>>>,
}

impl NodeStatusListeners {
    pub(crate) fn add(&self, listener: Arc<dyn NodeStatusListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub(crate) fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub(crate) fn node_died(&self, address: &NodeAddress) {
        self.snapshot().iter().for_each(|l| l.node_died(address));
    }

    pub(crate) fn node_alive(&self, address: &NodeAddress) {
        self.snapshot().iter().for_each(|l| l.node_alive(address));
    }

    // Listeners run without the lock held so they may register others.
    fn snapshot(&self) -> Vec<Arc<dyn NodeStatusListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
