use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::ScpError;
use crate::packet::{CoreAddr, ScpResponse};

pub(crate) type CmdResult = Result<ScpResponse, ScpError>;

/// A fully-formed request waiting in the backlog for a free slot. Ownership of its
///  data moves into the slot the instant it is admitted.
pub(crate) struct QueuedRequest {
    pub dest: CoreAddr,
    pub cmd: u16,
    pub args: Vec<u32>,
    pub payload: Vec<u8>,
    /// single-fire completion: the submitting future awaits the other end
    pub result_tx: oneshot::Sender<CmdResult>,
}

/// State of one outstanding-request slot. A single enum is the authority here -
///  the in-flight-send and cancellation conditions live in the slot's driver
///  future, not in flag combinations.
enum SlotState {
    Free,
    Active {
        seq_num: u16,
        /// Taken when a matching response is routed (or on teardown); an active
        ///  slot without a sender is merely waiting for its driver to release it.
        response_tx: Option<oneshot::Sender<ScpResponse>>,
    },
}

/// Fixed-size arena of outstanding-request slots plus an auxiliary map from
///  sequence number to slot index, so response demultiplexing does not scan.
///
/// Invariant: a sequence number is unique among active slots at any instant;
///  it may be reused once its slot is released.
pub(crate) struct SlotPool {
    slots: Vec<SlotState>,
    free: Vec<usize>,
    by_seq_num: FxHashMap<u16, usize>,
}

impl SlotPool {
    pub fn new(n_outstanding: usize) -> SlotPool {
        SlotPool {
            slots: (0..n_outstanding).map(|_| SlotState::Free).collect(),
            free: (0..n_outstanding).rev().collect(),
            by_seq_num: FxHashMap::default(),
        }
    }

    pub fn has_free(&self) -> bool {
        !self.free.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_active_seq_num(&self, seq_num: u16) -> bool {
        self.by_seq_num.contains_key(&seq_num)
    }

    /// Claim a free slot for the given sequence number, returning the slot index
    ///  and the receiving end of its response channel.
    pub fn activate(&mut self, seq_num: u16) -> Option<(usize, oneshot::Receiver<ScpResponse>)> {
        let idx = self.free.pop()?;
        debug_assert!(!self.by_seq_num.contains_key(&seq_num));

        let (response_tx, response_rx) = oneshot::channel();
        self.slots[idx] = SlotState::Active {
            seq_num,
            response_tx: Some(response_tx),
        };
        self.by_seq_num.insert(seq_num, idx);
        Some((idx, response_rx))
    }

    /// Return a slot to the pool. Only the slot's driver calls this, and only
    ///  once its pending send (if any) has completed.
    pub fn release(&mut self, idx: usize) {
        match std::mem::replace(&mut self.slots[idx], SlotState::Free) {
            SlotState::Active { seq_num, .. } => {
                self.by_seq_num.remove(&seq_num);
                self.free.push(idx);
            }
            SlotState::Free => panic!("this is a bug: released a slot that is not active"),
        }
    }

    /// Route a decoded response to the slot owning its sequence number. Returns
    ///  false if no active slot matches - the caller drops the response silently,
    ///  which is the intended fate of stray, duplicate and late datagrams.
    pub fn route_response(&mut self, seq_num: u16, response: ScpResponse) -> bool {
        let Some(&idx) = self.by_seq_num.get(&seq_num) else {
            return false;
        };
        match &mut self.slots[idx] {
            SlotState::Active { response_tx, .. } => {
                if let Some(tx) = response_tx.take() {
                    // the driver may have given up in this very processing step;
                    //  a failed send is equivalent to an unmatched response
                    if tx.send(response).is_err() {
                        trace!("slot for seq {} no longer listening", seq_num);
                    }
                    true
                }
                else {
                    // duplicate response arriving after the first one was routed
                    false
                }
            }
            SlotState::Free => false,
        }
    }

    /// Teardown: drop every active slot's response sender, making each driver
    ///  observe cancellation at its next suspension point. Slots stay active until
    ///  their drivers release them.
    pub fn cancel_all(&mut self) {
        for slot in &mut self.slots {
            if let SlotState::Active { response_tx, .. } = slot {
                response_tx.take();
            }
        }
    }
}
