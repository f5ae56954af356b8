//! DMA completion events, delivered from the DMA context to the manager.
//!
//! The DMA/interrupt side owns the producer and pushes one event per
//! completed RDM-change instruction. The owning device drains the consumer
//! whenever it services completions, so the callback always runs under
//! the manager lock.

use crate::types::PipeId;
use rtrb::{Consumer, Producer, RingBuffer};

/// Capacity of a completion queue. One RDM-change per pipe can be in
/// flight, so this only needs to absorb bursts across restarts.
pub const COMPLETION_QUEUE_CAPACITY: usize = 64;

/// Creates a completion queue pair.
///
/// Returns (producer for the DMA context, consumer for the device).
pub fn new_completion_queue() -> (Producer<DmaEvent>, Consumer<DmaEvent>) {
    RingBuffer::new(COMPLETION_QUEUE_CAPACITY)
}

/// Events reported by the DMA context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaEvent {
    /// Hardware finished an RDM-change cycle on `pipe`. With `restartable`
    /// unset the next epoch waits for the end of the current operation.
    RdmChangeDone { pipe: PipeId, restartable: bool },
}

impl DmaEvent {
    pub fn pipe(&self) -> PipeId {
        match self {
            DmaEvent::RdmChangeDone { pipe, .. } => *pipe,
        }
    }
}

/// Pop every pending event.
pub(crate) fn drain(rx: &mut Consumer<DmaEvent>) -> Vec<DmaEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.pop() {
        out.push(ev);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_roundtrip() {
        let (mut tx, mut rx) = new_completion_queue();
        tx.push(DmaEvent::RdmChangeDone { pipe: 2, restartable: true }).unwrap();
        tx.push(DmaEvent::RdmChangeDone { pipe: 0, restartable: false }).unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.iter().map(DmaEvent::pipe).collect::<Vec<_>>(), vec![2, 0]);
        assert_eq!(events[1], DmaEvent::RdmChangeDone { pipe: 0, restartable: false });
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn queue_is_bounded() {
        let (mut tx, _rx) = new_completion_queue();
        for _ in 0..COMPLETION_QUEUE_CAPACITY {
            tx.push(DmaEvent::RdmChangeDone { pipe: 0, restartable: true }).unwrap();
        }
        assert!(tx.push(DmaEvent::RdmChangeDone { pipe: 0, restartable: true }).is_err());
    }
}
