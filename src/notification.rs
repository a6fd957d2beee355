//! Typed events reported to the host after every successful mutation.

use tracing::{debug, warn};

use crate::segment::SegmentNumber;
use crate::volume::VolumeIndex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentationEvent {
    VolumeCreated {
        index: VolumeIndex,
    },
    VolumeDeleted {
        index: VolumeIndex,
    },
    SegmentAdded {
        volume_index: VolumeIndex,
        number: SegmentNumber,
    },
    SegmentDeleted {
        volume_index: VolumeIndex,
        number: SegmentNumber,
    },
    SegmentRelabeled {
        volume_index: VolumeIndex,
        number: SegmentNumber,
        label: String,
    },
    SegmentVisibilityChanged {
        volume_index: VolumeIndex,
        number: SegmentNumber,
        visible: bool,
    },
    ActiveSegmentChanged {
        volume_index: VolumeIndex,
        previous: SegmentNumber,
        current: SegmentNumber,
    },
    ActiveVolumeChanged {
        previous: Option<VolumeIndex>,
        current: Option<VolumeIndex>,
    },
    LabelmapMutated {
        volume_index: VolumeIndex,
    },
    SegmentationDecoded {
        volume_index: VolumeIndex,
        frame_ids: Vec<String>,
        segment_count: usize,
    },
    SegmentationLoadFailed {
        volume_index: VolumeIndex,
        reason: String,
    },
}

/// Receives session events. Closures taking `&SegmentationEvent` implement
/// this directly.
pub trait SegmentationObserver {
    fn on_event(&self, event: &SegmentationEvent);
}

impl<F> SegmentationObserver for F
where
    F: Fn(&SegmentationEvent),
{
    fn on_event(&self, event: &SegmentationEvent) {
        self(event)
    }
}

/// Writes every event to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SegmentationObserver for TracingObserver {
    fn on_event(&self, event: &SegmentationEvent) {
        match event {
            SegmentationEvent::SegmentationLoadFailed {
                volume_index,
                reason,
            } => warn!(volume_index, %reason, "segmentation load failed"),
            other => debug!(event = ?other, "segmentation event"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fan-out of events to the current subscribers, in subscription order.
#[derive(Default)]
pub struct NotificationPort {
    observers: Vec<(SubscriptionId, Box<dyn SegmentationObserver>)>,
    next_id: u64,
}

impl NotificationPort {
    pub fn subscribe(&mut self, observer: impl SegmentationObserver + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        self.observers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.observers.len()
    }

    pub(crate) fn emit(&self, event: SegmentationEvent) {
        for (_, observer) in &self.observers {
            observer.on_event(&event);
        }
    }
}

impl std::fmt::Debug for NotificationPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationPort")
            .field("subscribers", &self.observers.len())
            .finish()
    }
}
