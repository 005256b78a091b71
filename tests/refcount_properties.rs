// SPDX-License-Identifier: GPL-3.0-only

//! Property tests for per-buffer reference counting

mod common;

use camera_splitter::BufferTracker;
use camera_splitter::transport::memory::{FrameInfo, MemoryBuffer, SyncPointFence};
use camera_splitter::transport::{GraphicBuffer, PixelFormat, SurfaceId};
use common::Harness;
use proptest::prelude::*;
use std::collections::BTreeSet;

/// What happens to each output after it received the frame
#[derive(Debug, Clone, Copy)]
enum Fate {
    Release,
    Remove,
}

fn fate() -> impl Strategy<Value = Fate> {
    prop_oneof![Just(Fate::Release), Just(Fate::Remove)]
}

/// Outputs, which of them (plus one id that is never live) get the frame,
/// and the order in which outputs are dealt with
fn scenario() -> impl Strategy<Value = (usize, Vec<bool>, Vec<Fate>, Vec<usize>)> {
    (1usize..5).prop_flat_map(|outputs| {
        (
            Just(outputs),
            prop::collection::vec(any::<bool>(), outputs + 1),
            prop::collection::vec(fate(), outputs),
            Just((0..outputs).collect::<Vec<_>>()).prop_shuffle(),
        )
    })
}

proptest! {
    #[test]
    fn prop_buffer_returns_exactly_once((outputs, requested, fates, order) in scenario()) {
        let h = Harness::new(outputs);
        let surface_ids: Vec<SurfaceId> = requested
            .iter()
            .enumerate()
            .filter_map(|(id, &wanted)| wanted.then_some(id))
            .collect();
        let live: Vec<SurfaceId> = surface_ids.iter().copied().filter(|&id| id < outputs).collect();

        let buffer = h.send_frame(&surface_ids, FrameInfo::at(1));
        let mut frames: Vec<_> = (0..outputs).map(|id| h.output(id).acquire()).collect();
        for id in 0..outputs {
            prop_assert_eq!(frames[id].is_some(), live.contains(&id));
        }

        let mut expected_points = BTreeSet::new();
        let mut removed_holder = false;
        // Nothing live holds the frame, so it goes straight back
        prop_assert_eq!(h.returns(), usize::from(live.is_empty()));

        for &id in &order {
            if h.returns() == 1 {
                break;
            }
            match fates[id] {
                Fate::Release => {
                    if let Some(frame) = frames[id].take() {
                        h.release(id, &frame, id as u64 + 1);
                        expected_points.insert(id as u64 + 1);
                    }
                }
                Fate::Remove => {
                    removed_holder |= frames[id].is_some();
                    h.splitter.remove_output(id).unwrap();
                }
            }
        }

        prop_assert_eq!(h.returns(), 1);
        prop_assert_eq!(h.splitter.reference_count(buffer.id()), None);

        let stats = h.splitter.stats();
        prop_assert_eq!(stats.tracked_buffers, 0);
        prop_assert_eq!(stats.acquired_input_buffers, 0);
        prop_assert_eq!(stats.pending_forced_detaches, 0);

        if removed_holder {
            prop_assert_eq!(h.producer.detached(), vec![buffer.id()]);
        } else {
            let released = h.producer.released();
            prop_assert_eq!(released.len(), 1);
            prop_assert_eq!(
                released[0].1.points(),
                expected_points.into_iter().collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn prop_tracker_count_matches_remaining_surfaces(
        requested in prop::collection::vec(0usize..8, 0..8),
        releases in prop::collection::vec(0usize..10, 0..20),
    ) {
        let buffer = MemoryBuffer::new(1, 4, 4, PixelFormat::RGBA_8888);
        let mut tracker: BufferTracker<_, SyncPointFence> = BufferTracker::new(buffer, &requested);
        let mut remaining: BTreeSet<usize> = requested.iter().copied().collect();
        prop_assert_eq!(tracker.reference_count(), remaining.len());

        for id in releases {
            remaining.remove(&id);
            let count = tracker.decrement_reference_count(id);
            prop_assert_eq!(count, remaining.len());
            prop_assert_eq!(tracker.requested_surfaces().len(), remaining.len());
            prop_assert!(!tracker.is_requested_by(id));
        }
    }
}
