//! Relay pipeline properties: bounded queues, eviction order, outgoing
//! timestamps and transform fallback

use std::sync::Arc;

use depthrelay_core::data::{Frame, PixelFormat};
use depthrelay_core::relay::{FrameRelayQueue, PushOutcome, SyntheticTrack};
use depthrelay_core::transform::{FnTransform, FrameTransform, InvertTransform, TransformStage};
use depthrelay_core::Error;
use proptest::prelude::*;

fn tagged(id: i64) -> Frame {
    Frame::filled(2, 2, PixelFormat::Gray8, id, (id % 200) as u8).unwrap()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #[test]
    fn queue_never_exceeds_capacity_and_evicts_oldest(
        capacity in 1usize..16,
        ops in prop::collection::vec(any::<bool>(), 1..200),
    ) {
        let queue = FrameRelayQueue::new("prop", capacity).unwrap();
        let mut next_id = 0i64;
        let mut last_pulled = -1i64;

        // true = push, false = pull; pushes outpace pulls on average
        for push in ops {
            if push {
                let outcome = queue.push(tagged(next_id));
                if let PushOutcome::Evicted(old) = outcome {
                    // The evicted frame is the oldest buffered one, never the newest
                    prop_assert!(old.pts() < next_id);
                    prop_assert!(old.pts() > last_pulled);
                }
                next_id += 1;
            } else if let Some(frame) = queue.try_pull() {
                prop_assert!(frame.pts() > last_pulled);
                last_pulled = frame.pts();
            }
            prop_assert!(queue.len() <= capacity);
        }

        let stats = queue.stats();
        prop_assert_eq!(stats.pushed, next_id as u64);
        prop_assert_eq!(stats.pushed, stats.pulled + stats.evicted + queue.len() as u64);
    }

    #[test]
    fn outgoing_pts_strictly_increasing(upstream in prop::collection::vec(-1000i64..1000, 1..64)) {
        let rt = runtime();
        let stamped: Vec<i64> = rt.block_on(async {
            let queue = Arc::new(FrameRelayQueue::new("prop", upstream.len()).unwrap());
            let track = SyntheticTrack::video("prop", Arc::clone(&queue), 30, false).unwrap();
            for pts in &upstream {
                queue.push(tagged(*pts));
            }
            let mut out = Vec::new();
            for _ in 0..upstream.len() {
                out.push(track.recv().await.unwrap().pts());
            }
            out
        });

        for pair in stamped.windows(2) {
            prop_assert!(pair[0] < pair[1]);
        }
    }
}

#[test]
fn sustained_overload_keeps_newest_frames() {
    let queue = FrameRelayQueue::new("overload", 60).unwrap();
    for id in 0..500 {
        queue.push(tagged(id));
    }

    assert_eq!(queue.len(), 60);
    assert_eq!(queue.evicted_count(), 440);
    let ids: Vec<i64> = std::iter::from_fn(|| queue.try_pull()).map(|f| f.pts()).collect();
    assert_eq!(ids, (440..500).collect::<Vec<_>>());
}

#[tokio::test]
async fn transform_failure_on_fifth_frame_passes_it_through() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let stage = TransformStage::new(Arc::new(FnTransform::new("flaky", |frame: &Frame| -> depthrelay_core::Result<Frame> {
        if frame.pts() == 5 {
            return Err(Error::TransformFailed("model crashed".to_string()));
        }
        InvertTransform.transform(frame)
    })));

    let inputs: Vec<Frame> = (1..=10).map(tagged).collect();
    let mut outputs = Vec::new();
    for frame in &inputs {
        outputs.push(stage.apply(frame.clone()).await);
    }

    assert_eq!(outputs.len(), 10);
    for (input, output) in inputs.iter().zip(&outputs) {
        if input.pts() == 5 {
            assert_eq!(output, input, "frame #5 must be bit-identical to its input");
        } else {
            let expected: Vec<u8> = input.data().iter().map(|b| 255 - b).collect();
            assert_eq!(output.data().as_ref(), expected.as_slice());
        }
    }
    assert_eq!(stage.failure_count(), 1);
    assert_eq!(stage.stats().applied, 10);
}
