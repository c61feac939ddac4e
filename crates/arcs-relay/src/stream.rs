//! Stream router: device-to-controllers video fan-out.
//!
//! Each session owns one endpoint; each controller-leg on the endpoint owns
//! an independent bounded FIFO. Enqueueing into a full FIFO drops the
//! oldest entry first, so a slow controller falls behind on its own and
//! never stalls the device-leg or its siblings.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use arcs_core::ConnId;

/// Default FIFO depth; roughly one second of video at 30 fps.
pub const DEFAULT_MAX_QUEUE: usize = 30;

/// Bounded drop-oldest frame FIFO with an async consumer side.
pub struct FrameQueue {
    inner: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    cap: usize,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(cap)),
            notify: Notify::new(),
            cap,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a frame. Returns `true` when the oldest entry was dropped
    /// to make room.
    pub fn push(&self, frame: Bytes) -> bool {
        let dropped = {
            let mut queue = self.inner.lock();
            let dropped = if queue.len() >= self.cap {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            } else {
                false
            };
            queue.push_back(frame);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    /// Wait for the next frame. Frames come out in the order they went in,
    /// minus any dropped by the bound.
    pub async fn pop(&self) -> Bytes {
        loop {
            let notified = self.notify.notified();
            if let Some(frame) = self.inner.lock().pop_front() {
                return frame;
            }
            notified.await;
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<Bytes> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Cumulative counters for one session's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub frames_in: u64,
    pub bytes_in: u64,
    pub frames_dropped: u64,
    pub avg_frame_size: u64,
}

/// What one `route_frame` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutReport {
    /// Controller queues the frame was enqueued into.
    pub delivered: usize,
    /// Oldest entries evicted by full queues during this call.
    pub dropped: usize,
}

struct StreamEndpoint {
    device_id: String,
    /// Ordered list of controller-legs and their queues.
    controllers: Mutex<Vec<(ConnId, Arc<FrameQueue>)>>,
    frames_in: AtomicU64,
    bytes_in: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Routes binary frames from a session's device-leg to its controllers.
pub struct StreamRouter {
    endpoints: DashMap<String, Arc<StreamEndpoint>>,
    queue_cap: usize,
}

impl StreamRouter {
    pub fn new(queue_cap: usize) -> Self {
        Self {
            endpoints: DashMap::new(),
            queue_cap,
        }
    }

    /// Create the session's endpoint. Idempotent for the same session-id.
    pub fn register_device(&self, session_id: &str, device_id: &str) {
        self.endpoints
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(StreamEndpoint {
                    device_id: device_id.to_string(),
                    controllers: Mutex::new(Vec::new()),
                    frames_in: AtomicU64::new(0),
                    bytes_in: AtomicU64::new(0),
                    frames_dropped: AtomicU64::new(0),
                })
            });
    }

    /// Tear the endpoint down with the session.
    pub fn unregister_device(&self, session_id: &str) -> bool {
        self.endpoints.remove(session_id).is_some()
    }

    /// Attach a controller-leg and hand back its queue for draining.
    pub fn register_controller(&self, session_id: &str, conn: &str) -> Option<Arc<FrameQueue>> {
        let endpoint = self.endpoints.get(session_id)?;
        let queue = Arc::new(FrameQueue::new(self.queue_cap));
        endpoint
            .controllers
            .lock()
            .push((conn.to_string(), queue.clone()));
        Some(queue)
    }

    pub fn unregister_controller(&self, session_id: &str, conn: &str) {
        if let Some(endpoint) = self.endpoints.get(session_id) {
            endpoint.controllers.lock().retain(|(id, _)| id != conn);
        }
    }

    /// Fan one frame out to every registered controller.
    ///
    /// The bytes are reference-counted; each queue holds a handle, not a
    /// copy. Returns `None` for an unknown session.
    pub fn route_frame(&self, session_id: &str, frame: Bytes) -> Option<FanoutReport> {
        let endpoint = self.endpoints.get(session_id)?;
        // A fragment group counts once, when its first packet passes.
        if arcs_proto::starts_new_frame(&frame) {
            endpoint.frames_in.fetch_add(1, Ordering::Relaxed);
        }
        endpoint
            .bytes_in
            .fetch_add(frame.len() as u64, Ordering::Relaxed);

        let mut dropped = 0;
        let controllers = endpoint.controllers.lock();
        for (conn, queue) in controllers.iter() {
            if queue.push(frame.clone()) {
                endpoint.frames_dropped.fetch_add(1, Ordering::Relaxed);
                dropped += 1;
                debug!(session = session_id, controller = %conn, "frame dropped (queue full)");
            }
        }
        Some(FanoutReport {
            delivered: controllers.len(),
            dropped,
        })
    }

    /// Non-blocking fetch of the next frame queued for a controller.
    pub fn get_frame(&self, session_id: &str, conn: &str) -> Option<Bytes> {
        let endpoint = self.endpoints.get(session_id)?;
        let controllers = endpoint.controllers.lock();
        controllers
            .iter()
            .find(|(id, _)| id == conn)
            .and_then(|(_, queue)| queue.try_pop())
    }

    pub fn stats(&self, session_id: &str) -> Option<StreamStats> {
        let endpoint = self.endpoints.get(session_id)?;
        let frames_in = endpoint.frames_in.load(Ordering::Relaxed);
        let bytes_in = endpoint.bytes_in.load(Ordering::Relaxed);
        Some(StreamStats {
            frames_in,
            bytes_in,
            frames_dropped: endpoint.frames_dropped.load(Ordering::Relaxed),
            avg_frame_size: if frames_in == 0 { 0 } else { bytes_in / frames_in },
        })
    }

    pub fn device_id(&self, session_id: &str) -> Option<String> {
        self.endpoints
            .get(session_id)
            .map(|e| e.device_id.clone())
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }
}

impl Default for StreamRouter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8, len: usize) -> Bytes {
        Bytes::from(vec![tag; len])
    }

    #[test]
    fn test_fan_out_reaches_every_controller() {
        let router = StreamRouter::new(30);
        router.register_device("S", "d1");
        let qa = router.register_controller("S", "a").unwrap();
        let qb = router.register_controller("S", "b").unwrap();

        let report = router.route_frame("S", frame(1, 100)).unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.dropped, 0);
        assert_eq!(qa.len(), 1);
        assert_eq!(qb.len(), 1);

        let stats = router.stats("S").unwrap();
        assert_eq!(stats.frames_in, 1);
        assert_eq!(stats.bytes_in, 100);
        assert_eq!(stats.frames_dropped, 0);
        assert_eq!(stats.avg_frame_size, 100);
    }

    #[test]
    fn test_drop_oldest_on_overflow() {
        let queue = FrameQueue::new(3);
        assert!(!queue.push(frame(0, 1)));
        assert!(!queue.push(frame(1, 1)));
        assert!(!queue.push(frame(2, 1)));

        // The 2nd-from-head becomes the head after the push.
        assert!(queue.push(frame(3, 1)));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop().unwrap()[0], 1);
        assert_eq!(queue.try_pop().unwrap()[0], 2);
        assert_eq!(queue.try_pop().unwrap()[0], 3);
    }

    #[test]
    fn test_slow_controller_does_not_affect_fast_one() {
        let router = StreamRouter::new(30);
        router.register_device("S", "d1");
        let fast = router.register_controller("S", "a").unwrap();
        let slow = router.register_controller("S", "b").unwrap();

        // Controller A drains as frames arrive; B never drains.
        let mut fast_received = 0;
        for i in 0..40u8 {
            router.route_frame("S", frame(i, 10)).unwrap();
            while fast.try_pop().is_some() {
                fast_received += 1;
            }
        }

        assert_eq!(fast_received, 40);
        assert_eq!(slow.len(), 30);
        assert_eq!(slow.dropped(), 10);
        // The 30 most recent frames survive on the slow queue.
        assert_eq!(slow.try_pop().unwrap()[0], 10);

        let stats = router.stats("S").unwrap();
        assert_eq!(stats.frames_in, 40);
        assert_eq!(stats.frames_dropped, 10);
    }

    #[test]
    fn test_frames_keep_order_per_controller() {
        let router = StreamRouter::new(30);
        router.register_device("S", "d1");
        let queue = router.register_controller("S", "a").unwrap();

        for i in 0..10u8 {
            router.route_frame("S", frame(i, 4)).unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(queue.try_pop().unwrap()[0], i);
        }
    }

    #[test]
    fn test_fragment_group_counts_as_one_frame() {
        let router = StreamRouter::new(30);
        router.register_device("S", "d1");
        let qa = router.register_controller("S", "a").unwrap();
        let qb = router.register_controller("S", "b").unwrap();

        // 600 000 bytes at 65536 per packet: ten fragments, one frame.
        let payload = vec![0x42u8; 600_000];
        let packets = arcs_proto::encode_frame(1, 1, true, false, &payload, 65_536).unwrap();
        assert_eq!(packets.len(), 10);
        for packet in packets {
            router.route_frame("S", packet).unwrap();
        }

        let stats = router.stats("S").unwrap();
        assert_eq!(stats.frames_in, 1);
        assert_eq!(stats.frames_dropped, 0);
        assert_eq!(qa.len(), 10);
        assert_eq!(qb.len(), 10);

        // Index order survives the queue.
        for i in 0..10u16 {
            let raw = qa.try_pop().unwrap();
            let packet = arcs_proto::parse_packet(&raw).unwrap();
            assert_eq!(packet.fragment.unwrap().0, i);
        }
    }

    #[test]
    fn test_unknown_session_and_teardown() {
        let router = StreamRouter::new(30);
        assert!(router.route_frame("NOPE", frame(0, 1)).is_none());
        assert!(router.stats("NOPE").is_none());

        router.register_device("S", "d1");
        router.register_controller("S", "a");
        assert!(router.unregister_device("S"));
        assert!(router.route_frame("S", frame(0, 1)).is_none());
        assert!(!router.unregister_device("S"));
    }

    #[test]
    fn test_unregister_controller_stops_fanout_to_it() {
        let router = StreamRouter::new(30);
        router.register_device("S", "d1");
        let qa = router.register_controller("S", "a").unwrap();
        router.register_controller("S", "b").unwrap();

        router.unregister_controller("S", "b");
        let report = router.route_frame("S", frame(1, 1)).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(qa.len(), 1);
    }

    #[test]
    fn prop_bounded_queue_keeps_most_recent() {
        use proptest::prelude::*;

        proptest!(|(cap in 1usize..64, pushes in 1usize..200)| {
            let queue = FrameQueue::new(cap);
            for i in 0..pushes {
                queue.push(Bytes::from(vec![(i % 256) as u8]));
            }
            prop_assert_eq!(queue.len(), pushes.min(cap));
            prop_assert_eq!(queue.dropped() as usize, pushes.saturating_sub(cap));

            // Survivors are exactly the most recent frames, in order.
            for i in pushes.saturating_sub(cap)..pushes {
                let frame = queue.try_pop().unwrap();
                prop_assert_eq!(frame[0], (i % 256) as u8);
            }
        });
    }

    #[tokio::test]
    async fn test_async_pop_wakes_on_push() {
        let queue = Arc::new(FrameQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        // Give the consumer a moment to park.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.push(frame(7, 3));

        let got = consumer.await.unwrap();
        assert_eq!(got[0], 7);
    }
}
