//! Per-thread ordered, paced delivery of outbound chat messages.
//!
//! Each destination thread gets one lane: an unbounded queue drained by a
//! single worker task. Messages for the same thread post in enqueue order
//! with a fixed delay after every successful post; different threads drain
//! independently. A failed post is reported through its handle and does not
//! stall the lane. Idle lanes retire themselves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::runner_sync_collaborators::{ChatPlatform, PlatformError, PostedMessage};
use crate::runner_sync_render::OutboundMessage;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("delivery lane for thread '{thread_id}' stopped before posting")]
    LaneClosed { thread_id: String },
}

/// Resolves once the enqueued message has been posted or has failed.
#[derive(Debug)]
pub struct DeliveryHandle {
    thread_id: String,
    receiver: oneshot::Receiver<Result<PostedMessage, DeliveryError>>,
}

impl DeliveryHandle {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub async fn wait(self) -> Result<PostedMessage, DeliveryError> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::LaneClosed {
                thread_id: self.thread_id,
            }),
        }
    }
}

struct DeliveryJob {
    message: OutboundMessage,
    reply: oneshot::Sender<Result<PostedMessage, DeliveryError>>,
}

struct DeliveryLane {
    lane_id: u64,
    sender: mpsc::UnboundedSender<DeliveryJob>,
}

struct DeliveryQueueInner {
    platform: Arc<dyn ChatPlatform>,
    delivery_delay: Duration,
    lane_idle: Duration,
    lanes: Mutex<HashMap<String, DeliveryLane>>,
    next_lane_id: Mutex<u64>,
}

#[derive(Clone)]
/// Cloneable handle to the shared per-thread delivery lanes.
pub struct DeliveryQueue {
    inner: Arc<DeliveryQueueInner>,
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("delivery_delay", &self.inner.delivery_delay)
            .field("lane_idle", &self.inner.lane_idle)
            .field("active_lanes", &self.active_lane_count())
            .finish()
    }
}

impl DeliveryQueue {
    pub fn new(platform: Arc<dyn ChatPlatform>, delivery_delay: Duration, lane_idle: Duration) -> Self {
        Self {
            inner: Arc::new(DeliveryQueueInner {
                platform,
                delivery_delay,
                lane_idle: lane_idle.max(Duration::from_millis(1)),
                lanes: Mutex::new(HashMap::new()),
                next_lane_id: Mutex::new(0),
            }),
        }
    }

    /// Enqueues a message for `thread_id`. Must be called inside a tokio
    /// runtime; a lane worker is spawned when the thread has none.
    pub fn send(&self, thread_id: &str, message: OutboundMessage) -> DeliveryHandle {
        let (reply, receiver) = oneshot::channel();
        let mut job = DeliveryJob { message, reply };
        let mut lanes = lock_or_recover(&self.inner.lanes);
        if let Some(lane) = lanes.get(thread_id) {
            match lane.sender.send(job) {
                Ok(()) => {
                    return DeliveryHandle {
                        thread_id: thread_id.to_string(),
                        receiver,
                    };
                }
                Err(mpsc::error::SendError(returned)) => job = returned,
            }
        }

        let lane_id = self.allocate_lane_id();
        let (sender, lane_receiver) = mpsc::unbounded_channel();
        if sender.send(job).is_err() {
            warn!(thread_id, "delivery lane closed before first message");
        }
        lanes.insert(thread_id.to_string(), DeliveryLane { lane_id, sender });
        drop(lanes);

        debug!(thread_id, lane_id, "delivery lane started");
        tokio::spawn(run_delivery_lane(
            Arc::clone(&self.inner),
            thread_id.to_string(),
            lane_id,
            lane_receiver,
        ));
        DeliveryHandle {
            thread_id: thread_id.to_string(),
            receiver,
        }
    }

    /// Enqueues a batch in order and returns one handle per message.
    pub fn send_all(
        &self,
        thread_id: &str,
        messages: impl IntoIterator<Item = OutboundMessage>,
    ) -> Vec<DeliveryHandle> {
        messages
            .into_iter()
            .map(|message| self.send(thread_id, message))
            .collect()
    }

    pub fn active_lane_count(&self) -> usize {
        lock_or_recover(&self.inner.lanes).len()
    }

    fn allocate_lane_id(&self) -> u64 {
        let mut next = lock_or_recover(&self.inner.next_lane_id);
        *next = next.saturating_add(1);
        *next
    }
}

async fn run_delivery_lane(
    inner: Arc<DeliveryQueueInner>,
    thread_id: String,
    lane_id: u64,
    mut receiver: mpsc::UnboundedReceiver<DeliveryJob>,
) {
    loop {
        let job = match tokio::time::timeout(inner.lane_idle, receiver.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(_) => match retire_lane_or_next(&inner, &thread_id, lane_id, &mut receiver) {
                Some(job) => job,
                None => {
                    debug!(thread_id = %thread_id, lane_id, "delivery lane retired");
                    return;
                }
            },
        };

        let result = inner.platform.send_message(&thread_id, &job.message).await;
        let posted = result.is_ok();
        if let Err(error) = &result {
            warn!(thread_id = %thread_id, error = %error, "failed to deliver synced message");
        }
        let _ = job.reply.send(result.map_err(DeliveryError::from));
        if posted && !inner.delivery_delay.is_zero() {
            tokio::time::sleep(inner.delivery_delay).await;
        }
    }
}

/// Removes the idle lane under the lanes lock unless a message arrived in
/// the meantime, in which case that message is returned.
fn retire_lane_or_next(
    inner: &DeliveryQueueInner,
    thread_id: &str,
    lane_id: u64,
    receiver: &mut mpsc::UnboundedReceiver<DeliveryJob>,
) -> Option<DeliveryJob> {
    let mut lanes = lock_or_recover(&inner.lanes);
    if let Ok(job) = receiver.try_recv() {
        return Some(job);
    }
    if lanes
        .get(thread_id)
        .is_some_and(|lane| lane.lane_id == lane_id)
    {
        lanes.remove(thread_id);
    }
    receiver.close();
    None
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
