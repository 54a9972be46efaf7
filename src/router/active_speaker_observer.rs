//! Active speaker observer: tracks the dominant audio producer and reports
//! when it changes.

use crate::channel::RequestError;
use crate::router::producer::{Producer, ProducerId};
use crate::router::rtp_observer::RtpObserverId;
use crate::rtp_packet::RtpPacket;
use crate::rtp_parameters::MediaKind;
use crate::worker::WorkerContext;
use event_listener_primitives::{Bag, HandlerId};
use hash_hasher::HashedMap;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Creation data of an active speaker observer.
#[derive(Debug, Copy, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSpeakerObserverOptions {
    /// Interval in ms between dominant speaker evaluations. Default 300.
    #[serde(default = "default_interval")]
    pub interval: u16,
}

fn default_interval() -> u16 {
    300
}

impl Default for ActiveSpeakerObserverOptions {
    fn default() -> Self {
        Self {
            interval: default_interval(),
        }
    }
}

/// The `dominantspeaker` report.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSpeakerObserverDominantSpeaker {
    pub producer_id: ProducerId,
}

#[derive(Debug, Default)]
struct Activity {
    /// Per producer: sum of absolute dBov values and sample count since the
    /// last evaluation.
    totals: HashedMap<ProducerId, (u64, u32)>,
    dominant_id: Option<ProducerId>,
}

#[derive(Default)]
struct Handlers {
    dominant_speaker: Bag<Arc<dyn Fn(&ActiveSpeakerObserverDominantSpeaker) + Send + Sync>>,
}

pub(crate) struct Inner {
    id: RtpObserverId,
    interval: u16,
    paused: AtomicBool,
    producer_ids: Mutex<Vec<ProducerId>>,
    activity: Mutex<Activity>,
    context: Arc<WorkerContext>,
    handlers: Handlers,
    closed: AtomicBool,
}

/// Detects the dominant speaker among its observed producers.
#[derive(Clone)]
pub struct ActiveSpeakerObserver {
    inner: Arc<Inner>,
}

#[derive(Clone)]
pub(crate) struct WeakActiveSpeakerObserver {
    inner: Weak<Inner>,
}

impl WeakActiveSpeakerObserver {
    pub(crate) fn upgrade(&self) -> Option<ActiveSpeakerObserver> {
        Some(ActiveSpeakerObserver {
            inner: self.inner.upgrade()?,
        })
    }
}

impl ActiveSpeakerObserver {
    pub(crate) fn new(
        id: RtpObserverId,
        options: ActiveSpeakerObserverOptions,
        context: Arc<WorkerContext>,
    ) -> Result<Self, RequestError> {
        debug!("new()");

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                interval: options.interval,
                paused: AtomicBool::new(false),
                producer_ids: Mutex::default(),
                activity: Mutex::default(),
                context,
                handlers: Handlers::default(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> &RtpObserverId {
        &self.inner.id
    }

    pub fn paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn interval(&self) -> u16 {
        self.inner.interval
    }

    pub fn producer_ids(&self) -> Vec<ProducerId> {
        self.inner.producer_ids.lock().clone()
    }

    /// The currently dominant producer, if any.
    pub fn dominant_producer_id(&self) -> Option<ProducerId> {
        self.inner.activity.lock().dominant_id.clone()
    }

    pub(crate) fn downgrade(&self) -> WeakActiveSpeakerObserver {
        WeakActiveSpeakerObserver {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn pause(&self) {
        debug!("pause()");

        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            *self.inner.activity.lock() = Activity::default();
        }
    }

    pub(crate) fn resume(&self) {
        debug!("resume()");

        self.inner.paused.swap(false, Ordering::SeqCst);
    }

    pub(crate) fn add_producer(&self, producer: &Producer) -> Result<(), RequestError> {
        if producer.kind() != MediaKind::Audio {
            return Err(RequestError::TypeError(
                "only audio producers can be observed".into(),
            ));
        }

        let mut producer_ids = self.inner.producer_ids.lock();
        if producer_ids.contains(producer.id()) {
            return Err(RequestError::IllegalState(
                "producer is already being observed".into(),
            ));
        }
        producer_ids.push(producer.id().clone());

        Ok(())
    }

    pub(crate) fn remove_producer(&self, producer_id: &ProducerId) -> Result<(), RequestError> {
        let mut producer_ids = self.inner.producer_ids.lock();
        let position = producer_ids
            .iter()
            .position(|id| id == producer_id)
            .ok_or_else(|| RequestError::NotFound("producer is not being observed".into()))?;
        producer_ids.remove(position);
        drop(producer_ids);

        self.detach_state(producer_id);

        Ok(())
    }

    pub(crate) fn detach_producer(&self, producer_id: &ProducerId) {
        self.inner
            .producer_ids
            .lock()
            .retain(|id| id != producer_id);
        self.detach_state(producer_id);
    }

    pub(crate) fn forget_producer_state(&self, producer_id: &ProducerId) {
        self.inner.activity.lock().totals.remove(producer_id);
    }

    pub(crate) fn receive_rtp_packet(&self, producer_id: &ProducerId, packet: &RtpPacket) {
        if self.paused() || self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let dbov = match packet.audio_level {
            Some(dbov) => dbov,
            None => return,
        };

        let mut activity = self.inner.activity.lock();
        let entry = activity.totals.entry(producer_id.clone()).or_insert((0, 0));
        entry.0 += u64::from(dbov.unsigned_abs());
        entry.1 += 1;
    }

    /// Evaluate the dominant speaker and report a change.
    pub(crate) fn on_interval_timer(&self) {
        if self.paused() || self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let new_dominant = {
            let mut activity = self.inner.activity.lock();

            // Loudest average wins; dBov values are negative so a smaller
            // absolute sum per sample means louder.
            let loudest = activity
                .totals
                .drain()
                .filter(|(_, (_, count))| *count > 0)
                .map(|(producer_id, (sum, count))| {
                    let average = -((sum / u64::from(count)).min(127) as i8);
                    (producer_id, average)
                })
                .filter(|(_, average)| *average > -127)
                .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)));

            match loudest {
                Some((producer_id, _)) => {
                    if activity.dominant_id.as_ref() == Some(&producer_id) {
                        None
                    } else {
                        activity.dominant_id = Some(producer_id.clone());
                        Some(producer_id)
                    }
                }
                None => None,
            }
        };

        if let Some(producer_id) = new_dominant {
            let dominant_speaker = ActiveSpeakerObserverDominantSpeaker { producer_id };
            self.inner.handlers.dominant_speaker.call(|callback| {
                callback(&dominant_speaker);
            });
            self.notify(
                "dominantspeaker",
                serde_json::to_value(&dominant_speaker).unwrap_or_default(),
            );
        }
    }

    pub(crate) fn mark_closed(&self) -> bool {
        !self.inner.closed.swap(true, Ordering::SeqCst)
    }

    /// Callback is called when the dominant producer changes.
    pub fn on_dominant_speaker<
        F: Fn(&ActiveSpeakerObserverDominantSpeaker) + Send + Sync + 'static,
    >(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.dominant_speaker.add(Arc::new(callback))
    }

    fn notify(&self, event: &'static str, data: serde_json::Value) {
        self.inner
            .context
            .control
            .notifications
            .notify(self.inner.id.as_str(), event, data);
    }
}

impl ActiveSpeakerObserver {
    fn detach_state(&self, producer_id: &ProducerId) {
        let mut activity = self.inner.activity.lock();
        activity.totals.remove(producer_id);
        if activity.dominant_id.as_ref() == Some(producer_id) {
            activity.dominant_id = None;
        }
    }
}
