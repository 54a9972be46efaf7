//! Audio level observer: periodically reports the loudest observed audio
//! producers, or silence.

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

/// Creation data of an audio level observer.
#[derive(Debug, Copy, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioLevelObserverOptions {
    /// Maximum number of entries in the `volumes` event. Default 1.
    #[serde(default = "default_max_entries")]
    pub max_entries: u16,
    /// Minimum average volume (in dBvo from -127 to 0) for an entry to be
    /// reported. Default -80.
    #[serde(default = "default_threshold")]
    pub threshold: i8,
    /// Interval in ms between reports. Default 1000.
    #[serde(default = "default_interval")]
    pub interval: u16,
}

fn default_max_entries() -> u16 {
    1
}

fn default_threshold() -> i8 {
    -80
}

fn default_interval() -> u16 {
    1000
}

impl Default for AudioLevelObserverOptions {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            threshold: default_threshold(),
            interval: default_interval(),
        }
    }
}

/// One entry of the `volumes` report.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioLevelObserverVolume {
    pub producer_id: ProducerId,
    /// Average volume in dBvo (from -127 to 0) over the last interval.
    pub volume: i8,
}

#[derive(Debug, Default)]
struct AudioLevels {
    /// Per producer: sum of absolute dBov values and sample count.
    totals: HashedMap<ProducerId, (u64, u32)>,
    silence_reported: bool,
}

#[derive(Default)]
struct Handlers {
    volumes: Bag<Arc<dyn Fn(&[AudioLevelObserverVolume]) + Send + Sync>>,
    silence: Bag<Arc<dyn Fn() + Send + Sync>>,
}

pub(crate) struct Inner {
    id: RtpObserverId,
    max_entries: u16,
    threshold: i8,
    interval: u16,
    paused: AtomicBool,
    producer_ids: Mutex<Vec<ProducerId>>,
    levels: Mutex<AudioLevels>,
    context: Arc<WorkerContext>,
    handlers: Handlers,
    closed: AtomicBool,
}

/// Measures the audio volume of its observed producers.
#[derive(Clone)]
pub struct AudioLevelObserver {
    inner: Arc<Inner>,
}

#[derive(Clone)]
pub(crate) struct WeakAudioLevelObserver {
    inner: Weak<Inner>,
}

impl WeakAudioLevelObserver {
    pub(crate) fn upgrade(&self) -> Option<AudioLevelObserver> {
        Some(AudioLevelObserver {
            inner: self.inner.upgrade()?,
        })
    }
}

impl AudioLevelObserver {
    pub(crate) fn new(
        id: RtpObserverId,
        options: AudioLevelObserverOptions,
        context: Arc<WorkerContext>,
    ) -> Result<Self, RequestError> {
        debug!("new()");

        if options.max_entries == 0 {
            return Err(RequestError::TypeError(
                "maxEntries must be 1 or higher".into(),
            ));
        }
        if options.threshold < -127 || options.threshold > 0 {
            return Err(RequestError::TypeError(
                "threshold must be in the range [-127, 0]".into(),
            ));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                max_entries: options.max_entries,
                threshold: options.threshold,
                interval: options.interval,
                paused: AtomicBool::new(false),
                producer_ids: Mutex::default(),
                levels: Mutex::default(),
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

    pub(crate) fn downgrade(&self) -> WeakAudioLevelObserver {
        WeakAudioLevelObserver {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn pause(&self) {
        debug!("pause()");

        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            *self.inner.levels.lock() = AudioLevels::default();
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

        self.forget_producer_state(producer_id);

        Ok(())
    }

    pub(crate) fn detach_producer(&self, producer_id: &ProducerId) {
        self.inner
            .producer_ids
            .lock()
            .retain(|id| id != producer_id);
        self.forget_producer_state(producer_id);
    }

    pub(crate) fn forget_producer_state(&self, producer_id: &ProducerId) {
        self.inner.levels.lock().totals.remove(producer_id);
    }

    pub(crate) fn receive_rtp_packet(&self, producer_id: &ProducerId, packet: &RtpPacket) {
        if self.paused() || self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let dbov = match packet.audio_level {
            Some(dbov) => dbov,
            None => return,
        };

        let mut levels = self.inner.levels.lock();
        let entry = levels.totals.entry(producer_id.clone()).or_insert((0, 0));
        entry.0 += u64::from(dbov.unsigned_abs());
        entry.1 += 1;
    }

    /// Report the loudest producers over the last interval, or a single
    /// silence edge.
    pub(crate) fn on_interval_timer(&self) {
        if self.paused() || self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let (mut volumes, was_silent) = {
            let mut levels = self.inner.levels.lock();
            let volumes = levels
                .totals
                .drain()
                .filter_map(|(producer_id, (sum, count))| {
                    if count == 0 {
                        return None;
                    }
                    let average = -((sum / u64::from(count)).min(127) as i8);
                    if average >= self.inner.threshold {
                        Some(AudioLevelObserverVolume {
                            producer_id,
                            volume: average,
                        })
                    } else {
                        None
                    }
                })
                .collect::<Vec<_>>();
            let was_silent = levels.silence_reported;
            levels.silence_reported = volumes.is_empty();

            (volumes, was_silent)
        };

        if volumes.is_empty() {
            if !was_silent {
                self.inner.handlers.silence.call_simple();
                self.notify("silence", serde_json::Value::Null);
            }
            return;
        }

        // Loudest first (dBov values are negative).
        volumes.sort_by(|a, b| b.volume.cmp(&a.volume));
        volumes.truncate(usize::from(self.inner.max_entries));

        self.inner.handlers.volumes.call(|callback| {
            callback(&volumes);
        });
        self.notify(
            "volumes",
            serde_json::to_value(&volumes).unwrap_or_default(),
        );
    }

    pub(crate) fn mark_closed(&self) -> bool {
        !self.inner.closed.swap(true, Ordering::SeqCst)
    }

    /// Callback is called with the observed volumes on every report.
    pub fn on_volumes<F: Fn(&[AudioLevelObserverVolume]) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.volumes.add(Arc::new(callback))
    }

    /// Callback is called once when all observed producers go silent.
    pub fn on_silence<F: Fn() + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.silence.add(Arc::new(callback))
    }

    fn notify(&self, event: &'static str, data: serde_json::Value) {
        self.inner
            .context
            .control
            .notifications
            .notify(self.inner.id.as_str(), event, data);
    }
}
