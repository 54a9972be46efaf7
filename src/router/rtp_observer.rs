//! Passive cross-producer observers: entities subscribed to a subset of a
//! router's audio producers, fed every forwarded packet after consumer
//! fan-out.

use crate::channel::RequestError;
use crate::router::active_speaker_observer::ActiveSpeakerObserver;
use crate::router::audio_level_observer::AudioLevelObserver;
use crate::router::producer::{Producer, ProducerId};
use crate::rtp_packet::RtpPacket;
use crate::string_based_wrapper_type;

string_based_wrapper_type!(
    /// [`RtpObserver`] identifier.
    RtpObserverId
);

/// An RTP observer of one of the supported kinds.
#[derive(Clone)]
pub enum RtpObserver {
    AudioLevel(AudioLevelObserver),
    ActiveSpeaker(ActiveSpeakerObserver),
}

#[derive(Clone)]
pub(crate) enum WeakRtpObserver {
    AudioLevel(crate::router::audio_level_observer::WeakAudioLevelObserver),
    ActiveSpeaker(crate::router::active_speaker_observer::WeakActiveSpeakerObserver),
}

impl WeakRtpObserver {
    pub(crate) fn upgrade(&self) -> Option<RtpObserver> {
        match self {
            WeakRtpObserver::AudioLevel(observer) => {
                observer.upgrade().map(RtpObserver::AudioLevel)
            }
            WeakRtpObserver::ActiveSpeaker(observer) => {
                observer.upgrade().map(RtpObserver::ActiveSpeaker)
            }
        }
    }
}

impl RtpObserver {
    /// RtpObserver identifier.
    pub fn id(&self) -> &RtpObserverId {
        match self {
            RtpObserver::AudioLevel(observer) => observer.id(),
            RtpObserver::ActiveSpeaker(observer) => observer.id(),
        }
    }

    /// Whether the observer is paused.
    pub fn paused(&self) -> bool {
        match self {
            RtpObserver::AudioLevel(observer) => observer.paused(),
            RtpObserver::ActiveSpeaker(observer) => observer.paused(),
        }
    }

    /// Interval in milliseconds at which the embedder should call
    /// [`RtpObserver::on_interval_timer`].
    pub fn interval(&self) -> u16 {
        match self {
            RtpObserver::AudioLevel(observer) => observer.interval(),
            RtpObserver::ActiveSpeaker(observer) => observer.interval(),
        }
    }

    /// Observed producer ids, in insertion order.
    pub fn producer_ids(&self) -> Vec<ProducerId> {
        match self {
            RtpObserver::AudioLevel(observer) => observer.producer_ids(),
            RtpObserver::ActiveSpeaker(observer) => observer.producer_ids(),
        }
    }

    /// Periodic tick driven by the embedder's timer.
    pub fn on_interval_timer(&self) {
        match self {
            RtpObserver::AudioLevel(observer) => observer.on_interval_timer(),
            RtpObserver::ActiveSpeaker(observer) => observer.on_interval_timer(),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakRtpObserver {
        match self {
            RtpObserver::AudioLevel(observer) => {
                WeakRtpObserver::AudioLevel(observer.downgrade())
            }
            RtpObserver::ActiveSpeaker(observer) => {
                WeakRtpObserver::ActiveSpeaker(observer.downgrade())
            }
        }
    }

    pub(crate) fn pause(&self) {
        match self {
            RtpObserver::AudioLevel(observer) => observer.pause(),
            RtpObserver::ActiveSpeaker(observer) => observer.pause(),
        }
    }

    pub(crate) fn resume(&self) {
        match self {
            RtpObserver::AudioLevel(observer) => observer.resume(),
            RtpObserver::ActiveSpeaker(observer) => observer.resume(),
        }
    }

    pub(crate) fn add_producer(&self, producer: &Producer) -> Result<(), RequestError> {
        match self {
            RtpObserver::AudioLevel(observer) => observer.add_producer(producer),
            RtpObserver::ActiveSpeaker(observer) => observer.add_producer(producer),
        }
    }

    pub(crate) fn remove_producer(&self, producer_id: &ProducerId) -> Result<(), RequestError> {
        match self {
            RtpObserver::AudioLevel(observer) => observer.remove_producer(producer_id),
            RtpObserver::ActiveSpeaker(observer) => observer.remove_producer(producer_id),
        }
    }

    pub(crate) fn receive_rtp_packet(&self, producer_id: &ProducerId, packet: &RtpPacket) {
        match self {
            RtpObserver::AudioLevel(observer) => observer.receive_rtp_packet(producer_id, packet),
            RtpObserver::ActiveSpeaker(observer) => {
                observer.receive_rtp_packet(producer_id, packet)
            }
        }
    }

    /// An observed producer was paused; forget its accumulated state.
    pub(crate) fn producer_paused(&self, producer_id: &ProducerId) {
        match self {
            RtpObserver::AudioLevel(observer) => observer.forget_producer_state(producer_id),
            RtpObserver::ActiveSpeaker(observer) => observer.forget_producer_state(producer_id),
        }
    }

    /// An observed producer closed; detach it (indices are already updated by
    /// the router).
    pub(crate) fn producer_closed(&self, producer_id: &ProducerId) {
        match self {
            RtpObserver::AudioLevel(observer) => observer.detach_producer(producer_id),
            RtpObserver::ActiveSpeaker(observer) => observer.detach_producer(producer_id),
        }
    }

    pub(crate) fn mark_closed(&self) -> bool {
        match self {
            RtpObserver::AudioLevel(observer) => observer.mark_closed(),
            RtpObserver::ActiveSpeaker(observer) => observer.mark_closed(),
        }
    }
}
