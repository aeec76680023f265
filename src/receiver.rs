#[cfg(feature = "defmt")]
use defmt::{debug, warn};

use crate::{
    an400::DecoderVariant,
    envelope::{EnvelopeError, FramedTelemetry},
    ndjson::{snapshot_record, Line, NdjsonError},
    packet::{PacketLengthError, TelemetryPacket},
    sequence::{SequenceEvent, SequenceTracker},
    snapshot::Snapshot,
};

/// Datagram format the transmitting node was configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RadioFormat {
    /// 22-byte packets with a 16-bit counter, on a dedicated channel
    #[default]
    Binary,
    /// 38-byte framed datagrams with an 8-bit sequence
    Framed,
}

/// Keys every re-encoded line starts with
const ENVELOPE_KEYS: [&str; 4] = ["ts_ms", "pkt", "src", "node_id"];

impl RadioFormat {
    pub const fn counter_bits(&self) -> u32 {
        match self {
            Self::Binary => 16,
            Self::Framed => 8,
        }
    }

    /// Telemetry keys a datagram of this format actually carries.
    pub const fn carried_keys(&self) -> &'static [&'static str] {
        match self {
            Self::Binary => &[
                "rpm", "tps_pct", "map_kpa", "lambda", "batt_v", "coolant_c", "oil_psi",
                "ws_fl_hz", "ws_fr_hz", "ws_bl_hz", "ws_br_hz",
            ],
            Self::Framed => &[
                "rpm", "tps_pct", "fot_ms", "ign_deg", "baro_kpa", "map_kpa", "lambda", "batt_v",
                "coolant_c", "air_c", "oil_psi", "ws_fl_hz", "ws_fr_hz", "ws_bl_hz", "ws_br_hz",
            ],
        }
    }
}

/// Why a datagram was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Rejected {
    #[error(transparent)]
    Packet(#[from] PacketLengthError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReceiverStats {
    pub accepted: u32,
    pub rejected: u32,
    pub lost: u64,
    pub duplicates: u32,
    pub stale: u32,
}

/// One accepted datagram.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Received {
    pub counter: u32,
    /// Sender timestamp for framed datagrams, local receive time otherwise
    pub timestamp_ms: u32,
    pub event: SequenceEvent,
    /// Only the fields the datagram carries are set
    pub snapshot: Snapshot,
}

/// Receiving end of the radio link.
#[derive(Debug, Clone, Copy)]
pub struct RadioReceiver {
    format: RadioFormat,
    node_id: u8,
    tracker: SequenceTracker,
    stats: ReceiverStats,
}

impl RadioReceiver {
    pub const fn new(format: RadioFormat, node_id: u8) -> Self {
        Self {
            format,
            node_id,
            tracker: SequenceTracker::new(format.counter_bits()),
            stats: ReceiverStats {
                accepted: 0,
                rejected: 0,
                lost: 0,
                duplicates: 0,
                stale: 0,
            },
        }
    }

    pub fn format(&self) -> RadioFormat {
        self.format
    }

    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    /// Decodes one datagram. Anything that does not parse in the configured
    /// format is counted and dropped; the receiver keeps running.
    pub fn receive(&mut self, datagram: &[u8], now_ms: u32) -> Option<Received> {
        let (counter, timestamp_ms, snapshot) = match self.parse(datagram, now_ms) {
            Ok(parsed) => parsed,
            Err(_e) => {
                #[cfg(feature = "defmt")]
                warn!("Dropped datagram: {}", _e);

                self.stats.rejected = self.stats.rejected.wrapping_add(1);
                return None;
            }
        };

        let event = self.tracker.observe(counter);
        match event {
            SequenceEvent::Gap { lost } => {
                // Also reported when a run of far-ahead counters re-anchors
                // the tracker after a long outage
                #[cfg(feature = "defmt")]
                warn!("Sequence gap before {}: {} lost", counter, lost);

                self.stats.lost += u64::from(lost);
            }
            SequenceEvent::Duplicate => self.stats.duplicates = self.stats.duplicates.wrapping_add(1),
            SequenceEvent::Stale => {
                #[cfg(feature = "defmt")]
                debug!("Late datagram {}", counter);

                self.stats.stale = self.stats.stale.wrapping_add(1);
            }
            SequenceEvent::First | SequenceEvent::Next => {}
        }

        self.stats.accepted = self.stats.accepted.wrapping_add(1);

        Some(Received {
            counter,
            timestamp_ms,
            event,
            snapshot,
        })
    }

    fn parse(&self, datagram: &[u8], now_ms: u32) -> Result<(u32, u32, Snapshot), Rejected> {
        Ok(match self.format {
            RadioFormat::Binary => {
                let packet = TelemetryPacket::from_bytes(datagram)?;
                (u32::from(packet.counter), now_ms, packet.to_snapshot())
            }
            RadioFormat::Framed => {
                let framed = FramedTelemetry::from_bytes(datagram)?;
                (u32::from(framed.sequence), framed.timestamp_ms, framed.to_snapshot())
            }
        })
    }

    /// Re-encodes an accepted datagram for downstream ingestion. The
    /// datagram's own counter becomes `pkt`, and only the keys the format
    /// carries are written so a merge never overwrites real values with
    /// zeros.
    pub fn to_line(&self, received: &Received) -> Result<Line, NdjsonError> {
        let mut record = snapshot_record(
            received.timestamp_ms,
            received.counter,
            self.node_id,
            DecoderVariant::Basic,
            &received.snapshot,
        )?;

        let carried = self.format.carried_keys();
        record.retain(|key| ENVELOPE_KEYS.contains(&key) || carried.contains(&key));
        record.render()
    }
}
