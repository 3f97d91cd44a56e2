//! Most-recent-wins view of vehicle telemetry.

use crate::health::{LinkHealthSample, PeriodEstimate};
use crate::types::{Heartbeat, NetStatus, TelemetryMessage, TelemetryRecord, TelemetryTag};
use std::collections::BTreeMap;
use tokio::time::Instant;

/// Latest record per tag plus arrival times of the link-relevant signals.
#[derive(Debug, Clone, Default)]
pub struct TelemetrySnapshot {
    latest: BTreeMap<TelemetryTag, TelemetryRecord>,
    heartbeat: PeriodEstimate,
    sensors: PeriodEstimate,
    last_network: Option<Instant>,
}

impl TelemetrySnapshot {
    pub fn apply(&mut self, record: TelemetryRecord, at: Instant) {
        match record.tag {
            TelemetryTag::Heartbeat => self.heartbeat.observe(at),
            TelemetryTag::Network => self.last_network = Some(at),
            _ => self.sensors.observe(at),
        }
        self.latest.insert(record.tag.clone(), record);
    }

    pub fn get(&self, tag: &TelemetryTag) -> Option<&TelemetryRecord> {
        self.latest.get(tag)
    }

    pub fn records(&self) -> impl Iterator<Item = &TelemetryRecord> {
        self.latest.values()
    }

    pub fn heartbeat(&self) -> Option<&Heartbeat> {
        self.get(&TelemetryTag::Heartbeat).and_then(TelemetryRecord::heartbeat)
    }

    pub fn network(&self) -> Option<&NetStatus> {
        match &self.get(&TelemetryTag::Network)?.message {
            TelemetryMessage::Network(net) => Some(net),
            _ => None,
        }
    }

    /// Heartbeat timing with its smoothed period.
    pub fn heartbeat_sample(&self) -> LinkHealthSample {
        LinkHealthSample { last_activity: self.heartbeat.last(), nominal_period: self.heartbeat.period() }
    }

    /// Timing of all non-heartbeat, non-network traffic.
    pub fn sensor_sample(&self) -> LinkHealthSample {
        LinkHealthSample { last_activity: self.sensors.last(), nominal_period: self.sensors.period() }
    }

    pub fn last_network(&self) -> Option<Instant> {
        self.last_network
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn keeps_latest_per_tag_and_times_signals() {
        let mut snapshot = TelemetrySnapshot::default();
        let start = Instant::now();
        let parse = |raw: &str| TelemetryRecord::parse(raw).unwrap();

        snapshot.apply(parse(r#"{"type":"heartbeat","armed":false,"pilot_seq":1}"#), start);
        snapshot.apply(parse(r#"{"type":"power","voltage_v":16.0}"#), start);
        snapshot.apply(parse(r#"{"type":"heartbeat","armed":true,"pilot_seq":2}"#), start + Duration::from_millis(500));

        assert_eq!(snapshot.heartbeat().unwrap().pilot_seq, Some(2));
        assert!(snapshot.heartbeat().unwrap().armed);
        assert_eq!(snapshot.records().count(), 2);
        assert_eq!(snapshot.heartbeat_sample().last_activity, Some(start + Duration::from_millis(500)));
        assert_eq!(snapshot.sensor_sample().last_activity, Some(start));
        assert!(snapshot.network().is_none());
        assert!(snapshot.last_network().is_none());
    }
}
