//! Gossip-based sync engine.
//!
//! Periodically summarizes the local seen-set as a Golomb-coded set and
//! asks directly-connected peers for anything they hold that is absent
//! from the summary. On the receiving side, walks the recent-packet cache
//! and replays the missing packets over the requesting link only.

use tracing::debug;

use super::cache::CachedPacket;
use super::gcs::{GcsFilter, GcsParams};
use super::seen::SeenSet;
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::protocol::tlv::RequestSyncPayload;
use crate::protocol::PacketId;

/// Stateless planner for sync requests and replays
pub struct SyncEngine {
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Summarize the seen-set for a REQUEST_SYNC. Returns None when there
    /// is nothing to summarize yet.
    pub fn build_request(&self, seen: &SeenSet) -> Option<RequestSyncPayload> {
        if seen.is_empty() {
            return None;
        }

        let params = GcsParams::derive(self.config.max_filter_bytes, self.config.target_fpr);
        let sample = seen.recent(params.n_max);
        let filter = match GcsFilter::build(&sample, params.p) {
            Ok(filter) => filter,
            Err(e) => {
                debug!("Skipping sync round: {}", e);
                return None;
            }
        };

        Some(RequestSyncPayload {
            p: filter.p(),
            m: filter.m(),
            filter_data: filter.data().to_vec(),
            type_filter: None,
            since_timestamp: None,
            fragment_filter: None,
        })
    }

    /// Validate a peer's sync request and pick the cached packets to
    /// replay: everything the filter does not report as a member, within
    /// the per-round packet and byte budgets.
    pub fn plan_replay(
        &self,
        request: &RequestSyncPayload,
        cached: &[(PacketId, CachedPacket)],
    ) -> Result<Vec<Vec<u8>>> {
        if request.filter_data.len() > self.config.max_accept_filter_bytes {
            return Err(Error::InvalidInput(format!(
                "Sync filter of {} bytes exceeds acceptance limit {}",
                request.filter_data.len(),
                self.config.max_accept_filter_bytes
            )));
        }
        if request.p < 1 {
            return Err(Error::InvalidInput("Sync filter p must be at least 1".into()));
        }
        if request.m == 0 {
            return Err(Error::InvalidInput("Sync filter m must be positive".into()));
        }

        let filter = GcsFilter::from_parts(request.p, request.m, &request.filter_data)?;

        let mut replay = Vec::new();
        let mut bytes_budget = self.config.max_bytes_per_round;

        for (id, packet) in cached {
            if replay.len() >= self.config.max_packets_per_round {
                break;
            }
            if let Some(types) = &request.type_filter {
                if !types.contains(&packet.packet_type) {
                    continue;
                }
            }
            if let Some(since) = request.since_timestamp {
                if packet.timestamp < since {
                    continue;
                }
            }
            if let Some(wanted) = &request.fragment_filter {
                if packet.fragment_id.as_ref() != Some(wanted) {
                    continue;
                }
            }
            if filter.contains(id) {
                continue; // peer (probably) has it; false positives are accepted
            }
            if packet.bytes.len() > bytes_budget {
                break;
            }
            bytes_budget -= packet.bytes.len();
            replay.push(packet.bytes.clone());
        }

        Ok(replay)
    }
}
