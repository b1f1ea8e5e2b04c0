//! Raw and Canonical Events
//!
//! `RawEvent` is what a source adapter hands over: a timestamp, a native
//! ordering key and an untyped JSON payload. `CanonicalRecord` is the typed,
//! schema-validated projection produced by the normalizer.

use crate::pipeline::clock::Nanos;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Venue key used for gas observations, which are chain-wide rather than per pool.
pub const GAS_VENUE: &str = "mainnet";

/// Source domain of an event stream. Each domain has its own canonical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceDomain {
    DexPoolState,
    DexSwap,
    CexQuote,
    GasFee,
}

impl SourceDomain {
    pub const ALL: [SourceDomain; 4] = [
        SourceDomain::DexPoolState,
        SourceDomain::DexSwap,
        SourceDomain::CexQuote,
        SourceDomain::GasFee,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DexPoolState => "dex_pool_state",
            Self::DexSwap => "dex_swap",
            Self::CexQuote => "cex_quote",
            Self::GasFee => "gas_fee",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|d| d.as_str() == s)
    }
}

impl std::fmt::Display for SourceDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source-native ordering key.
///
/// On-chain sources use `(block_number, log_index)`; exchange feeds use
/// `(sequence_id, 0)`. Ties on event time are broken by this key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct OrderingKey {
    pub primary: u64,
    pub secondary: u64,
}

impl OrderingKey {
    pub fn new(primary: u64, secondary: u64) -> Self {
        Self { primary, secondary }
    }

    pub fn sequence(seq: u64) -> Self {
        Self { primary: seq, secondary: 0 }
    }
}

/// Immutable raw event as captured from a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub source_id: String,
    pub domain: SourceDomain,
    pub event_ts: Nanos,
    pub ordering: OrderingKey,
    /// Pool address or exchange symbol, when the source knows it.
    #[serde(default)]
    pub venue: Option<String>,
    pub payload: serde_json::Value,
}

/// Typed payloads, one variant per source domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CanonicalPayload {
    PoolState {
        /// USD per ETH.
        mid: f64,
        depth_usd: Option<f64>,
        fee_tier_bps: Option<f64>,
    },
    Swap {
        price: f64,
        amount_usd: f64,
    },
    CexQuote {
        bid: f64,
        ask: f64,
        mid: f64,
        spread_bps: f64,
        taker_fee_bps: Option<f64>,
    },
    GasFee {
        base_fee_wei: f64,
        priority_fee_wei: f64,
        effective_gas_gwei: f64,
        block_number: Option<u64>,
    },
}

impl CanonicalPayload {
    pub fn domain(&self) -> SourceDomain {
        match self {
            Self::PoolState { .. } => SourceDomain::DexPoolState,
            Self::Swap { .. } => SourceDomain::DexSwap,
            Self::CexQuote { .. } => SourceDomain::CexQuote,
            Self::GasFee { .. } => SourceDomain::GasFee,
        }
    }
}

/// Typed projection of a raw event. Keyed by (domain, venue_key, ordering).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub domain: SourceDomain,
    pub venue_key: String,
    pub event_ts: Nanos,
    pub ordering: OrderingKey,
    pub source_id: String,
    pub payload: CanonicalPayload,
}

impl CanonicalRecord {
    /// Deterministic total order used to pick the last event of a minute:
    /// event time first, then native ordering key, then source id.
    pub fn sequence_cmp(&self, other: &Self) -> Ordering {
        self.event_ts
            .cmp(&other.event_ts)
            .then_with(|| self.ordering.cmp(&other.ordering))
            .then_with(|| self.source_id.cmp(&other.source_id))
    }
}
