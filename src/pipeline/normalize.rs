//! Stream Normalizer
//!
//! Parses raw JSON payloads into typed canonical records, one table per
//! source domain. Events failing validation are rejected with a reason code
//! and counted, never repaired.
//!
//! DEX prices are always oriented as USD per ETH. A pool state may carry the
//! mid directly or as `sqrt_price_x96`; a swap may carry its price directly or
//! the two token amounts.

use crate::pipeline::events::{CanonicalPayload, CanonicalRecord, RawEvent, SourceDomain, GAS_VENUE};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

const Q192: f64 = 6.277_101_735_386_681e57; // 2^192

fn deserialize_number_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(f64),
    }

    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        StringOrNumber::Number(n) => Ok(n),
    }
}

fn deserialize_opt_number_or_string<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrap(#[serde(deserialize_with = "deserialize_number_or_string")] f64);

    Ok(Option::<Wrap>::deserialize(deserializer)?.map(|w| w.0))
}

/// Raw pool-state payload.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPoolState {
    #[serde(default, alias = "price", deserialize_with = "deserialize_opt_number_or_string")]
    pub mid: Option<f64>,
    #[serde(default, alias = "sqrtPriceX96", deserialize_with = "deserialize_opt_number_or_string")]
    pub sqrt_price_x96: Option<f64>,
    #[serde(default)]
    pub decimals0: Option<i32>,
    #[serde(default)]
    pub decimals1: Option<i32>,
    #[serde(default, alias = "liquidity_usd", deserialize_with = "deserialize_opt_number_or_string")]
    pub depth_usd: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_opt_number_or_string")]
    pub fee_tier_bps: Option<f64>,
}

/// Raw swap payload.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSwap {
    #[serde(default, deserialize_with = "deserialize_opt_number_or_string")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_opt_number_or_string")]
    pub amount0: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_opt_number_or_string")]
    pub amount1: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_opt_number_or_string")]
    pub amount_usd: Option<f64>,
}

/// Raw exchange quote payload.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCexQuote {
    #[serde(alias = "bid_price", deserialize_with = "deserialize_number_or_string")]
    pub bid: f64,
    #[serde(alias = "ask_price", deserialize_with = "deserialize_number_or_string")]
    pub ask: f64,
    #[serde(default, deserialize_with = "deserialize_opt_number_or_string")]
    pub taker_fee_bps: Option<f64>,
}

/// Raw block fee payload.
#[derive(Debug, Clone, Deserialize)]
pub struct RawGasFee {
    #[serde(alias = "baseFeePerGas", deserialize_with = "deserialize_number_or_string")]
    pub base_fee_wei: f64,
    #[serde(
        default,
        alias = "maxPriorityFeePerGas",
        deserialize_with = "deserialize_opt_number_or_string"
    )]
    pub priority_fee_wei: Option<f64>,
    #[serde(default, alias = "number")]
    pub block_number: Option<u64>,
}

/// `sqrtPriceX96^2 / 2^192`, decimal-adjusted and inverted to USD per ETH when below 1.
pub fn price_from_sqrt_x96(sqrt_price_x96: f64, decimals0: i32, decimals1: i32) -> Option<f64> {
    if !(sqrt_price_x96.is_finite() && sqrt_price_x96 > 0.0) {
        return None;
    }
    let raw = sqrt_price_x96 * sqrt_price_x96 / Q192 * 10f64.powi(decimals0 - decimals1);
    let price = if raw < 1.0 { 1.0 / raw } else { raw };
    valid_price(price)
}

/// `max(|a1/a0|, |a0/a1|)`
pub fn price_from_amounts(amount0: f64, amount1: f64) -> Option<f64> {
    if amount0 == 0.0 || amount1 == 0.0 {
        return None;
    }
    let r = (amount1 / amount0).abs();
    valid_price(r.max(1.0 / r))
}

fn valid_price(p: f64) -> Option<f64> {
    (p.is_finite() && p > 0.0).then_some(p)
}

/// Optional amounts must be finite and non-negative when present.
fn check_non_negative(values: &[Option<f64>]) -> Result<(), RejectReason> {
    for v in values.iter().flatten() {
        if !v.is_finite() {
            return Err(RejectReason::NonFinite);
        }
        if *v < 0.0 {
            return Err(RejectReason::NegativeValue);
        }
    }
    Ok(())
}

/// Why a raw event was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MalformedPayload,
    InvalidPrice,
    CrossedQuote,
    NegativeValue,
    /// Numeric field parsed to infinity or NaN.
    NonFinite,
    MissingVenue,
    DuplicateKey,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedPayload => "malformed_payload",
            Self::InvalidPrice => "invalid_price",
            Self::CrossedQuote => "crossed_quote",
            Self::NegativeValue => "negative_value",
            Self::NonFinite => "non_finite",
            Self::MissingVenue => "missing_venue",
            Self::DuplicateKey => "duplicate_key",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizeStats {
    pub total_events: u64,
    pub valid_events: u64,
    pub rejected: BTreeMap<String, u64>,
}

impl NormalizeStats {
    pub fn rejected_total(&self) -> u64 {
        self.rejected.values().sum()
    }

    pub fn merge(&mut self, other: &NormalizeStats) {
        self.total_events += other.total_events;
        self.valid_events += other.valid_events;
        for (k, v) in &other.rejected {
            *self.rejected.entry(k.clone()).or_default() += v;
        }
    }
}

/// Stateful normalizer for one partition.
///
/// Keeps the set of seen canonical keys so replayed events are dropped.
#[derive(Default)]
pub struct StreamNormalizer {
    stats: NormalizeStats,
    seen: HashSet<(SourceDomain, String, u64, u64, String)>,
}

impl StreamNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &NormalizeStats {
        &self.stats
    }

    fn reject(&mut self, raw: &RawEvent, reason: RejectReason) -> Option<CanonicalRecord> {
        debug!(
            domain = %raw.domain,
            source = %raw.source_id,
            ts = raw.event_ts,
            reason = reason.as_str(),
            "raw event rejected"
        );
        *self.stats.rejected.entry(reason.as_str().to_string()).or_default() += 1;
        None
    }

    pub fn normalize(&mut self, raw: &RawEvent) -> Option<CanonicalRecord> {
        self.stats.total_events += 1;

        let venue_key = match (raw.domain, raw.venue.as_deref()) {
            (SourceDomain::GasFee, v) => v.unwrap_or(GAS_VENUE).to_string(),
            (_, Some(v)) if !v.is_empty() => v.to_string(),
            _ => return self.reject(raw, RejectReason::MissingVenue),
        };

        let payload = match self.parse_payload(raw) {
            Ok(p) => p,
            Err(reason) => return self.reject(raw, reason),
        };

        let key = (
            raw.domain,
            venue_key.clone(),
            raw.ordering.primary,
            raw.ordering.secondary,
            raw.source_id.clone(),
        );
        if !self.seen.insert(key) {
            return self.reject(raw, RejectReason::DuplicateKey);
        }

        self.stats.valid_events += 1;
        Some(CanonicalRecord {
            domain: raw.domain,
            venue_key,
            event_ts: raw.event_ts,
            ordering: raw.ordering,
            source_id: raw.source_id.clone(),
            payload,
        })
    }

    pub fn normalize_batch(&mut self, raws: &[RawEvent]) -> Vec<CanonicalRecord> {
        let out: Vec<CanonicalRecord> = raws.iter().filter_map(|r| self.normalize(r)).collect();
        let rejected = raws.len() - out.len();
        if rejected > 0 {
            warn!(rejected, total = raws.len(), "raw events rejected during normalization");
        }
        out
    }

    fn parse_payload(&self, raw: &RawEvent) -> Result<CanonicalPayload, RejectReason> {
        let p = &raw.payload;
        match raw.domain {
            SourceDomain::DexPoolState => {
                let r: RawPoolState =
                    serde_json::from_value(p.clone()).map_err(|_| RejectReason::MalformedPayload)?;
                let mid = match (r.mid, r.sqrt_price_x96) {
                    (Some(m), _) => valid_price(m),
                    (None, Some(sq)) => {
                        price_from_sqrt_x96(sq, r.decimals0.unwrap_or(0), r.decimals1.unwrap_or(0))
                    }
                    (None, None) => return Err(RejectReason::MalformedPayload),
                }
                .ok_or(RejectReason::InvalidPrice)?;
                check_non_negative(&[r.depth_usd, r.fee_tier_bps])?;
                Ok(CanonicalPayload::PoolState {
                    mid,
                    depth_usd: r.depth_usd,
                    fee_tier_bps: r.fee_tier_bps,
                })
            }
            SourceDomain::DexSwap => {
                let r: RawSwap =
                    serde_json::from_value(p.clone()).map_err(|_| RejectReason::MalformedPayload)?;
                let price = match (r.price, r.amount0, r.amount1) {
                    (Some(px), _, _) => valid_price(px),
                    (None, Some(a0), Some(a1)) => price_from_amounts(a0, a1),
                    _ => return Err(RejectReason::MalformedPayload),
                }
                .ok_or(RejectReason::InvalidPrice)?;
                // Without an explicit USD amount the larger leg is taken as the stable side.
                let amount_usd = r
                    .amount_usd
                    .or_else(|| match (r.amount0, r.amount1) {
                        (Some(a0), Some(a1)) => Some(a0.abs().max(a1.abs())),
                        _ => None,
                    })
                    .unwrap_or(0.0)
                    .abs();
                if !amount_usd.is_finite() {
                    return Err(RejectReason::NonFinite);
                }
                Ok(CanonicalPayload::Swap { price, amount_usd })
            }
            SourceDomain::CexQuote => {
                let r: RawCexQuote =
                    serde_json::from_value(p.clone()).map_err(|_| RejectReason::MalformedPayload)?;
                if valid_price(r.bid).is_none() || valid_price(r.ask).is_none() {
                    return Err(RejectReason::InvalidPrice);
                }
                if r.ask < r.bid {
                    return Err(RejectReason::CrossedQuote);
                }
                check_non_negative(&[r.taker_fee_bps])?;
                let mid = 0.5 * (r.bid + r.ask);
                Ok(CanonicalPayload::CexQuote {
                    bid: r.bid,
                    ask: r.ask,
                    mid,
                    spread_bps: 1e4 * (r.ask - r.bid) / mid,
                    taker_fee_bps: r.taker_fee_bps,
                })
            }
            SourceDomain::GasFee => {
                let r: RawGasFee =
                    serde_json::from_value(p.clone()).map_err(|_| RejectReason::MalformedPayload)?;
                check_non_negative(&[Some(r.base_fee_wei), r.priority_fee_wei])?;
                let priority = r.priority_fee_wei.unwrap_or(0.0);
                Ok(CanonicalPayload::GasFee {
                    base_fee_wei: r.base_fee_wei,
                    priority_fee_wei: priority,
                    effective_gas_gwei: (r.base_fee_wei + priority) / 1e9,
                    block_number: r.block_number,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::events::OrderingKey;
    use serde_json::json;

    fn raw(domain: SourceDomain, venue: Option<&str>, payload: serde_json::Value) -> RawEvent {
        RawEvent {
            source_id: "test".into(),
            domain,
            event_ts: 0,
            ordering: OrderingKey::new(1, 0),
            venue: venue.map(String::from),
            payload,
        }
    }

    #[test]
    fn test_sqrt_price_orientation() {
        // sqrtPriceX96 for a raw price of 1/3000 is inverted to 3000.
        let sq = (1.0f64 / 3000.0).sqrt() * 2f64.powi(96);
        let p = price_from_sqrt_x96(sq, 0, 0).unwrap();
        assert!((p - 3000.0).abs() < 1e-6);
    }

    #[test]
    fn test_price_from_amounts() {
        let p = price_from_amounts(-2.0, 6000.0).unwrap();
        assert!((p - 3000.0).abs() < 1e-9);
        assert_eq!(price_from_amounts(0.0, 1.0), None);
    }

    #[test]
    fn test_cex_quote_mid_and_spread() {
        let mut n = StreamNormalizer::new();
        let rec = n
            .normalize(&raw(SourceDomain::CexQuote, Some("ETHUSDT"), json!({"bid": "2999.5", "ask": 3000.5})))
            .unwrap();
        match rec.payload {
            CanonicalPayload::CexQuote { mid, spread_bps, .. } => {
                assert_eq!(mid, 3000.0);
                assert!((spread_bps - 1e4 / 3000.0).abs() < 1e-9);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_gas_effective_gwei() {
        let mut n = StreamNormalizer::new();
        let rec = n
            .normalize(&raw(
                SourceDomain::GasFee,
                None,
                json!({"baseFeePerGas": "20000000000", "priority_fee_wei": 1e9}),
            ))
            .unwrap();
        assert_eq!(rec.venue_key, GAS_VENUE);
        match rec.payload {
            CanonicalPayload::GasFee { effective_gas_gwei, .. } => assert_eq!(effective_gas_gwei, 21.0),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_rejections_are_counted_by_reason() {
        let mut n = StreamNormalizer::new();
        let events = vec![
            raw(SourceDomain::CexQuote, Some("ETHUSDT"), json!({"bid": 3001.0, "ask": 3000.0})),
            raw(SourceDomain::DexPoolState, Some("p"), json!({"mid": -1.0})),
            raw(SourceDomain::DexPoolState, None, json!({"mid": 3000.0})),
            raw(SourceDomain::DexSwap, Some("p"), json!({"foo": 1})),
            raw(SourceDomain::DexPoolState, Some("p"), json!({"mid": 3000.0})),
            raw(SourceDomain::DexPoolState, Some("p"), json!({"mid": 3000.0})),
        ];
        let out = n.normalize_batch(&events);
        assert_eq!(out.len(), 1);
        let s = n.stats();
        assert_eq!(s.total_events, 6);
        assert_eq!(s.rejected_total(), 5);
        assert_eq!(s.rejected.get("crossed_quote"), Some(&1));
        assert_eq!(s.rejected.get("invalid_price"), Some(&1));
        assert_eq!(s.rejected.get("missing_venue"), Some(&1));
        assert_eq!(s.rejected.get("malformed_payload"), Some(&1));
        assert_eq!(s.rejected.get("duplicate_key"), Some(&1));
    }

    #[test]
    fn test_non_finite_numbers_are_rejected_not_passed_through() {
        let mut n = StreamNormalizer::new();
        let events = vec![
            raw(SourceDomain::DexPoolState, Some("p"), json!({"mid": 3000.0, "fee_tier_bps": "inf"})),
            raw(SourceDomain::DexPoolState, Some("q"), json!({"mid": 3000.0, "depth_usd": "1e400"})),
            raw(SourceDomain::DexPoolState, Some("r"), json!({"mid": 3000.0, "depth_usd": "NaN"})),
            raw(SourceDomain::CexQuote, Some("ETHUSDT"), json!({"bid": 2999.0, "ask": 3001.0, "taker_fee_bps": "inf"})),
            raw(SourceDomain::GasFee, None, json!({"base_fee_wei": "1e400"})),
            raw(SourceDomain::DexPoolState, Some("s"), json!({"mid": "inf"})),
            raw(SourceDomain::DexPoolState, Some("t"), json!({"mid": 3000.0, "fee_tier_bps": -5.0})),
        ];
        let out = n.normalize_batch(&events);
        assert!(out.is_empty());
        let s = n.stats();
        assert_eq!(s.rejected.get("non_finite"), Some(&5));
        assert_eq!(s.rejected.get("invalid_price"), Some(&1));
        assert_eq!(s.rejected.get("negative_value"), Some(&1));
    }
}
