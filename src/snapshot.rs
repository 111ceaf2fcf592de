//! Numeric market statistics for a period, and the file cache that pins them.

use crate::error::{MarketContextError, Result};
use crate::utils::Period;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// A statistic value, or an explicit marker that the source could not supply it.
/// `NotAvailable` serializes as `null`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "Option<f64>", into = "Option<f64>")]
pub enum StatValue {
    Value(f64),
    NotAvailable,
}

impl StatValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StatValue::Value(v) if v.is_finite() => Some(*v),
            _ => None,
        }
    }
}

impl From<Option<f64>> for StatValue {
    fn from(value: Option<f64>) -> Self {
        match value {
            Some(v) if v.is_finite() => StatValue::Value(v),
            _ => StatValue::NotAvailable,
        }
    }
}

impl From<StatValue> for Option<f64> {
    fn from(value: StatValue) -> Self {
        value.as_f64()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub period: String,
    pub stats: BTreeMap<String, StatValue>,
    pub captured_at: DateTime<Utc>,
    /// Pinned snapshots never go stale.
    #[serde(default)]
    pub pinned: bool,
}

impl Snapshot {
    pub fn new(period: &Period, stats: BTreeMap<String, StatValue>) -> Self {
        Self {
            period: period.label(),
            stats,
            captured_at: Utc::now(),
            pinned: false,
        }
    }

    pub fn get(&self, name: &str) -> Option<StatValue> {
        self.stats.get(name).copied()
    }

    /// The statistics that have a value, the only ones a record may cite.
    pub fn available(&self) -> BTreeMap<String, f64> {
        self.stats
            .iter()
            .filter_map(|(name, value)| value.as_f64().map(|v| (name.clone(), v)))
            .collect()
    }

    pub fn missing(&self) -> Vec<&str> {
        self.stats
            .iter()
            .filter(|(_, value)| value.as_f64().is_none())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        if self.pinned {
            return true;
        }
        match (now - self.captured_at).to_std() {
            Ok(age) => age < max_age,
            // captured_at in the future: clock skew, treat as fresh
            Err(_) => true,
        }
    }
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn get_snapshot(&self, period: &Period) -> Result<Snapshot>;
}

/// Deterministic reference statistics, used when no market data feed is
/// configured. Every period receives the same values.
#[derive(Debug, Clone)]
pub struct FixedMarketData {
    market: BTreeMap<String, StatValue>,
    economic: BTreeMap<String, StatValue>,
}

impl Default for FixedMarketData {
    fn default() -> Self {
        Self::reference()
    }
}

impl FixedMarketData {
    pub fn reference() -> Self {
        let market = [
            ("sp500_tr", 12.3),
            ("ust10y_yield", 4.25),
            ("dxy_chg", -2.1),
            ("vix_peak", 28.7),
            ("market_cap", 45_000_000_000.0),
            ("trading_volume", 2_500_000.0),
            ("volatility_index", 18.5),
            ("technology_performance", 12.3),
            ("healthcare_performance", 8.7),
            ("financials_performance", -2.1),
        ];
        let economic = [
            ("gdp_growth", 2.4),
            ("inflation_rate", 3.2),
            ("unemployment_rate", 4.1),
            ("interest_rate", 5.25),
        ];

        Self {
            market: to_stats(&market),
            economic: to_stats(&economic),
        }
    }

    /// Empty source; every lookup produces an empty snapshot until stats are added.
    pub fn empty() -> Self {
        Self {
            market: BTreeMap::new(),
            economic: BTreeMap::new(),
        }
    }

    pub fn with_stat(mut self, name: impl Into<String>, value: StatValue) -> Self {
        let name = name.into();
        self.economic.remove(&name);
        self.market.insert(name, value);
        self
    }

    async fn market_data(&self, period: &Period) -> BTreeMap<String, StatValue> {
        debug!("Loading reference market data for {}", period);
        self.market.clone()
    }

    async fn economic_indicators(&self, period: &Period) -> BTreeMap<String, StatValue> {
        debug!("Loading reference economic indicators for {}", period);
        self.economic.clone()
    }
}

fn to_stats(pairs: &[(&str, f64)]) -> BTreeMap<String, StatValue> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), StatValue::Value(*value)))
        .collect()
}

#[async_trait]
impl SnapshotSource for FixedMarketData {
    async fn get_snapshot(&self, period: &Period) -> Result<Snapshot> {
        let (mut stats, economic) =
            futures::join!(self.market_data(period), self.economic_indicators(period));
        stats.extend(economic);
        Ok(Snapshot::new(period, stats))
    }
}

/// JSON file cache in front of an upstream source, one file per period
/// (`<dir>/<period>.json`).
pub struct FileSnapshotStore {
    dir: PathBuf,
    max_age: Duration,
    pin_writes: bool,
    upstream: Arc<dyn SnapshotSource>,
}

impl FileSnapshotStore {
    pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(3600);

    pub fn new(dir: impl Into<PathBuf>, upstream: Arc<dyn SnapshotSource>) -> Self {
        Self {
            dir: dir.into(),
            max_age: Self::DEFAULT_MAX_AGE,
            pin_writes: false,
            upstream,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// When set, fetched snapshots are never written, so files on disk stay
    /// exactly as they were checked in.
    pub fn with_pin_writes(mut self, pin_writes: bool) -> Self {
        self.pin_writes = pin_writes;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, period: &Period) -> PathBuf {
        self.dir.join(format!("{}.json", period.label()))
    }

    /// Returns the cached snapshot when it exists, parses, matches the period
    /// and is fresh. Anything else is a miss.
    pub async fn load(&self, period: &Period) -> Option<Snapshot> {
        let path = self.path_for(period);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Could not read snapshot {}: {}", path.display(), e);
                return None;
            }
        };

        let snapshot: Snapshot = match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Ignoring unreadable snapshot {}: {}", path.display(), e);
                return None;
            }
        };

        if snapshot.period != period.label() {
            warn!(
                "Snapshot {} is for {}, not {}",
                path.display(),
                snapshot.period,
                period
            );
            return None;
        }
        if !snapshot.is_fresh(Utc::now(), self.max_age) {
            info!("Snapshot {} is stale, will refresh", path.display());
            return None;
        }

        Some(snapshot)
    }

    pub async fn save(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        let period = Period::parse(&snapshot.period)?;
        let path = self.path_for(&period);
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::write(&path, body).await?;
        Ok(path)
    }
}

#[async_trait]
impl SnapshotSource for FileSnapshotStore {
    async fn get_snapshot(&self, period: &Period) -> Result<Snapshot> {
        if let Some(snapshot) = self.load(period).await {
            info!("Using cached snapshot for {}", period);
            return Ok(snapshot);
        }

        info!("Fetching fresh snapshot for {}", period);
        let snapshot = self.upstream.get_snapshot(period).await?;
        if snapshot.period != period.label() {
            return Err(MarketContextError::Snapshot {
                period: period.label(),
                details: format!("upstream returned a snapshot for {}", snapshot.period),
            });
        }

        if self.pin_writes {
            info!("Snapshots are pinned, skipping save for {}", period);
        } else {
            match self.save(&snapshot).await {
                Ok(path) => info!("Saved snapshot to {}", path.display()),
                Err(e) => warn!("Could not save snapshot for {}: {}", period, e),
            }
        }

        Ok(snapshot)
    }
}
