//! Tiered OHLCV storage with nightly aggregation.
//!
//! Retention tiers: 5m candles for 30 days, hourly for a year (aggregated
//! from 5m), daily for 7 years (aggregated from hourly). Aggregation
//! cutoffs snap to the natural unit boundary so a bucket is never split
//! across two runs.

use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::info;

use crate::config::DataConfig;
use crate::domain::market::{bucket_start, Candle, CandleSeries, Timeframe};
use crate::domain::time::{fmt_utc, parse_utc_lossy};
use crate::infrastructure::persistence::{RowExt, Store};

pub struct DataStore {
    store: Store,
    config: DataConfig,
}

impl DataStore {
    pub fn new(store: Store, config: DataConfig) -> Self {
        Self { store, config }
    }

    /// Insert or replace candles. Returns the row count written.
    pub async fn store_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        series: &CandleSeries,
    ) -> Result<usize> {
        for c in series.iter() {
            self.store
                .exec(
                    "INSERT OR REPLACE INTO candles \
                     (symbol, timeframe, timestamp, open, high, low, close, volume) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    &[
                        json!(symbol),
                        json!(timeframe.as_str()),
                        json!(fmt_utc(c.timestamp)),
                        json!(c.open),
                        json!(c.high),
                        json!(c.low),
                        json!(c.close),
                        json!(c.volume),
                    ],
                )
                .await?;
        }
        Ok(series.len())
    }

    /// Candles ordered ascending; `limit` takes the most recent N.
    pub async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: Option<usize>,
    ) -> Result<CandleSeries> {
        let rows = match limit {
            Some(n) => {
                self.store
                    .fetch_all(
                        "SELECT * FROM ( \
                           SELECT timestamp, open, high, low, close, volume \
                           FROM candles WHERE symbol = ? AND timeframe = ? \
                           ORDER BY timestamp DESC LIMIT ? \
                         ) ORDER BY timestamp ASC",
                        &[json!(symbol), json!(timeframe.as_str()), json!(n as i64)],
                    )
                    .await?
            }
            None => {
                self.store
                    .fetch_all(
                        "SELECT timestamp, open, high, low, close, volume \
                         FROM candles WHERE symbol = ? AND timeframe = ? \
                         ORDER BY timestamp ASC",
                        &[json!(symbol), json!(timeframe.as_str())],
                    )
                    .await?
            }
        };

        let candles = rows
            .iter()
            .filter_map(|r| {
                Some(Candle {
                    timestamp: parse_utc_lossy(&r.str_or("timestamp", ""))?,
                    open: r.f64("open"),
                    high: r.f64("high"),
                    low: r.f64("low"),
                    close: r.f64("close"),
                    volume: r.f64("volume"),
                })
            })
            .collect();
        Ok(CandleSeries::new(candles))
    }

    pub async fn candle_count(&self, symbol: &str, timeframe: Timeframe) -> Result<i64> {
        let row = self
            .store
            .fetch_one(
                "SELECT COUNT(*) as cnt FROM candles WHERE symbol = ? AND timeframe = ?",
                &[json!(symbol), json!(timeframe.as_str())],
            )
            .await?;
        Ok(row.map(|r| r.i64("cnt")).unwrap_or(0))
    }

    /// Aggregate 5-minute candles older than retention into hourly ones,
    /// then drop the source rows.
    pub async fn aggregate_5m_to_1h(&self) -> Result<usize> {
        let cutoff_raw = Utc::now() - Duration::days(self.config.candle_5m_retention_days);
        let cutoff = fmt_utc(bucket_start(cutoff_raw, Timeframe::H1));
        self.aggregate_tier(Timeframe::M5, Timeframe::H1, &cutoff).await
    }

    /// Aggregate hourly candles older than retention into daily ones.
    pub async fn aggregate_1h_to_daily(&self) -> Result<usize> {
        let cutoff_raw = Utc::now() - Duration::days(self.config.candle_1h_retention_days);
        let cutoff = fmt_utc(bucket_start(cutoff_raw, Timeframe::D1));
        self.aggregate_tier(Timeframe::H1, Timeframe::D1, &cutoff).await
    }

    async fn aggregate_tier(
        &self,
        source: Timeframe,
        target: Timeframe,
        cutoff: &str,
    ) -> Result<usize> {
        let symbols = self
            .store
            .fetch_all(
                "SELECT DISTINCT symbol FROM candles WHERE timeframe = ? AND timestamp < ?",
                &[json!(source.as_str()), json!(cutoff)],
            )
            .await?;

        let mut total = 0usize;
        for row in symbols {
            let symbol = row.str_or("symbol", "");
            let rows = self
                .store
                .fetch_all(
                    "SELECT timestamp, open, high, low, close, volume \
                     FROM candles WHERE symbol = ? AND timeframe = ? AND timestamp < ? \
                     ORDER BY timestamp ASC",
                    &[json!(symbol), json!(source.as_str()), json!(cutoff)],
                )
                .await?;
            if rows.is_empty() {
                continue;
            }
            let series = CandleSeries::new(
                rows.iter()
                    .filter_map(|r| {
                        Some(Candle {
                            timestamp: parse_utc_lossy(&r.str_or("timestamp", ""))?,
                            open: r.f64("open"),
                            high: r.f64("high"),
                            low: r.f64("low"),
                            close: r.f64("close"),
                            volume: r.f64("volume"),
                        })
                    })
                    .collect(),
            );
            let aggregated = series.resample(target);
            if aggregated.is_empty() {
                continue;
            }
            total += self.store_candles(&symbol, target, &aggregated).await?;
            // Source rows go only after the aggregate landed
            self.store
                .exec(
                    "DELETE FROM candles WHERE symbol = ? AND timeframe = ? AND timestamp < ?",
                    &[json!(symbol), json!(source.as_str()), json!(cutoff)],
                )
                .await?;
        }

        if total > 0 {
            info!(
                source = source.as_str(),
                target = target.as_str(),
                candles = total,
                "candles aggregated"
            );
        }
        Ok(total)
    }

    /// Retention sweeps over every high-frequency table.
    pub async fn prune_old_data(&self) -> Result<()> {
        let now = Utc::now();
        let daily_cutoff =
            fmt_utc(now - Duration::days(self.config.candle_1d_retention_years * 365));
        self.store
            .exec(
                "DELETE FROM candles WHERE timeframe = '1d' AND timestamp < ?",
                &[json!(daily_cutoff)],
            )
            .await?;

        let ninety_days = fmt_utc(now - Duration::days(90));
        self.store
            .exec(
                "DELETE FROM token_usage WHERE created_at < ?",
                &[json!(ninety_days.clone())],
            )
            .await?;
        self.store
            .exec(
                "DELETE FROM fee_schedule WHERE checked_at < ?",
                &[json!(ninety_days.clone())],
            )
            .await?;
        self.store
            .exec(
                "DELETE FROM activity_log WHERE timestamp < ?",
                &[json!(ninety_days)],
            )
            .await?;

        let signal_cutoff = fmt_utc(now - Duration::days(180));
        self.store
            .exec(
                "DELETE FROM signals WHERE created_at < ?",
                &[json!(signal_cutoff)],
            )
            .await?;

        let scan_cutoff = fmt_utc(now - Duration::days(30));
        self.store
            .exec(
                "DELETE FROM scan_results WHERE created_at < ?",
                &[json!(scan_cutoff)],
            )
            .await?;

        let orch_cutoff = fmt_utc(now - Duration::days(365));
        self.store
            .exec(
                "DELETE FROM orchestrator_log WHERE date < ?",
                &[json!(orch_cutoff)],
            )
            .await?;
        Ok(())
    }

    /// All data maintenance, run during the orchestration window.
    pub async fn run_nightly_maintenance(&self) -> Result<()> {
        info!("data maintenance start");
        self.aggregate_5m_to_1h().await?;
        self.aggregate_1h_to_daily().await?;
        self.prune_old_data().await?;
        info!("data maintenance complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn series_at(start: chrono::DateTime<Utc>, step_minutes: i64, n: usize) -> CandleSeries {
        CandleSeries::new(
            (0..n)
                .map(|i| Candle {
                    timestamp: start + Duration::minutes(step_minutes * i as i64),
                    open: 100.0,
                    high: 101.0,
                    low: 99.0,
                    close: 100.5,
                    volume: 5.0,
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn store_and_fetch_with_limit() {
        let store = Store::connect_memory().await.unwrap();
        let ds = DataStore::new(store, DataConfig::default());
        let start = Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap();
        ds.store_candles("BTC/USD", Timeframe::M5, &series_at(start, 5, 20))
            .await
            .unwrap();

        let all = ds.get_candles("BTC/USD", Timeframe::M5, None).await.unwrap();
        assert_eq!(all.len(), 20);

        let tail = ds
            .get_candles("BTC/USD", Timeframe::M5, Some(5))
            .await
            .unwrap();
        assert_eq!(tail.len(), 5);
        // Most recent five, still ascending
        assert_eq!(tail.first().unwrap().timestamp, start + Duration::minutes(75));
        assert!(tail.first().unwrap().timestamp < tail.last().unwrap().timestamp);
    }

    #[tokio::test]
    async fn old_5m_candles_roll_into_hourly() {
        let store = Store::connect_memory().await.unwrap();
        let ds = DataStore::new(store, DataConfig::default());
        // Two hours of 5m candles from 40 days ago: all older than cutoff
        let start = bucket_start(Utc::now() - Duration::days(40), Timeframe::H1);
        ds.store_candles("BTC/USD", Timeframe::M5, &series_at(start, 5, 24))
            .await
            .unwrap();

        let aggregated = ds.aggregate_5m_to_1h().await.unwrap();
        assert_eq!(aggregated, 2);
        assert_eq!(ds.candle_count("BTC/USD", Timeframe::M5).await.unwrap(), 0);
        let hourly = ds.get_candles("BTC/USD", Timeframe::H1, None).await.unwrap();
        assert_eq!(hourly.len(), 2);
        assert_eq!(hourly.first().unwrap().volume, 60.0);
    }

    #[tokio::test]
    async fn recent_candles_survive_aggregation() {
        let store = Store::connect_memory().await.unwrap();
        let ds = DataStore::new(store, DataConfig::default());
        let start = bucket_start(Utc::now() - Duration::hours(3), Timeframe::H1);
        ds.store_candles("BTC/USD", Timeframe::M5, &series_at(start, 5, 12))
            .await
            .unwrap();
        ds.aggregate_5m_to_1h().await.unwrap();
        assert_eq!(ds.candle_count("BTC/USD", Timeframe::M5).await.unwrap(), 12);
    }
}
