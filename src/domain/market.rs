use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Candle retention tiers. 5m candles age into 1h, 1h into 1d.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M5,
    H1,
    D1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M5 => "5m",
            Timeframe::H1 => "1h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "5m" => Some(Timeframe::M5),
            "1h" => Some(Timeframe::H1),
            "1d" => Some(Timeframe::D1),
            _ => None,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// An OHLCV series ordered by timestamp ascending with unique timestamps.
///
/// Slicing helpers never copy more than the requested window; the backtester
/// leans on `up_to` and `between` heavily.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandleSeries {
    candles: Vec<Candle>,
}

impl CandleSeries {
    pub fn new(mut candles: Vec<Candle>) -> Self {
        candles.sort_by_key(|c| c.timestamp);
        candles.dedup_by_key(|c| c.timestamp);
        Self { candles }
    }

    pub fn empty() -> Self {
        Self { candles: Vec::new() }
    }

    /// Insert or replace the candle at its timestamp.
    pub fn upsert(&mut self, candle: Candle) {
        match self
            .candles
            .binary_search_by_key(&candle.timestamp, |c| c.timestamp)
        {
            Ok(i) => self.candles[i] = candle,
            Err(i) => self.candles.insert(i, candle),
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn first(&self) -> Option<&Candle> {
        self.candles.first()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter()
    }

    pub fn as_slice(&self) -> &[Candle] {
        &self.candles
    }

    /// All candles with `timestamp <= ts`.
    pub fn up_to(&self, ts: DateTime<Utc>) -> &[Candle] {
        let end = self.candles.partition_point(|c| c.timestamp <= ts);
        &self.candles[..end]
    }

    /// Candles in `[start, end)`.
    pub fn between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> &[Candle] {
        let lo = self.candles.partition_point(|c| c.timestamp < start);
        let hi = self.candles.partition_point(|c| c.timestamp < end);
        &self.candles[lo..hi]
    }

    /// The candle exactly at `ts`, if stored.
    pub fn at(&self, ts: DateTime<Utc>) -> Option<&Candle> {
        self.candles
            .binary_search_by_key(&ts, |c| c.timestamp)
            .ok()
            .map(|i| &self.candles[i])
    }

    pub fn tail(&self, n: usize) -> &[Candle] {
        let start = self.candles.len().saturating_sub(n);
        &self.candles[start..]
    }

    pub fn timestamps(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.candles.iter().map(|c| c.timestamp)
    }

    /// Median intrabar range `(high - low) / close` over the last `window`
    /// candles. Falls back to a constant when fewer than 10 bars exist.
    pub fn median_intrabar_spread(&self, window: usize) -> f64 {
        let sample = self.tail(window);
        if sample.len() < 10 {
            return 0.001;
        }
        let mut spreads: Vec<f64> = sample
            .iter()
            .filter(|c| c.close > 0.0)
            .map(|c| (c.high - c.low) / c.close)
            .collect();
        if spreads.len() < 10 {
            return 0.001;
        }
        spreads.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = spreads.len() / 2;
        if spreads.len() % 2 == 0 {
            (spreads[mid - 1] + spreads[mid]) / 2.0
        } else {
            spreads[mid]
        }
    }

    /// Sum of volume over the last `n` candles; 0 when fewer exist.
    pub fn volume_tail(&self, n: usize) -> f64 {
        if self.candles.len() < n {
            return 0.0;
        }
        self.tail(n).iter().map(|c| c.volume).sum()
    }

    /// Aggregate into coarser buckets (hour or day boundaries).
    pub fn resample(&self, target: Timeframe) -> CandleSeries {
        let mut out: Vec<Candle> = Vec::new();
        for c in &self.candles {
            let bucket = bucket_start(c.timestamp, target);
            match out.last_mut() {
                Some(last) if last.timestamp == bucket => {
                    last.high = last.high.max(c.high);
                    last.low = last.low.min(c.low);
                    last.close = c.close;
                    last.volume += c.volume;
                }
                _ => out.push(Candle {
                    timestamp: bucket,
                    open: c.open,
                    high: c.high,
                    low: c.low,
                    close: c.close,
                    volume: c.volume,
                }),
            }
        }
        CandleSeries { candles: out }
    }
}

/// Truncate a timestamp to the natural start of its bucket.
pub fn bucket_start(ts: DateTime<Utc>, tf: Timeframe) -> DateTime<Utc> {
    match tf {
        Timeframe::M5 => {
            let minute = ts.minute() - ts.minute() % 5;
            Utc.with_ymd_and_hms(ts.year(), ts.month(), ts.day(), ts.hour(), minute, 0)
                .single()
                .unwrap_or(ts)
        }
        Timeframe::H1 => Utc
            .with_ymd_and_hms(ts.year(), ts.month(), ts.day(), ts.hour(), 0, 0)
            .single()
            .unwrap_or(ts),
        Timeframe::D1 => Utc
            .with_ymd_and_hms(ts.year(), ts.month(), ts.day(), 0, 0, 0)
            .single()
            .unwrap_or(ts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(ts: DateTime<Utc>, close: f64) -> Candle {
        Candle {
            timestamp: ts,
            open: close,
            high: close * 1.01,
            low: close * 0.99,
            close,
            volume: 10.0,
        }
    }

    fn minutes(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(n)
    }

    #[test]
    fn series_is_sorted_and_unique() {
        let series = CandleSeries::new(vec![
            candle(minutes(10), 2.0),
            candle(minutes(0), 1.0),
            candle(minutes(10), 3.0),
        ]);
        assert_eq!(series.len(), 2);
        assert_eq!(series.first().unwrap().timestamp, minutes(0));
    }

    #[test]
    fn up_to_is_inclusive() {
        let series = CandleSeries::new((0..5).map(|i| candle(minutes(i * 5), 1.0)).collect());
        assert_eq!(series.up_to(minutes(10)).len(), 3);
        assert_eq!(series.up_to(minutes(9)).len(), 2);
    }

    #[test]
    fn resample_5m_to_1h_buckets_on_hour() {
        // Two hours of 5m candles, 12 each
        let series = CandleSeries::new((0..24).map(|i| candle(minutes(i * 5), i as f64)).collect());
        let hourly = series.resample(Timeframe::H1);
        assert_eq!(hourly.len(), 2);
        let first = hourly.first().unwrap();
        assert_eq!(first.timestamp, minutes(0));
        assert_eq!(first.open, 0.0);
        assert_eq!(first.close, 11.0);
        assert_eq!(first.volume, 120.0);
    }

    #[test]
    fn spread_falls_back_on_thin_data() {
        let series = CandleSeries::new((0..5).map(|i| candle(minutes(i * 5), 100.0)).collect());
        assert_eq!(series.median_intrabar_spread(100), 0.001);
    }

    #[test]
    fn spread_uses_median_intrabar_range() {
        let series = CandleSeries::new((0..50).map(|i| candle(minutes(i * 5), 100.0)).collect());
        let spread = series.median_intrabar_spread(100);
        // (high - low) / close = (101 - 99) / 100
        assert!((spread - 0.02).abs() < 1e-9);
    }
}
