// src/instruments.rs
//
// Venue instrument catalog: download the CSV dump, cache it on disk, and
// answer symbol -> token, token -> metadata and nearest-future lookups.
// The CSV is considered stale after a TTL (mtime is the source of truth);
// a failed download falls back to the cached copy, and only when neither
// is available does initialization fail.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use chrono::{Datelike, NaiveDate, Utc, Weekday};
use tracing::{debug, info, warn};

pub const DEFAULT_CATALOG_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

/// Venue-B exchange segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exchange {
    Nse,
    Bse,
    Nfo,
    Bfo,
    Cds,
    Mcx,
    Unknown,
}

impl Exchange {
    pub fn parse(s: &str) -> Exchange {
        match s.to_ascii_uppercase().as_str() {
            "NSE" => Exchange::Nse,
            "BSE" => Exchange::Bse,
            "NFO" => Exchange::Nfo,
            "BFO" => Exchange::Bfo,
            "CDS" => Exchange::Cds,
            "MCX" => Exchange::Mcx,
            _ => Exchange::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Exchange::Nse => "NSE",
            Exchange::Bse => "BSE",
            Exchange::Nfo => "NFO",
            Exchange::Bfo => "BFO",
            Exchange::Cds => "CDS",
            Exchange::Mcx => "MCX",
            Exchange::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentType {
    Equity,
    Future,
    Option,
    Index,
    Unknown,
}

impl InstrumentType {
    fn parse(s: &str) -> InstrumentType {
        match s.to_ascii_uppercase().as_str() {
            "EQ" => InstrumentType::Equity,
            "FUT" => InstrumentType::Future,
            s if s.starts_with("CE") || s.starts_with("PE") || s == "OPT" => {
                InstrumentType::Option
            }
            "INDEX" => InstrumentType::Index,
            _ => InstrumentType::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstrumentInfo {
    pub token: i32,
    pub exchange_token: i32,
    pub trading_symbol: String,
    pub name: String,
    pub last_price: f64,
    pub expiry: Option<NaiveDate>,
    pub strike: f64,
    pub tick_size: f64,
    pub lot_size: u32,
    pub instrument_type: InstrumentType,
    pub segment: String,
    pub exchange: Exchange,
}

#[derive(Default)]
struct Catalog {
    instruments: Vec<InstrumentInfo>,
    by_token: HashMap<i32, usize>,
    by_symbol: HashMap<(Exchange, String), usize>,
    futures_by_name: HashMap<String, Vec<usize>>,
}

impl Catalog {
    fn build(instruments: Vec<InstrumentInfo>) -> Self {
        let mut catalog = Catalog {
            instruments,
            ..Default::default()
        };
        for (i, info) in catalog.instruments.iter().enumerate() {
            catalog.by_token.insert(info.token, i);
            catalog
                .by_symbol
                .insert((info.exchange, info.trading_symbol.clone()), i);
            if info.instrument_type == InstrumentType::Future
                && info.exchange == Exchange::Nfo
                && !info.name.is_empty()
            {
                catalog
                    .futures_by_name
                    .entry(info.name.clone())
                    .or_default()
                    .push(i);
            }
        }
        catalog
    }
}

#[derive(Debug, Clone)]
pub struct TokenManagerConfig {
    pub catalog_url: String,
    pub api_key: String,
    pub access_token: String,
    pub cache_dir: PathBuf,
    pub ttl: Duration,
    /// Resolve known index symbols to their nearest future contract.
    pub use_futures_for_indices: bool,
    /// Days before expiry at which nearest-future synthesis rolls to the
    /// next month.
    pub rollover_days: u32,
}

impl TokenManagerConfig {
    pub fn new(catalog_url: String, api_key: String, access_token: String, cache_dir: PathBuf) -> Self {
        Self {
            catalog_url,
            api_key,
            access_token,
            cache_dir,
            ttl: DEFAULT_CATALOG_TTL,
            use_futures_for_indices: false,
            rollover_days: 5,
        }
    }
}

/// Thread-safe instrument catalog. A single mutex guards the whole state;
/// lookups are read-mostly and cheap.
pub struct TokenManager {
    cfg: TokenManagerConfig,
    http: reqwest::Client,
    catalog: Mutex<Option<Catalog>>,
}

impl TokenManager {
    pub fn new(cfg: TokenManagerConfig) -> Self {
        Self {
            cfg,
            http: reqwest::Client::new(),
            catalog: Mutex::new(None),
        }
    }

    fn cache_file(&self) -> PathBuf {
        self.cfg.cache_dir.join("instruments.csv")
    }

    /// True when the cached CSV is missing or older than the TTL.
    pub fn refresh_due(&self) -> bool {
        let path = self.cache_file();
        let Ok(meta) = std::fs::metadata(&path) else {
            return true;
        };
        let Ok(mtime) = meta.modified() else {
            return true;
        };
        SystemTime::now()
            .duration_since(mtime)
            .map(|age| age > self.cfg.ttl)
            .unwrap_or(true)
    }

    /// Download (or reuse) the catalog CSV and install the parsed indices.
    pub async fn initialize(&self) -> Result<()> {
        if self.catalog.lock().unwrap().is_some() && !self.refresh_due() {
            return Ok(());
        }
        let csv = self.acquire_csv().await?;
        let instruments = parse_csv(&csv);
        if instruments.is_empty() {
            bail!("instrument catalog parsed to zero instruments");
        }
        info!(count = instruments.len(), "instrument catalog loaded");
        *self.catalog.lock().unwrap() = Some(Catalog::build(instruments));
        Ok(())
    }

    /// Force a re-download; used by the pump's periodic refresh gate.
    pub async fn refresh(&self) -> Result<()> {
        let csv = self.download_csv().await?;
        self.save_cache(&csv)?;
        let instruments = parse_csv(&csv);
        if instruments.is_empty() {
            bail!("refreshed instrument catalog parsed to zero instruments");
        }
        info!(count = instruments.len(), "instrument catalog refreshed");
        *self.catalog.lock().unwrap() = Some(Catalog::build(instruments));
        Ok(())
    }

    async fn acquire_csv(&self) -> Result<String> {
        if self.refresh_due() {
            match self.download_csv().await {
                Ok(csv) => {
                    if let Err(err) = self.save_cache(&csv) {
                        warn!(error = %err, "failed to save instrument cache");
                    }
                    return Ok(csv);
                }
                Err(err) => {
                    warn!(error = %err, "catalog download failed, falling back to cache");
                }
            }
        }
        self.load_cache()
    }

    async fn download_csv(&self) -> Result<String> {
        let auth = format!("token {}:{}", self.cfg.api_key, self.cfg.access_token);
        let resp = self
            .http
            .get(&self.cfg.catalog_url)
            .header("X-Kestrel-Version", "3")
            .header("Authorization", auth)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .context("catalog request failed")?
            .error_for_status()
            .context("catalog request returned error status")?;
        let body = resp.text().await.context("reading catalog body")?;
        debug!(bytes = body.len(), "downloaded instrument catalog");
        Ok(body)
    }

    fn save_cache(&self, csv: &str) -> Result<()> {
        std::fs::create_dir_all(&self.cfg.cache_dir)
            .with_context(|| format!("creating {}", self.cfg.cache_dir.display()))?;
        std::fs::write(self.cache_file(), csv)
            .with_context(|| format!("writing {}", self.cache_file().display()))?;
        Ok(())
    }

    fn load_cache(&self) -> Result<String> {
        std::fs::read_to_string(self.cache_file())
            .with_context(|| format!("reading {}", self.cache_file().display()))
    }

    /// Resolve an `EXCHANGE:SYMBOL` string to an instrument token.
    ///
    /// Known NSE index symbols resolve to the nearest non-expired future
    /// when `use_futures_for_indices` is set.
    pub fn token_for(&self, symbol: &str) -> Option<i32> {
        self.token_for_at(symbol, Utc::now().date_naive())
    }

    pub fn token_for_at(&self, symbol: &str, today: NaiveDate) -> Option<i32> {
        let (exchange, name) = parse_symbol(symbol);
        if exchange == Exchange::Nse && self.cfg.use_futures_for_indices {
            if let Some(underlying) = index_underlying(&name) {
                return self.nearest_future_token_at(underlying, today);
            }
        }
        let guard = self.catalog.lock().unwrap();
        let catalog = guard.as_ref()?;
        catalog
            .by_symbol
            .get(&(exchange, name))
            .map(|&i| catalog.instruments[i].token)
    }

    /// Nearest non-expired future for an underlying name. When the catalog
    /// has no match, synthesize the canonical monthly symbol and retry.
    pub fn nearest_future_token(&self, underlying: &str) -> Option<i32> {
        self.nearest_future_token_at(underlying, Utc::now().date_naive())
    }

    pub fn nearest_future_token_at(&self, underlying: &str, today: NaiveDate) -> Option<i32> {
        let guard = self.catalog.lock().unwrap();
        let catalog = guard.as_ref()?;

        let mut nearest: Option<(NaiveDate, usize)> = None;
        if let Some(indices) = catalog.futures_by_name.get(underlying) {
            for &i in indices {
                let Some(expiry) = catalog.instruments[i].expiry else {
                    continue;
                };
                if expiry <= today {
                    continue;
                }
                if nearest.map(|(best, _)| expiry < best).unwrap_or(true) {
                    nearest = Some((expiry, i));
                }
            }
        }
        if let Some((expiry, i)) = nearest {
            let info = &catalog.instruments[i];
            debug!(
                underlying,
                token = info.token,
                symbol = %info.trading_symbol,
                %expiry,
                "resolved nearest future"
            );
            return Some(info.token);
        }

        // No listed contract: synthesize the canonical monthly symbol and
        // retry the symbol index.
        let expiry = monthly_expiry(today, self.cfg.rollover_days);
        let symbol = future_symbol(underlying, expiry);
        warn!(underlying, symbol = %symbol, "no listed future, trying synthesized symbol");
        catalog
            .by_symbol
            .get(&(Exchange::Nfo, symbol))
            .map(|&i| catalog.instruments[i].token)
    }

    /// Reverse lookup.
    pub fn info_for(&self, token: i32) -> Option<InstrumentInfo> {
        let guard = self.catalog.lock().unwrap();
        let catalog = guard.as_ref()?;
        catalog
            .by_token
            .get(&token)
            .map(|&i| catalog.instruments[i].clone())
    }

    /// Whether a token belongs to an index. The catalog segment is the
    /// authoritative test; the numeric range is only a fallback for tokens
    /// the catalog does not know.
    pub fn is_index_token(&self, token: i32) -> bool {
        let guard = self.catalog.lock().unwrap();
        if let Some(catalog) = guard.as_ref() {
            if let Some(&i) = catalog.by_token.get(&token) {
                return catalog.instruments[i].segment.eq_ignore_ascii_case("INDICES");
            }
        }
        (100_000..=300_000).contains(&token)
    }

    pub fn lot_size_for(&self, token: i32) -> Option<u32> {
        self.info_for(token).map(|info| info.lot_size)
    }

    #[cfg(test)]
    pub(crate) fn install_csv(&self, csv: &str) {
        *self.catalog.lock().unwrap() = Some(Catalog::build(parse_csv(csv)));
    }
}

/// Split `EXCHANGE:SYMBOL`; a bare symbol defaults to NSE.
pub fn parse_symbol(full: &str) -> (Exchange, String) {
    match full.split_once(':') {
        Some((exchange, symbol)) => (Exchange::parse(exchange), symbol.to_string()),
        None => (Exchange::Nse, full.to_string()),
    }
}

/// Map the spellings of the well-known NSE index symbols onto the
/// underlying name used by futures contracts.
fn index_underlying(symbol: &str) -> Option<&'static str> {
    let cleaned: String = symbol.chars().filter(|c| !c.is_whitespace()).collect();
    match cleaned.to_ascii_uppercase().as_str() {
        "NIFTY" | "NIFTY50" => Some("NIFTY"),
        "BANKNIFTY" => Some("BANKNIFTY"),
        "FINNIFTY" => Some("FINNIFTY"),
        _ => None,
    }
}

fn parse_csv(csv: &str) -> Vec<InstrumentInfo> {
    let mut out = Vec::new();
    let mut lines = csv.lines();
    // Header line.
    if lines.next().is_none() {
        return out;
    }
    let mut skipped = 0usize;
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        match parse_csv_line(line) {
            Some(info) => out.push(info),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(skipped, "skipped malformed catalog lines");
    }
    out
}

// Columns: instrument_token, exchange_token, tradingsymbol, name, last_price,
// expiry, strike, tick_size, lot_size, instrument_type, segment, exchange.
fn parse_csv_line(line: &str) -> Option<InstrumentInfo> {
    let fields = split_csv_line(line);
    if fields.len() < 12 {
        return None;
    }
    Some(InstrumentInfo {
        token: fields[0].parse().ok()?,
        exchange_token: fields[1].parse().unwrap_or(0),
        trading_symbol: fields[2].clone(),
        name: fields[3].clone(),
        last_price: fields[4].parse().unwrap_or(0.0),
        expiry: NaiveDate::parse_from_str(&fields[5], "%Y-%m-%d").ok(),
        strike: fields[6].parse().unwrap_or(0.0),
        tick_size: fields[7].parse().unwrap_or(0.0),
        lot_size: fields[8].parse().unwrap_or(1),
        instrument_type: InstrumentType::parse(&fields[9]),
        segment: fields[10].clone(),
        exchange: Exchange::parse(&fields[11]),
    })
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut field).trim().to_string()),
            _ => field.push(c),
        }
    }
    fields.push(field.trim().to_string());
    fields
}

/// Monthly contracts expire on the last Thursday of the month. Within
/// `rollover_days` of that date, the synthesized symbol moves to the next
/// month.
pub fn monthly_expiry(today: NaiveDate, rollover_days: u32) -> NaiveDate {
    let mut expiry = last_thursday(today.year(), today.month());
    let roll_from = expiry - chrono::Duration::days(rollover_days as i64);
    if today >= roll_from {
        let (year, month) = if today.month() == 12 {
            (today.year() + 1, 1)
        } else {
            (today.year(), today.month() + 1)
        };
        expiry = last_thursday(year, month);
    }
    expiry
}

fn last_thursday(year: i32, month: u32) -> NaiveDate {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let mut day = NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("valid first-of-month")
        - chrono::Duration::days(1);
    while day.weekday() != Weekday::Thu {
        day -= chrono::Duration::days(1);
    }
    day
}

/// Canonical monthly future symbol: `<UNDERLYING><YY><MON>FUT`.
pub fn future_symbol(underlying: &str, expiry: NaiveDate) -> String {
    format!(
        "{}{:02}{}FUT",
        underlying,
        expiry.year() % 100,
        MONTHS[expiry.month0() as usize]
    )
}
