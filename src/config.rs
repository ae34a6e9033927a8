//! Runtime settings: optional config file, then `LOBGRID__*` environment
//! variables, then command-line flags, each layer overriding the previous.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use itertools::Itertools;
use serde::Deserialize;

use crate::engine::grid::DEFAULT_PRICE_STEP;
use crate::engine::types::InstrumentRef;
use crate::market_data::adapters::tinvest::DEFAULT_ENDPOINT;
use crate::market_data::router::{
    MuxConfig, ReconnectPolicy, DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_MAX, DEFAULT_DEPTH, DEFAULT_KEEPALIVE,
};
use crate::market_data::throttle::DEFAULT_FLUSH_INTERVAL;

pub const ENV_PREFIX: &str = "LOBGRID";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Supplies price step and lot size for an instrument id.
pub trait InstrumentCatalog {
    fn lookup(&self, id: &str) -> Option<InstrumentRef>;
}

#[derive(Parser, Debug, Clone)]
#[command(name = "lobgrid")]
#[command(about = "Streams T-Invest order books and renders them as fixed-step price grids")]
pub struct Cli {
    /// Config file (toml, yaml or json)
    #[arg(short, long, env = "LOBGRID_CONFIG")]
    pub config: Option<PathBuf>,

    /// API token
    #[arg(long, env = "TINVEST_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Instrument as ID[:STEP[:LOT]], repeatable
    #[arg(short, long = "instrument", value_parser = parse_instrument)]
    pub instruments: Vec<InstrumentSettings>,

    /// Order book depth requested from the server
    #[arg(long)]
    pub depth: Option<u32>,

    /// Consumer flush interval in milliseconds
    #[arg(long)]
    pub flush_ms: Option<u64>,

    /// Keep-alive interval in milliseconds
    #[arg(long)]
    pub keepalive_ms: Option<u64>,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    pub metrics_port: Option<u16>,

    /// Stay idle after a stream failure instead of reconnecting
    #[arg(long)]
    pub no_reconnect: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InstrumentSettings {
    pub id: String,
    #[serde(default = "default_price_step")]
    pub price_step: f64,
    #[serde(default = "default_lot_size")]
    pub lot_size: u64,
}

impl From<&InstrumentSettings> for InstrumentRef {
    fn from(s: &InstrumentSettings) -> Self {
        InstrumentRef::new(s.id.clone(), s.price_step, s.lot_size)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub enabled: bool,
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_ms: DEFAULT_BACKOFF_INITIAL.as_millis() as u64,
            max_ms: DEFAULT_BACKOFF_MAX.as_millis() as u64,
        }
    }
}

#[derive(Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub token: Option<String>,
    pub endpoint: String,
    pub depth: u32,
    pub flush_ms: u64,
    pub keepalive_ms: u64,
    pub connect_timeout_ms: u64,
    pub metrics_port: Option<u16>,
    pub reconnect: ReconnectSettings,
    pub instruments: Vec<InstrumentSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            token: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            depth: DEFAULT_DEPTH,
            flush_ms: DEFAULT_FLUSH_INTERVAL.as_millis() as u64,
            keepalive_ms: DEFAULT_KEEPALIVE.as_millis() as u64,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            metrics_port: None,
            reconnect: ReconnectSettings::default(),
            instruments: Vec::new(),
        }
    }
}

// Keep the token out of logs.
impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("endpoint", &self.endpoint)
            .field("depth", &self.depth)
            .field("flush_ms", &self.flush_ms)
            .field("keepalive_ms", &self.keepalive_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("metrics_port", &self.metrics_port)
            .field("reconnect", &self.reconnect)
            .field("instruments", &self.instruments)
            .finish()
    }
}

impl Settings {
    /// File and environment layers, then CLI overrides, then validation.
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = &cli.config {
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }
        let layered: Settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .context("reading configuration")?
            .try_deserialize()
            .context("invalid configuration")?;

        let settings = layered.with_cli(cli);
        settings.validate()?;
        Ok(settings)
    }

    pub fn with_cli(mut self, cli: &Cli) -> Self {
        if let Some(token) = &cli.token {
            self.token = Some(token.clone());
        }
        if !cli.instruments.is_empty() {
            self.instruments = cli.instruments.clone();
        }
        if let Some(depth) = cli.depth {
            self.depth = depth;
        }
        if let Some(flush_ms) = cli.flush_ms {
            self.flush_ms = flush_ms;
        }
        if let Some(keepalive_ms) = cli.keepalive_ms {
            self.keepalive_ms = keepalive_ms;
        }
        if cli.metrics_port.is_some() {
            self.metrics_port = cli.metrics_port;
        }
        if cli.no_reconnect {
            self.reconnect.enabled = false;
        }
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.token.as_deref().map_or(true, |t| t.trim().is_empty()) {
            bail!("no API token: pass --token or set TINVEST_TOKEN");
        }
        if self.instruments.is_empty() {
            bail!("no instruments configured: pass --instrument ID[:STEP[:LOT]]");
        }
        if self.depth == 0 {
            bail!("depth must be positive");
        }
        if self.flush_ms == 0 || self.keepalive_ms == 0 {
            bail!("flush and keep-alive intervals must be positive");
        }
        Ok(())
    }

    /// Token after [`Settings::validate`]; empty string otherwise.
    pub fn token(&self) -> &str {
        self.token.as_deref().unwrap_or_default()
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn mux_config(&self) -> MuxConfig {
        let reconnect = if self.reconnect.enabled {
            ReconnectPolicy::Backoff {
                initial: Duration::from_millis(self.reconnect.initial_ms),
                max: Duration::from_millis(self.reconnect.max_ms.max(self.reconnect.initial_ms)),
            }
        } else {
            ReconnectPolicy::Disabled
        };
        MuxConfig {
            depth: self.depth,
            keepalive: Duration::from_millis(self.keepalive_ms),
            reconnect,
        }
    }

    /// Configured ids in declaration order, duplicates dropped.
    pub fn instrument_ids(&self) -> Vec<String> {
        self.instruments.iter().map(|i| i.id.clone()).unique().collect()
    }
}

impl InstrumentCatalog for Settings {
    fn lookup(&self, id: &str) -> Option<InstrumentRef> {
        self.instruments.iter().find(|i| i.id == id).map(InstrumentRef::from)
    }
}

fn default_price_step() -> f64 {
    DEFAULT_PRICE_STEP
}

fn default_lot_size() -> u64 {
    1
}

/// `ID[:STEP[:LOT]]`, e.g. `BBG004730N88:0.01:10`.
pub fn parse_instrument(raw: &str) -> Result<InstrumentSettings, String> {
    let mut parts = raw.trim().splitn(3, ':');
    let id = parts.next().unwrap_or_default().trim();
    if id.is_empty() {
        return Err("instrument id is empty".into());
    }
    let price_step = match parts.next() {
        Some(step) => step
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|s| s.is_finite() && *s > 0.0)
            .ok_or_else(|| format!("invalid price step {step:?}"))?,
        None => DEFAULT_PRICE_STEP,
    };
    let lot_size = match parts.next() {
        Some(lot) => lot.trim().parse::<u64>().map_err(|e| format!("invalid lot size {lot:?}: {e}"))?,
        None => default_lot_size(),
    };
    Ok(InstrumentSettings { id: id.to_string(), price_step, lot_size })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("lobgrid").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_parse_instrument_forms() {
        assert_eq!(
            parse_instrument("BBG004730N88:0.01:10").unwrap(),
            InstrumentSettings { id: "BBG004730N88".into(), price_step: 0.01, lot_size: 10 }
        );
        let bare = parse_instrument("SBER").unwrap();
        assert_eq!((bare.price_step, bare.lot_size), (DEFAULT_PRICE_STEP, 1));
        assert_eq!(parse_instrument("X:0.5").unwrap().lot_size, 1);
    }

    #[test]
    fn test_parse_instrument_rejects_garbage() {
        assert!(parse_instrument("").is_err());
        assert!(parse_instrument(":0.01:1").is_err());
        assert!(parse_instrument("X:abc").is_err());
        assert!(parse_instrument("X:-0.01").is_err());
        assert!(parse_instrument("X:0.01:-1").is_err());
    }

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.depth, 50);
        assert_eq!(s.flush_interval(), Duration::from_millis(50));
        assert_eq!(s.mux_config().keepalive, Duration::from_millis(100));
        assert_eq!(s.connect_timeout(), Duration::from_secs(10));
        assert_eq!(
            s.mux_config().reconnect,
            ReconnectPolicy::Backoff { initial: Duration::from_millis(500), max: Duration::from_secs(30) }
        );
    }

    #[test]
    fn test_cli_overrides() {
        let cli = cli(&[
            "--token", "t0k3n",
            "-i", "A:0.5:2",
            "--instrument", "B",
            "--depth", "20",
            "--flush-ms", "100",
            "--no-reconnect",
        ]);
        let s = Settings::default().with_cli(&cli);
        assert_eq!(s.token(), "t0k3n");
        assert_eq!(s.instruments.len(), 2);
        assert_eq!(s.depth, 20);
        assert_eq!(s.flush_interval(), Duration::from_millis(100));
        assert_eq!(s.mux_config().reconnect, ReconnectPolicy::Disabled);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_token_and_instruments() {
        let mut s = Settings::default();
        assert!(s.validate().is_err());
        s.token = Some("t".into());
        assert!(s.validate().is_err());
        s.instruments.push(parse_instrument("A").unwrap());
        assert!(s.validate().is_ok());
        s.token = Some("  ".into());
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_catalog_lookup() {
        let s = Settings::default().with_cli(&cli(&["-i", "A:0.25:3"]));
        assert_eq!(s.lookup("A"), Some(InstrumentRef::new("A", 0.25, 3)));
        assert_eq!(s.lookup("B"), None);
    }

    #[test]
    fn test_every_configured_id_resolves() {
        let s = Settings::default().with_cli(&cli(&["-i", "A:0.25:3", "-i", "B", "-i", "A:0.5:1"]));
        assert_eq!(s.instrument_ids(), vec!["A".to_string(), "B".to_string()]);
        // First declaration wins.
        assert_eq!(s.lookup("A").map(|i| i.price_step), Some(0.25));
        assert!(s.instrument_ids().iter().all(|id| s.lookup(id).is_some()));
    }

    #[test]
    fn test_debug_redacts_token() {
        let s = Settings { token: Some("secret".into()), ..Settings::default() };
        let printed = format!("{s:?}");
        assert!(!printed.contains("secret"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_deserialize_partial_file() {
        let s: Settings = serde_json::from_str(
            r#"{"depth": 10, "instruments": [{"id": "A", "lot_size": 5}], "reconnect": {"enabled": false}}"#,
        )
        .unwrap();
        assert_eq!(s.depth, 10);
        assert_eq!(s.instruments[0].price_step, DEFAULT_PRICE_STEP);
        assert_eq!(s.mux_config().reconnect, ReconnectPolicy::Disabled);
        assert_eq!(s.flush_ms, 50);
    }
}
