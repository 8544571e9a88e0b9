use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use indexmap::IndexMap;
use log::info;
use serde::Deserialize;
use toml;
use crate::error::{Error, Result};

/// Name of the dialer used when a line has no explicit configuration.
pub const DEFAULT_DIALER: &str = "default";

/// Name of the line configuration applied to unlisted serials.
pub const DEFAULT_LINE: &str = "default";

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct HidphoneConfig {
    /// Shared secret required from control-channel clients.
    pub secret: String,

    /// Address the control server listens on.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Enables debug logging.
    #[serde(default)]
    pub debug: bool,

    /// FSK modem configuration for Caller-ID.
    #[serde(default)]
    pub modem: ModemConfig,

    /// Named dialers. A line starts on its configured dialer when taken off-hook.
    #[serde(default)]
    pub dialers: IndexMap<String, DialerConfig>,

    /// Per-line configuration keyed by device serial, with a `default` fallback.
    #[serde(default)]
    pub lines: HashMap<String, LineConfig>,

    /// Network client types and how their connections are grouped.
    #[serde(default)]
    pub clients: HashMap<String, ClientConfig>,

    /// Local sound-file players, registered as clients under their key.
    #[serde(default)]
    pub players: HashMap<String, PlayerConfig>,
}

fn default_listen() -> String {
    String::from("127.0.0.1:5840")
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case", default)]
pub struct ModemConfig {
    /// Path or name of the FSK modulator executable.
    pub executable: PathBuf,
    /// Optional recording of the channel seizure signal. Synthesized if absent.
    pub seizure_wav: Option<PathBuf>,
    /// Optional recording of the mark carrier. Synthesized if absent.
    pub carrier_wav: Option<PathBuf>,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from(if cfg!(windows) { "minimodem.exe" } else { "minimodem" }),
            seizure_wav: None,
            carrier_wav: None,
        }
    }
}

/// Raw dialer table entry, validated when first used.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub struct DialerConfig {
    /// Frequencies (Hz) of the tone played while this dialer waits for digits.
    #[serde(default)]
    pub dial_tone: Vec<f32>,

    /// Client that receives dialed numbers.
    pub client: Option<String>,

    /// `"phone"` to validate with the phone number library, otherwise a regular expression.
    pub client_number_format: Option<String>,

    /// Region used when `client_number_format` is `"phone"`, e.g. `"US"`.
    pub client_number_region: Option<String>,

    /// Static digit map: dialed digits → `[client, number]`.
    pub map: Option<IndexMap<String, [String; 2]>>,
}

#[derive(Deserialize, Copy, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CallerIdPolicy {
    #[default]
    Off,
    BeforeFirstRing,
    AfterFirstRing,
}

#[derive(Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RingListType {
    Whitelist,
    Blacklist,
}

/// `[client]` or `[client, number]`. An empty number matches every number.
#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(from = "Vec<String>")]
pub struct RingListEntry {
    pub client: String,
    pub number: String,
}

impl From<Vec<String>> for RingListEntry {
    fn from(parts: Vec<String>) -> Self {
        let mut parts = parts.into_iter();
        Self {
            client: parts.next().unwrap_or_default(),
            number: parts.next().unwrap_or_default(),
        }
    }
}

impl RingListEntry {
    pub fn matches(&self, client: &str, number: &str) -> bool {
        self.client == client && (self.number.is_empty() || self.number == number)
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct LineConfig {
    /// Dialer selected when the handset is lifted.
    #[serde(default = "default_dialer")]
    pub dialer: String,

    /// When to announce Caller-ID relative to the first ring.
    #[serde(default)]
    pub caller_id: CallerIdPolicy,

    /// How `ring_list` is interpreted. Without a list type every offer rings.
    pub ring_list_type: Option<RingListType>,

    #[serde(default)]
    pub ring_list: Vec<RingListEntry>,
}

fn default_dialer() -> String {
    String::from(DEFAULT_DIALER)
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            dialer: default_dialer(),
            caller_id: CallerIdPolicy::Off,
            ring_list_type: None,
            ring_list: Vec::new(),
        }
    }
}

impl LineConfig {
    /// Admission policy for inbound offers.
    pub fn admits(&self, client: &str, number: &str) -> bool {
        let listed = || self.ring_list.iter().any(|entry| entry.matches(client, number));
        match self.ring_list_type {
            Some(RingListType::Whitelist) => listed(),
            Some(RingListType::Blacklist) => !listed(),
            None => true,
        }
    }
}

#[derive(Deserialize, Copy, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ClientMode {
    /// One connection; a reconnect replaces it.
    #[default]
    Single,
    /// Any number of connections pooled under one client type.
    Pool,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub struct ClientConfig {
    #[serde(default)]
    pub mode: ClientMode,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct PlayerConfig {
    /// Directory holding `<number>.wav` files.
    pub directory: PathBuf,
}

impl HidphoneConfig {
    pub fn parse(src: &str) -> Result<Self> {
        toml::from_str(src).map_err(|err| Error::ConfigLoad(err.to_string()))
    }

    /// Configuration for the line with the given serial, falling back to `[lines.default]`.
    pub fn line(&self, serial: &str) -> LineConfig {
        self.lines.get(serial)
            .or_else(|| self.lines.get(DEFAULT_LINE))
            .cloned()
            .unwrap_or_default()
    }

    pub fn client_mode(&self, client: &str) -> ClientMode {
        self.clients.get(client).map(|c| c.mode).unwrap_or_default()
    }
}

/// Loads the config file, seeding it from the example config on first run.
pub fn load_config(path: &Path, example_path: &Path) -> Result<HidphoneConfig> {
    let config_str = match fs::read_to_string(path) {
        Ok(src) => src,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            info!("No config at {}; copying {}", path.display(), example_path.display());
            let src = fs::read_to_string(example_path)
                .map_err(|err| Error::ConfigLoad(format!("{}: {}", example_path.display(), err)))?;
            fs::write(path, &src).map_err(|err| Error::ConfigLoad(format!("{}: {}", path.display(), err)))?;
            src
        },
        Err(err) => return Err(Error::ConfigLoad(format!("{}: {}", path.display(), err)))
    };
    HidphoneConfig::parse(&config_str)
}
