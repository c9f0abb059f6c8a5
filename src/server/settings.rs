use config::{Config, ConfigError, File};
use serde::Deserialize;

use std::fmt;

// For explanation, see issue: https://github.com/serde-rs/serde/issues/368
fn default_network() -> String {
    "dev".to_string()
}
fn default_db_path() -> String {
    "tundra.sled".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    /// Realtime listener; the bootstrap listener binds one port above.
    pub listener_ip: String,
    pub bootstrap_peers: Vec<String>,
    /// Seed phrase of the node's voting key; absent on non-voting nodes.
    pub voting_seed: Option<String>,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

const CONFIG_FILE_PATH: &str = "config/Default.json";
const CONFIG_FILE_PREFIX: &str = "config/";

#[derive(Clone, Debug, Deserialize)]
pub enum ENV {
    Testing,
    Development,
    Production,
}

impl fmt::Display for ENV {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ENV::Testing => write!(f, "Testing"),
            ENV::Production => write!(f, "Production"),
            ENV::Development => write!(f, "Development"),
        }
    }
}

impl From<&str> for ENV {
    fn from(env: &str) -> Self {
        match env {
            "Testing" => ENV::Testing,
            "Production" => ENV::Production,
            _ => ENV::Development,
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let env = std::env::var("RUN_ENV").unwrap_or_else(|_| "Development".into());
        Config::builder()
            .set_default("env", env.clone())?
            .add_source(File::with_name(CONFIG_FILE_PATH))
            .add_source(File::with_name(&format!("{}{}", CONFIG_FILE_PREFIX, env)).required(false))
            .build()?
            .try_deserialize()
    }
}
