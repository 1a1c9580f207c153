use {
    super::{
        env,
        query,
        stream,
    },
    anyhow::Result,
    config as config_rs,
    config_rs::{
        Environment,
        File,
    },
    serde::{
        Deserialize,
        Serialize,
    },
    solana_sdk::commitment_config::CommitmentLevel,
    std::{
        path::Path,
        time::Duration,
    },
};

/// Configuration for all components of the client
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub rpc:    RpcConfig,
    pub env:    env::Config,
    pub query:  query::Config,
    pub stream: stream::Config,
}

impl Config {
    /// Layers the optional `config_file` and "PYTH_"-prefixed environment
    /// variables over the defaults. Nested keys are separated by a double
    /// underscore, e.g. `PYTH_STREAM__READ_TIMEOUT`.
    pub fn new(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = config_rs::Config::builder();
        if let Some(config_file) = config_file {
            builder = builder.add_source(File::from(config_file));
        }
        builder
            .add_source(
                Environment::with_prefix("pyth")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
            .map_err(|e| e.into())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RpcConfig {
    /// HTTP endpoint used for account lookups. Defaults to the public
    /// endpoint of the configured network.
    pub rpc_url:     Option<String>,
    /// WebSocket endpoint used for subscriptions. Defaults to the public
    /// endpoint of the configured network.
    pub wss_url:     Option<String>,
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
    /// Commitment of account lookups.
    pub commitment:  CommitmentLevel,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            rpc_url:     None,
            wss_url:     None,
            rpc_timeout: Duration::from_secs(10),
            commitment:  CommitmentLevel::Confirmed,
        }
    }
}
