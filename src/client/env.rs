//! Well-known deployments of the oracle program.

use {
    anyhow::{
        Context,
        Result,
    },
    serde::{
        Deserialize,
        Serialize,
    },
    solana_sdk::pubkey::Pubkey,
    std::str::FromStr,
};

/// Program and root mapping account of one deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Env {
    pub program: Pubkey,
    pub mapping: Pubkey,
}

impl Env {
    pub const DEVNET: Env = Env {
        program: Pubkey::from_str_const("gSbePebfvPy7tRqimPoVecS2UsBvYv46ynrzWocc92s"),
        mapping: Pubkey::from_str_const("BmA9Z6FjioHJPpjT39QazZyhDRUdZy2ezwx4GiDdE2u2"),
    };
    pub const TESTNET: Env = Env {
        program: Pubkey::from_str_const("8tfDNiaEyrV6Q1U4DEXrEigs9DoDtkugzFbybENEbCDz"),
        mapping: Pubkey::from_str_const("AFmdnt9ng1uVxqCmqwQJDAYC5cKTkw8gJKSM5PnzuF6z"),
    };
    pub const MAINNET: Env = Env {
        program: Pubkey::from_str_const("FsJ3A3u2vn5cTVofAjvy6y5kwABJAqYWpe4975bi2epH"),
        mapping: Pubkey::from_str_const("AHtgzX45WTKfkPG53L6WYhGEXwQkN1BVknET3sVsLL8J"),
    };
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Devnet,
    Testnet,
    Mainnet,
}

impl Network {
    pub fn env(self) -> Env {
        match self {
            Network::Devnet => Env::DEVNET,
            Network::Testnet => Env::TESTNET,
            Network::Mainnet => Env::MAINNET,
        }
    }

    /// Public RPC endpoint of the cluster the deployment lives on.
    pub fn rpc_url(self) -> &'static str {
        match self {
            Network::Devnet => "https://api.devnet.solana.com",
            Network::Testnet => "https://api.testnet.solana.com",
            Network::Mainnet => "https://api.mainnet-beta.solana.com",
        }
    }

    pub fn wss_url(self) -> &'static str {
        match self {
            Network::Devnet => "wss://api.devnet.solana.com",
            Network::Testnet => "wss://api.testnet.solana.com",
            Network::Mainnet => "wss://api.mainnet-beta.solana.com",
        }
    }
}

/// Selects a deployment by network, optionally overriding either key.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub network:     Network,
    /// Base58 address of the oracle program.
    pub program_key: Option<String>,
    /// Base58 address of the root mapping account.
    pub mapping_key: Option<String>,
}

impl Config {
    pub fn resolve(&self) -> Result<Env> {
        let mut env = self.network.env();
        if let Some(program_key) = &self.program_key {
            env.program = Pubkey::from_str(program_key).context("parsing program key")?;
        }
        if let Some(mapping_key) = &self.mapping_key {
            env.mapping = Pubkey::from_str(mapping_key).context("parsing mapping key")?;
        }
        Ok(env)
    }
}
