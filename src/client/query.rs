//! Bulk retrieval of oracle accounts.
//!
//! Products are listed by walking the linked list of mapping accounts from the
//! root mapping key. Price accounts of a product form another linked list,
//! starting at the product's first price. Both walks tolerate cycles in
//! on-chain data: the mapping walk is capped at a configurable number of hops
//! and the price walk never fetches the same key twice.

use {
    super::accounts::{
        AccountError,
        MappingAccount,
        PriceAccount,
        ProductAccount,
    },
    anyhow::Result,
    serde::{
        Deserialize,
        Serialize,
    },
    solana_sdk::{
        commitment_config::CommitmentConfig,
        pubkey::Pubkey,
    },
    std::{
        collections::{
            HashSet,
            VecDeque,
        },
        sync::Arc,
    },
    tracing::instrument,
};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Ask the RPC for up to this many accounts in a single request. Batches
    /// are requested sequentially.
    pub max_lookup_batch_size: usize,
    /// Maximum number of mapping accounts followed before the walk stops.
    pub max_mapping_accounts:  usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_lookup_batch_size: 100,
            max_mapping_accounts:  128,
        }
    }
}

/// Raw account data returned by a single batched lookup.
#[derive(Clone, Debug, Default)]
pub struct FetchedAccounts {
    /// Slot at which the accounts were read.
    pub slot:     u64,
    /// One entry per requested key, `None` if the account does not exist.
    pub accounts: Vec<Option<Vec<u8>>>,
}

/// Reads the raw data of many accounts in a single request.
#[async_trait::async_trait]
pub trait AccountFetcher: Send + Sync {
    async fn fetch_accounts(
        &self,
        keys: &[Pubkey],
        commitment: CommitmentConfig,
    ) -> Result<FetchedAccounts>;
}

/// A decoded account together with its address and the slot it was read at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountEntry<T> {
    pub key:     Pubkey,
    pub slot:    u64,
    pub account: T,
}

pub type MappingAccountEntry = AccountEntry<MappingAccount>;
pub type ProductAccountEntry = AccountEntry<ProductAccount>;
pub type PriceAccountEntry = AccountEntry<PriceAccount>;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("failed to fetch {keys} accounts: {error:#}")]
    Fetch { keys: usize, error: anyhow::Error },
    #[error(
        "unexpected number of accounts in batch starting at {first_key}, asked for {requested} but got {received}"
    )]
    CountMismatch {
        first_key: Pubkey,
        requested: usize,
        received:  usize,
    },
    #[error("account {key} not found")]
    AccountNotFound { key: Pubkey },
    #[error("failed to decode account {key}: {error}")]
    Decode {
        key:   Pubkey,
        #[source]
        error: AccountError,
    },
    #[error("error getting mapping account {key} (#{hop}): {error}")]
    Mapping {
        key:   Pubkey,
        hop:   usize,
        #[source]
        error: Box<QueryError>,
    },
}

/// A bulk query that stopped early. Accounts retrieved before the failure are
/// kept so callers can tell the result set is incomplete.
#[derive(Debug, thiserror::Error)]
#[error("{error} ({} accounts retrieved)", .accounts.len())]
pub struct Incomplete<T> {
    pub accounts: Vec<T>,
    #[source]
    pub error:    QueryError,
}

impl<T> Incomplete<T> {
    fn new(accounts: Vec<T>, error: QueryError) -> Self {
        Self { accounts, error }
    }
}

/// Queries the accounts of one oracle deployment.
#[derive(Clone)]
pub struct AccountQuery {
    fetcher:     Arc<dyn AccountFetcher>,
    mapping_key: Pubkey,
    config:      Config,
}

impl AccountQuery {
    pub fn new(fetcher: Arc<dyn AccountFetcher>, mapping_key: Pubkey, config: Config) -> Self {
        Self {
            fetcher,
            mapping_key,
            config,
        }
    }

    pub fn mapping_key(&self) -> Pubkey {
        self.mapping_key
    }

    pub async fn get_mapping_account(
        &self,
        key: Pubkey,
        commitment: CommitmentConfig,
    ) -> Result<MappingAccountEntry, QueryError> {
        self.get_account(key, commitment, MappingAccount::decode).await
    }

    pub async fn get_product_account(
        &self,
        key: Pubkey,
        commitment: CommitmentConfig,
    ) -> Result<ProductAccountEntry, QueryError> {
        self.get_account(key, commitment, ProductAccount::decode).await
    }

    pub async fn get_price_account(
        &self,
        key: Pubkey,
        commitment: CommitmentConfig,
    ) -> Result<PriceAccountEntry, QueryError> {
        self.get_account(key, commitment, PriceAccount::decode).await
    }

    /// Lists the product keys of every mapping account reachable from the root.
    #[instrument(skip(self), fields(mapping_key = %self.mapping_key))]
    pub async fn get_all_product_keys(
        &self,
        commitment: CommitmentConfig,
    ) -> Result<Vec<Pubkey>, Incomplete<Pubkey>> {
        let mut products = vec![];
        let mut next = self.mapping_key;

        for hop in 1..=self.config.max_mapping_accounts {
            if next == Pubkey::default() {
                return Ok(products);
            }
            let mapping = self
                .get_mapping_account(next, commitment)
                .await
                .map_err(|error| {
                    Incomplete::new(
                        products.clone(),
                        QueryError::Mapping {
                            key: next,
                            hop,
                            error: Box::new(error),
                        },
                    )
                })?;
            products.extend_from_slice(mapping.account.product_keys());
            next = mapping.account.next;
        }

        if next != Pubkey::default() {
            tracing::warn!(
                max_mapping_accounts = self.config.max_mapping_accounts,
                next = %next,
                "Mapping account list exceeds the hop limit, stopping.",
            );
        }
        Ok(products)
    }

    /// Fetches every product account listed in the mapping accounts.
    #[instrument(skip(self))]
    pub async fn get_all_product_accounts(
        &self,
        commitment: CommitmentConfig,
    ) -> Result<Vec<ProductAccountEntry>, Incomplete<ProductAccountEntry>> {
        let keys = self
            .get_all_product_keys(commitment)
            .await
            .map_err(|incomplete| Incomplete::new(vec![], incomplete.error))?;

        let mut accounts = Vec::with_capacity(keys.len());
        for batch in keys.chunks(self.batch_size()) {
            if let Err(error) = self
                .fetch_batch(batch, commitment, ProductAccount::decode, &mut accounts)
                .await
            {
                return Err(Incomplete::new(accounts, error));
            }
        }
        Ok(accounts)
    }

    /// Fetches every price account of every product.
    #[instrument(skip(self))]
    pub async fn get_all_price_accounts(
        &self,
        commitment: CommitmentConfig,
    ) -> Result<Vec<PriceAccountEntry>, Incomplete<PriceAccountEntry>> {
        let products = self
            .get_all_product_accounts(commitment)
            .await
            .map_err(|incomplete| Incomplete::new(vec![], incomplete.error))?;

        let first_prices = products
            .iter()
            .map(|product| product.account.first_price)
            .filter(|key| *key != Pubkey::default())
            .collect::<Vec<_>>();
        self.get_price_accounts_recursive(&first_prices, commitment)
            .await
    }

    /// Fetches the given price accounts and every price account reachable
    /// through their `next` links. Each key is fetched at most once.
    #[instrument(skip(self, keys), fields(keys = keys.len()))]
    pub async fn get_price_accounts_recursive(
        &self,
        keys: &[Pubkey],
        commitment: CommitmentConfig,
    ) -> Result<Vec<PriceAccountEntry>, Incomplete<PriceAccountEntry>> {
        let mut seen = HashSet::new();
        let mut todo = keys
            .iter()
            .copied()
            .filter(|key| *key != Pubkey::default() && seen.insert(*key))
            .collect::<VecDeque<_>>();

        let mut accounts: Vec<PriceAccountEntry> = vec![];
        while !todo.is_empty() {
            let batch = todo
                .drain(..todo.len().min(self.batch_size()))
                .collect::<Vec<_>>();
            let fetched = accounts.len();
            if let Err(error) = self
                .fetch_batch(&batch, commitment, PriceAccount::decode, &mut accounts)
                .await
            {
                return Err(Incomplete::new(accounts, error));
            }

            // Any unseen next price is looked up in a later batch.
            for entry in accounts.iter().skip(fetched) {
                let next = entry.account.next;
                if next != Pubkey::default() && seen.insert(next) {
                    todo.push_back(next);
                }
            }
        }
        Ok(accounts)
    }

    fn batch_size(&self) -> usize {
        self.config.max_lookup_batch_size.max(1)
    }

    async fn get_account<T>(
        &self,
        key: Pubkey,
        commitment: CommitmentConfig,
        decode: fn(&[u8]) -> Result<T, AccountError>,
    ) -> Result<AccountEntry<T>, QueryError> {
        let mut accounts = Vec::with_capacity(1);
        self.fetch_batch(&[key], commitment, decode, &mut accounts)
            .await?;
        accounts.pop().ok_or(QueryError::AccountNotFound { key })
    }

    /// Fetches and decodes one batch, appending entries in key order. Stops at
    /// the first account that is missing or fails to decode.
    async fn fetch_batch<T>(
        &self,
        keys: &[Pubkey],
        commitment: CommitmentConfig,
        decode: fn(&[u8]) -> Result<T, AccountError>,
        out: &mut Vec<AccountEntry<T>>,
    ) -> Result<(), QueryError> {
        let response = self
            .fetcher
            .fetch_accounts(keys, commitment)
            .await
            .map_err(|error| QueryError::Fetch {
                keys: keys.len(),
                error,
            })?;
        if response.accounts.len() != keys.len() {
            return Err(QueryError::CountMismatch {
                first_key: keys.first().copied().unwrap_or_default(),
                requested: keys.len(),
                received:  response.accounts.len(),
            });
        }

        for (key, data) in keys.iter().zip(response.accounts) {
            let data = data.ok_or(QueryError::AccountNotFound { key: *key })?;
            let account = decode(&data).map_err(|error| QueryError::Decode { key: *key, error })?;
            out.push(AccountEntry {
                key: *key,
                slot: response.slot,
                account,
            });
        }
        Ok(())
    }
}
