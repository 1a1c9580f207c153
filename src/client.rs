/* ########################################## Architecture ##########################################

                +-------------------+                         +---------------------+
                |     RPC Node      |                         |    PubSub Node      |
                +-------------------+                         +---------------------+
                          |                                              |
                   AccountFetcher                                AccountSubscriber
                          |                                              |
                          v                                              v
                +-------------------+                         +---------------------+
                |   AccountQuery    |                         | PriceAccountStream  |
                | (mapping & price  |                         | (supervisor, idle   |
                |  list traversal)  |                         |  watchdog, backoff) |
                +-------------------+                         +---------------------+
                          |                                              |
                          v                                              v
                +-------------------+                         +---------------------+
                |     accounts      |                         |  PriceEventHandler  |
                | (binary codecs)   |                         | (per-callback diff) |
                +-------------------+                         +---------------------+

Write path: `InstructionBuilder` produces oracle program instructions which are encoded by the
`instruction` codec. Signing and submitting transactions is left to the caller.

################################################################################################## */

pub mod accounts;
pub mod attrs;
pub mod builder;
pub mod config;
pub mod env;
pub mod handler;
pub mod instruction;
pub mod metrics;
pub mod query;
pub mod solana;
pub mod stream;

use {
    self::{
        builder::InstructionBuilder,
        config::Config,
        env::Env,
        handler::PriceEventHandler,
        query::{
            AccountFetcher,
            AccountQuery,
        },
        solana::PubsubSubscriber,
        stream::{
            AccountSubscriber,
            PriceAccountStream,
        },
    },
    anyhow::Result,
    solana_client::nonblocking::rpc_client::RpcClient,
    solana_sdk::commitment_config::CommitmentConfig,
    std::sync::Arc,
};

/// Entry point tying the query, stream and instruction APIs to one deployment.
#[derive(Clone)]
pub struct Client {
    env:           Env,
    commitment:    CommitmentConfig,
    query:         AccountQuery,
    subscriber:    Arc<dyn AccountSubscriber>,
    stream_config: stream::Config,
}

impl Client {
    /// Connects to the endpoints named in `config`, falling back to the
    /// public endpoints of the configured network.
    pub fn new(config: &Config) -> Result<Self> {
        let network = config.env.network;
        let rpc_url = config
            .rpc
            .rpc_url
            .clone()
            .unwrap_or_else(|| network.rpc_url().to_string());
        let wss_url = config
            .rpc
            .wss_url
            .clone()
            .unwrap_or_else(|| network.wss_url().to_string());
        tracing::info!(rpc_url = %rpc_url, wss_url = %wss_url, "Creating client.");

        let commitment = CommitmentConfig {
            commitment: config.rpc.commitment,
        };
        let rpc_client =
            RpcClient::new_with_timeout_and_commitment(rpc_url, config.rpc.rpc_timeout, commitment);

        Ok(Self::with_transport(
            config.env.resolve()?,
            Arc::new(rpc_client),
            Arc::new(PubsubSubscriber::new(wss_url)),
            config,
        ))
    }

    /// Builds a client over arbitrary transports.
    pub fn with_transport(
        env: Env,
        fetcher: Arc<dyn AccountFetcher>,
        subscriber: Arc<dyn AccountSubscriber>,
        config: &Config,
    ) -> Self {
        Self {
            env,
            commitment: CommitmentConfig {
                commitment: config.rpc.commitment,
            },
            query: AccountQuery::new(fetcher, env.mapping, config.query.clone()),
            subscriber,
            stream_config: config.stream.clone(),
        }
    }

    pub fn env(&self) -> Env {
        self.env
    }

    /// Commitment used for account lookups.
    pub fn commitment(&self) -> CommitmentConfig {
        self.commitment
    }

    pub fn query(&self) -> &AccountQuery {
        &self.query
    }

    pub fn instructions(&self) -> InstructionBuilder {
        InstructionBuilder::new(self.env.program)
    }

    /// Opens a stream of price account updates of the configured program.
    pub fn stream_price_accounts(&self) -> PriceAccountStream {
        PriceAccountStream::spawn(
            self.subscriber.clone(),
            self.env.program,
            self.stream_config.clone(),
        )
    }

    /// Opens a new stream and dispatches its updates to callbacks.
    pub fn event_handler(&self) -> PriceEventHandler {
        PriceEventHandler::new(self.stream_price_accounts())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::client::{
            accounts::{
                MappingAccount,
                PriceStatus,
                ProductAccount,
            },
            attrs::AttrsMap,
            query::tests::FakeFetcher,
            stream::tests::{
                price_notification,
                FakeSubscriber,
            },
        },
        solana_sdk::pubkey::Pubkey,
    };

    fn client(fetcher: Arc<FakeFetcher>, subscriber: Arc<FakeSubscriber>) -> Client {
        let env = Env {
            program: Pubkey::new_unique(),
            mapping: Pubkey::new_unique(),
        };
        Client::with_transport(env, fetcher, subscriber, &Config::default())
    }

    #[tokio::test]
    async fn test_query_uses_env_mapping() {
        let fetcher = Arc::new(FakeFetcher::default());
        let client = client(fetcher.clone(), Arc::new(FakeSubscriber::default()));

        let product_key = Pubkey::new_unique();
        fetcher.insert(
            client.env().mapping,
            MappingAccount::new(Pubkey::default(), &[product_key])
                .unwrap()
                .to_bytes(),
        );
        let mut attrs = AttrsMap::new();
        attrs.push("symbol", "Crypto.BTC/USD");
        fetcher.insert(
            product_key,
            ProductAccount::new(Pubkey::default(), attrs)
                .unwrap()
                .to_bytes()
                .unwrap(),
        );

        let products = client
            .query()
            .get_all_product_accounts(client.commitment())
            .await
            .unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(
            products[0].account.attrs.get("symbol"),
            Some("Crypto.BTC/USD")
        );
    }

    #[tokio::test]
    async fn test_stream_uses_env_program() {
        let fetcher = Arc::new(FakeFetcher::default());
        let subscriber = Arc::new(FakeSubscriber::default());
        let client = client(fetcher, subscriber.clone());

        let key = Pubkey::new_unique();
        subscriber
            .scripts
            .lock()
            .unwrap()
            .push(vec![price_notification(client.env().program, key, 9)]);

        let mut stream = client.stream_price_accounts();
        let update = stream.recv().await.unwrap();
        assert_eq!(update.key, key);
        assert_eq!(update.account.agg.status, PriceStatus::Trading);
        stream.close();
    }

    #[test]
    fn test_instructions_target_env_program() {
        let client = client(
            Arc::new(FakeFetcher::default()),
            Arc::new(FakeSubscriber::default()),
        );
        let instruction = client
            .instructions()
            .init_mapping(Pubkey::new_unique(), Pubkey::new_unique());
        assert_eq!(instruction.program_id, client.env().program);
    }
}
