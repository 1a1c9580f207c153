//! Solana RPC and PubSub transports behind `AccountFetcher` and
//! `AccountSubscriber`.

use {
    super::{
        query::{
            AccountFetcher,
            FetchedAccounts,
        },
        stream::{
            AccountNotification,
            AccountSubscriber,
            Subscription,
        },
    },
    anyhow::{
        anyhow,
        Context,
        Result,
    },
    solana_account_decoder::UiAccountEncoding,
    solana_client::{
        nonblocking::{
            pubsub_client::PubsubClient,
            rpc_client::RpcClient,
        },
        rpc_config::{
            RpcAccountInfoConfig,
            RpcProgramAccountsConfig,
        },
        rpc_filter::{
            Memcmp,
            RpcFilterType,
        },
        rpc_response::{
            Response,
            RpcKeyedAccount,
        },
    },
    solana_sdk::{
        account::Account,
        commitment_config::CommitmentConfig,
        pubkey::Pubkey,
    },
    std::time::Duration,
    tokio::{
        sync::{
            mpsc,
            oneshot,
        },
        task::JoinHandle,
    },
    tokio_stream::{
        Stream,
        StreamExt,
    },
    tracing::instrument,
};

/// Notifications buffered between the socket and the stream supervisor.
const NOTIFICATION_BUFFER: usize = 64;

/// Limit on each request sent to the server while tearing a subscription down.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait::async_trait]
impl AccountFetcher for RpcClient {
    async fn fetch_accounts(
        &self,
        keys: &[Pubkey],
        commitment: CommitmentConfig,
    ) -> Result<FetchedAccounts> {
        let response = self
            .get_multiple_accounts_with_commitment(keys, commitment)
            .await?;
        Ok(FetchedAccounts {
            slot:     response.context.slot,
            accounts: response
                .value
                .into_iter()
                .map(|account| account.map(|account| account.data))
                .collect(),
        })
    }
}

/// Opens one WebSocket connection per subscription.
#[derive(Clone, Debug)]
pub struct PubsubSubscriber {
    wss_url: String,
}

impl PubsubSubscriber {
    pub fn new(wss_url: String) -> Self {
        Self { wss_url }
    }
}

#[async_trait::async_trait]
impl AccountSubscriber for PubsubSubscriber {
    #[instrument(skip(self, prefix), fields(wss_url = %self.wss_url))]
    async fn subscribe(
        &self,
        program_key: &Pubkey,
        prefix: &[u8],
        commitment: CommitmentConfig,
    ) -> Result<Box<dyn Subscription>> {
        let client = PubsubClient::new(&self.wss_url)
            .await
            .with_context(|| format!("connecting to {}", self.wss_url))?;

        let config = RpcProgramAccountsConfig {
            account_config: RpcAccountInfoConfig {
                commitment: Some(commitment),
                encoding: Some(UiAccountEncoding::Base64Zstd),
                ..Default::default()
            },
            filters:        Some(vec![RpcFilterType::Memcmp(Memcmp::new_raw_bytes(
                0,
                prefix.to_vec(),
            ))]),
            with_context:   Some(true),
            sort_results:   None,
        };

        // The notification stream borrows the client, so both live in the
        // forwarding task.
        let (ready_tx, ready) = oneshot::channel();
        let (notifications_tx, notifications) = mpsc::channel(NOTIFICATION_BUFFER);
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(forward(
            client,
            *program_key,
            config,
            ready_tx,
            notifications_tx,
            stop_rx,
        ));

        match ready.await {
            Ok(Ok(())) => Ok(Box::new(PubsubSubscription {
                notifications,
                stop: Some(stop),
                task,
            })),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(anyhow!("subscription task exited before subscribing")),
        }
    }
}

async fn forward(
    client: PubsubClient,
    program_key: Pubkey,
    config: RpcProgramAccountsConfig,
    ready: oneshot::Sender<Result<()>>,
    notifications: mpsc::Sender<AccountNotification>,
    mut stop: oneshot::Receiver<()>,
) {
    let (mut stream, unsubscribe) = match client.program_subscribe(&program_key, Some(config)).await
    {
        Ok(subscription) => subscription,
        Err(err) => {
            let _ = ready.send(Err(anyhow!(err).context("program subscription failed")));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    pump(&mut stream, &notifications, &mut stop).await;

    // Both requests wait for the server, which may have gone silent.
    if tokio::time::timeout(TEARDOWN_TIMEOUT, unsubscribe()).await.is_err() {
        tracing::warn!("Program unsubscribe was not acknowledged in time.");
    }
    drop(stream);
    match tokio::time::timeout(TEARDOWN_TIMEOUT, client.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::debug!(err = ?err, "Failed to shut down PubSub client."),
        Err(_) => tracing::warn!("PubSub client shutdown timed out, dropping connection."),
    }
}

/// Forwards notifications until `stop` fires, the server ends the stream or
/// the receiver goes away.
async fn pump<S>(
    stream: &mut S,
    notifications: &mpsc::Sender<AccountNotification>,
    stop: &mut oneshot::Receiver<()>,
) where
    S: Stream<Item = Response<RpcKeyedAccount>> + Unpin,
{
    loop {
        let update = tokio::select! {
            _ = &mut *stop => return,
            update = stream.next() => update,
        };
        let Some(update) = update else {
            tracing::debug!("Program subscription closed by the server.");
            return;
        };
        let notification = match notification(update) {
            Ok(notification) => notification,
            Err(err) => {
                tracing::warn!(err = ?err, "Skipping undecodable account notification.");
                continue;
            }
        };
        tokio::select! {
            _ = &mut *stop => return,
            sent = notifications.send(notification) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

fn notification(update: Response<RpcKeyedAccount>) -> Result<AccountNotification> {
    let key: Pubkey = update.value.pubkey.as_str().try_into()?;
    let account = update
        .value
        .account
        .decode::<Account>()
        .ok_or_else(|| anyhow!("account {key} could not be decoded"))?;
    Ok(AccountNotification {
        key,
        owner: account.owner,
        data: account.data,
        slot: update.context.slot,
    })
}

pub struct PubsubSubscription {
    notifications: mpsc::Receiver<AccountNotification>,
    stop:          Option<oneshot::Sender<()>>,
    task:          JoinHandle<()>,
}

#[async_trait::async_trait]
impl Subscription for PubsubSubscription {
    async fn recv(&mut self) -> Result<AccountNotification> {
        self.notifications
            .recv()
            .await
            .ok_or_else(|| anyhow!("program subscription closed"))
    }

    async fn unsubscribe(mut self: Box<Self>) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        // Unblocks a forwarding task waiting on a full buffer.
        self.notifications.close();
        match tokio::time::timeout(2 * TEARDOWN_TIMEOUT, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(err = ?err, "PubSub forwarding task failed."),
            Err(_) => {
                tracing::warn!("PubSub forwarding task did not stop in time, aborting.");
                self.task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        solana_account_decoder::{
            parse_account_data::ParsedAccount,
            UiAccount,
            UiAccountData,
        },
        solana_client::rpc_response::RpcResponseContext,
    };

    fn price_update(key: &Pubkey, owner: &Pubkey) -> Response<RpcKeyedAccount> {
        keyed_account(
            key.to_string(),
            UiAccountData::Binary("AQID".to_string(), UiAccountEncoding::Base64),
            owner,
        )
    }

    fn keyed_account(pubkey: String, data: UiAccountData, owner: &Pubkey) -> Response<RpcKeyedAccount> {
        Response {
            context: RpcResponseContext {
                slot:        77,
                api_version: None,
            },
            value:   RpcKeyedAccount {
                pubkey,
                account: UiAccount {
                    lamports: 1,
                    data,
                    owner: owner.to_string(),
                    executable: false,
                    rent_epoch: 0,
                    space: None,
                },
            },
        }
    }

    #[test]
    fn test_notification() {
        let key = Pubkey::new_unique();
        let owner = Pubkey::new_unique();
        let update = keyed_account(
            key.to_string(),
            UiAccountData::Binary("AQID".to_string(), UiAccountEncoding::Base64),
            &owner,
        );

        let notification = notification(update).unwrap();
        assert_eq!(notification.key, key);
        assert_eq!(notification.owner, owner);
        assert_eq!(notification.data, vec![1, 2, 3]);
        assert_eq!(notification.slot, 77);
    }

    #[test]
    fn test_notification_rejects_bad_key() {
        let update = keyed_account(
            "not a key".to_string(),
            UiAccountData::Binary("AQID".to_string(), UiAccountEncoding::Base64),
            &Pubkey::new_unique(),
        );
        assert!(notification(update).is_err());
    }

    #[test]
    fn test_notification_rejects_parsed_data() {
        let update = keyed_account(
            Pubkey::new_unique().to_string(),
            UiAccountData::Json(ParsedAccount {
                program: "pyth".to_string(),
                parsed:  serde_json::json!({}),
                space:   0,
            }),
            &Pubkey::new_unique(),
        );
        assert!(notification(update).is_err());
    }

    #[tokio::test]
    async fn test_pump_stops_while_buffer_is_full() {
        let owner = Pubkey::new_unique();
        let mut stream = tokio_stream::iter(vec![
            price_update(&Pubkey::new_unique(), &owner),
            price_update(&Pubkey::new_unique(), &owner),
        ])
        .chain(tokio_stream::pending());
        // Nobody reads, so the second notification waits for buffer space.
        let (notifications_tx, _notifications) = mpsc::channel(1);
        let (stop_tx, mut stop) = oneshot::channel();

        let sender = notifications_tx.clone();
        let task = tokio::spawn(async move {
            pump(&mut stream, &notifications_tx, &mut stop).await;
        });
        while sender.capacity() > 0 {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
        stop_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_pump_stops_when_receiver_closes() {
        let owner = Pubkey::new_unique();
        let mut stream = tokio_stream::iter(vec![price_update(&Pubkey::new_unique(), &owner)])
            .chain(tokio_stream::pending());
        let (notifications_tx, mut notifications) = mpsc::channel(1);
        let (_stop_tx, mut stop) = oneshot::channel();

        let task = tokio::spawn(async move {
            pump(&mut stream, &notifications_tx, &mut stop).await;
        });
        let notification = notifications.recv().await.unwrap();
        assert_eq!(notification.owner, owner);
        assert_eq!(notification.slot, 77);

        notifications.close();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_pump_skips_undecodable_updates() {
        let owner = Pubkey::new_unique();
        let key = Pubkey::new_unique();
        let mut stream = tokio_stream::iter(vec![
            keyed_account(
                "not a key".to_string(),
                UiAccountData::Binary("AQID".to_string(), UiAccountEncoding::Base64),
                &owner,
            ),
            price_update(&key, &owner),
        ]);
        let (notifications_tx, mut notifications) = mpsc::channel(4);
        let (_stop_tx, mut stop) = oneshot::channel();

        // The stream ends after the second update, which ends the pump.
        pump(&mut stream, &notifications_tx, &mut stop).await;
        assert_eq!(notifications.recv().await.unwrap().key, key);
        assert!(notifications.try_recv().is_err());
    }
}
