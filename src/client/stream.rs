//! Price account stream
//!
//! A supervisor task keeps a filtered program subscription open and forwards
//! decoded price accounts over a bounded channel:
//!
//! ```text
//!                 +-------------------- retry after backoff -------------------+
//!                 v                                                            |
//!  Disconnected -> Connecting -> Subscribed -> (read timeout) IdleTimeout -> Disconnected
//! ```
//!
//! Transport failures and idle timeouts are retried forever. The stream only
//! ends when it is cancelled, its deadline passes or its consumer goes away.

use {
    super::{
        accounts::{
            peek_account_type,
            AccountType,
            PriceAccount,
            ACCOUNT_FILTER_PREFIX,
        },
        metrics::StreamMetrics,
    },
    anyhow::{
        anyhow,
        Result,
    },
    backoff::backoff::{
        Backoff,
        Constant,
    },
    serde::{
        Deserialize,
        Serialize,
    },
    solana_sdk::{
        commitment_config::{
            CommitmentConfig,
            CommitmentLevel,
        },
        pubkey::Pubkey,
    },
    std::{
        sync::Arc,
        time::Duration,
    },
    tokio::{
        sync::{
            mpsc,
            watch,
        },
        time::Instant,
    },
    tracing::instrument,
};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// A subscription that delivers nothing for this long is torn down and
    /// reopened.
    #[serde(with = "humantime_serde")]
    pub read_timeout:             Duration,
    /// Pause between a failed connection and the next attempt.
    #[serde(with = "humantime_serde")]
    pub retry_interval:           Duration,
    /// Teardown of a subscription is abandoned after this long, so a stalled
    /// connection cannot hold up the reconnect.
    #[serde(with = "humantime_serde")]
    pub unsubscribe_timeout:      Duration,
    /// Capacity of the channel over which updates are delivered. A full
    /// channel blocks the stream until the consumer catches up.
    pub updates_channel_capacity: usize,
    /// Stop the stream once this much time has passed since it started.
    #[serde(with = "humantime_serde")]
    pub deadline:                 Option<Duration>,
    pub commitment:               CommitmentLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_timeout:             Duration::from_secs(20),
            retry_interval:           Duration::from_secs(3),
            unsubscribe_timeout:      Duration::from_secs(5),
            updates_channel_capacity: 1,
            deadline:                 None,
            commitment:               CommitmentLevel::Confirmed,
        }
    }
}

/// Change of an account owned by the subscribed program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountNotification {
    pub key:   Pubkey,
    pub owner: Pubkey,
    pub data:  Vec<u8>,
    pub slot:  u64,
}

/// Opens program account subscriptions.
#[async_trait::async_trait]
pub trait AccountSubscriber: Send + Sync {
    /// Subscribes to accounts of `program_key` whose data starts with `prefix`.
    async fn subscribe(
        &self,
        program_key: &Pubkey,
        prefix: &[u8],
        commitment: CommitmentConfig,
    ) -> Result<Box<dyn Subscription>>;
}

/// An open subscription. Dropping it must release the underlying transport.
#[async_trait::async_trait]
pub trait Subscription: Send {
    /// Waits for the next notification. Fails once the subscription is closed.
    async fn recv(&mut self) -> Result<AccountNotification>;

    /// Tears the subscription down and waits until the transport is released.
    async fn unsubscribe(self: Box<Self>);
}

/// A decoded price account as received from the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PriceAccountUpdate {
    pub slot:    u64,
    pub key:     Pubkey,
    pub account: Arc<PriceAccount>,
}

/// Why a stream ended.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("price account stream cancelled")]
    Cancelled,
    #[error("price account stream deadline exceeded")]
    DeadlineExceeded,
    #[error("price account stream aborted")]
    Aborted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    IdleTimeout,
}

/// Cloneable handle that can stop a stream and observe how it ended.
///
/// The stream is cancelled once `close` is called on any handle, or once the
/// stream and every handle have been dropped.
#[derive(Clone)]
pub struct StreamController {
    cancel:      Arc<watch::Sender<bool>>,
    termination: watch::Receiver<Option<StreamError>>,
    state:       watch::Receiver<ConnectionState>,
}

impl StreamController {
    pub fn close(&self) {
        self.cancel.send_replace(true);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Returns the termination reason once the stream has ended. By then the
    /// update channel is closed.
    pub async fn err(&self) -> StreamError {
        let mut termination = self.termination.clone();
        match termination.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(StreamError::Aborted),
            // The supervisor went away without reporting, e.g. the runtime shut down.
            Err(_) => StreamError::Aborted,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.termination.borrow().is_some()
    }
}

/// Receiving end of a price account stream.
pub struct PriceAccountStream {
    updates:    mpsc::Receiver<PriceAccountUpdate>,
    controller: StreamController,
}

impl PriceAccountStream {
    /// Spawns the supervisor on the current tokio runtime.
    pub fn spawn(
        subscriber: Arc<dyn AccountSubscriber>,
        program_key: Pubkey,
        config: Config,
    ) -> Self {
        let (updates_tx, updates) = mpsc::channel(config.updates_channel_capacity.max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (termination_tx, termination) = watch::channel(None);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);

        let supervisor = Supervisor {
            subscriber,
            program_key,
            config,
            updates_tx,
            state_tx,
            metrics: StreamMetrics::global(),
        };
        tokio::spawn(async move {
            let reason = supervisor.run(cancel_rx).await;
            tracing::info!(reason = %reason, "Price account stream terminated.");
            termination_tx.send_replace(Some(reason));
        });

        Self {
            updates,
            controller: StreamController {
                cancel: Arc::new(cancel_tx),
                termination,
                state,
            },
        }
    }

    /// Next update, `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<PriceAccountUpdate> {
        self.updates.recv().await
    }

    /// Blocking variant of `recv` for use outside of the async runtime.
    pub fn blocking_recv(&mut self) -> Option<PriceAccountUpdate> {
        self.updates.blocking_recv()
    }

    pub fn close(&self) {
        self.controller.close();
    }

    pub async fn err(&self) -> StreamError {
        self.controller.err().await
    }

    pub fn controller(&self) -> StreamController {
        self.controller.clone()
    }

    pub fn into_parts(self) -> (mpsc::Receiver<PriceAccountUpdate>, StreamController) {
        (self.updates, self.controller)
    }
}

enum Failure {
    /// Retried after the backoff interval.
    Transient(anyhow::Error),
    Terminal(StreamError),
}

struct Supervisor {
    subscriber:  Arc<dyn AccountSubscriber>,
    program_key: Pubkey,
    config:      Config,
    updates_tx:  mpsc::Sender<PriceAccountUpdate>,
    state_tx:    watch::Sender<ConnectionState>,
    metrics:     &'static StreamMetrics,
}

impl Supervisor {
    /// Runs connections until a terminal condition. Consumes the supervisor so
    /// the update channel is closed before the reason is published.
    #[instrument(skip(self, cancel), fields(program_key = %self.program_key))]
    async fn run(self, mut cancel: watch::Receiver<bool>) -> StreamError {
        let deadline = self.config.deadline.map(|deadline| Instant::now() + deadline);
        let mut backoff = Constant::new(self.config.retry_interval);

        loop {
            let failure = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => Failure::Terminal(StreamError::Cancelled),
                _ = deadline_passed(deadline) => Failure::Terminal(StreamError::DeadlineExceeded),
                failure = self.run_connection() => failure,
            };
            self.state_tx.send_replace(ConnectionState::Disconnected);

            let err = match failure {
                Failure::Terminal(reason) => return reason,
                Failure::Transient(err) => err,
            };
            let retry_in = backoff.next_backoff().unwrap_or(self.config.retry_interval);
            tracing::warn!(
                err = ?err,
                retry_in = ?retry_in,
                "Price account subscription failed, reconnecting.",
            );

            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return StreamError::Cancelled,
                _ = deadline_passed(deadline) => return StreamError::DeadlineExceeded,
                _ = tokio::time::sleep(retry_in) => {}
            }
        }
    }

    /// Opens one subscription and reads from it until it fails.
    async fn run_connection(&self) -> Failure {
        self.state_tx.send_replace(ConnectionState::Connecting);
        let commitment = CommitmentConfig {
            commitment: self.config.commitment,
        };
        let mut subscription = match self
            .subscriber
            .subscribe(&self.program_key, &ACCOUNT_FILTER_PREFIX, commitment)
            .await
        {
            Ok(subscription) => subscription,
            Err(err) => return Failure::Transient(err.context("failed to subscribe")),
        };

        let _connection = self.metrics.connection();
        self.state_tx.send_replace(ConnectionState::Subscribed);
        tracing::info!("Subscribed to price account updates.");

        loop {
            let notification =
                match tokio::time::timeout(self.config.read_timeout, subscription.recv()).await {
                    Ok(Ok(notification)) => notification,
                    Ok(Err(err)) => {
                        self.teardown(subscription).await;
                        return Failure::Transient(err);
                    }
                    Err(_) => {
                        self.state_tx.send_replace(ConnectionState::IdleTimeout);
                        tracing::warn!(
                            read_timeout = ?self.config.read_timeout,
                            "No account update received in time, tearing down subscription.",
                        );
                        self.teardown(subscription).await;
                        return Failure::Transient(anyhow!(
                            "no account update received within {:?}",
                            self.config.read_timeout
                        ));
                    }
                };
            self.metrics.record_event();

            let Some(update) = self.accept(notification) else {
                continue;
            };
            if self.updates_tx.send(update).await.is_err() {
                tracing::debug!("Update receiver dropped, closing subscription.");
                self.teardown(subscription).await;
                return Failure::Terminal(StreamError::Cancelled);
            }
        }
    }

    /// Releases `subscription`, giving up once the unsubscribe timeout passes.
    async fn teardown(&self, subscription: Box<dyn Subscription>) {
        let unsubscribe_timeout = self.config.unsubscribe_timeout;
        if tokio::time::timeout(unsubscribe_timeout, subscription.unsubscribe())
            .await
            .is_err()
        {
            tracing::warn!(
                unsubscribe_timeout = ?unsubscribe_timeout,
                "Unsubscribe did not complete in time, dropping subscription.",
            );
        }
    }

    /// Decodes price accounts of the target program, drops everything else.
    fn accept(&self, notification: AccountNotification) -> Option<PriceAccountUpdate> {
        if notification.owner != self.program_key
            || peek_account_type(&notification.data) != AccountType::Price
        {
            return None;
        }
        match PriceAccount::decode(&notification.data) {
            Ok(account) => {
                tracing::trace!(key = %notification.key, slot = notification.slot, "Price account update.");
                Some(PriceAccountUpdate {
                    slot:    notification.slot,
                    key:     notification.key,
                    account: Arc::new(account),
                })
            }
            Err(err) => {
                tracing::warn!(
                    key = %notification.key,
                    err = %err,
                    "Failed to decode price account update, skipping.",
                );
                None
            }
        }
    }
}

/// Resolves once cancellation is requested or every handle is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

async fn deadline_passed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use {
        super::*,
        crate::client::accounts::{
            MappingAccount,
            PriceStatus,
        },
        std::sync::{
            atomic::{
                AtomicUsize,
                Ordering,
            },
            Mutex,
        },
    };

    /// Hands out subscriptions that replay a scripted list of notifications
    /// and then either stall or fail.
    #[derive(Default)]
    pub(crate) struct FakeSubscriber {
        pub scripts:          Mutex<Vec<Vec<AccountNotification>>>,
        pub connects:         AtomicUsize,
        pub unsubscribes:     Arc<AtomicUsize>,
        pub fail_connect:     bool,
        /// End each subscription with an error instead of stalling.
        pub fail_reads:       bool,
        /// Never complete an unsubscribe, as on a connection that went silent.
        pub hang_unsubscribe: bool,
    }

    struct FakeSubscription {
        notifications: std::vec::IntoIter<AccountNotification>,
        unsubscribes:  Arc<AtomicUsize>,
        fail_reads:    bool,
        hang:          bool,
    }

    #[async_trait::async_trait]
    impl AccountSubscriber for FakeSubscriber {
        async fn subscribe(
            &self,
            _program_key: &Pubkey,
            prefix: &[u8],
            _commitment: CommitmentConfig,
        ) -> Result<Box<dyn Subscription>> {
            assert_eq!(prefix, ACCOUNT_FILTER_PREFIX);
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect {
                anyhow::bail!("connection refused");
            }
            let mut scripts = self.scripts.lock().unwrap();
            let script = if scripts.is_empty() {
                vec![]
            } else {
                scripts.remove(0)
            };
            Ok(Box::new(FakeSubscription {
                notifications: script.into_iter(),
                unsubscribes:  self.unsubscribes.clone(),
                fail_reads:    self.fail_reads,
                hang:          self.hang_unsubscribe,
            }))
        }
    }

    #[async_trait::async_trait]
    impl Subscription for FakeSubscription {
        async fn recv(&mut self) -> Result<AccountNotification> {
            match self.notifications.next() {
                Some(notification) => Ok(notification),
                None if self.fail_reads => anyhow::bail!("connection reset"),
                None => std::future::pending().await,
            }
        }

        async fn unsubscribe(self: Box<Self>) {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
        }
    }

    pub(crate) fn price_notification(
        program_key: Pubkey,
        key: Pubkey,
        pub_slot: u64,
    ) -> AccountNotification {
        let mut account = PriceAccount {
            exponent: -5,
            ..Default::default()
        };
        account.agg.price = 112_717;
        account.agg.status = PriceStatus::Trading;
        account.agg.pub_slot = pub_slot;
        AccountNotification {
            key,
            owner: program_key,
            data: account.to_bytes(),
            slot: pub_slot,
        }
    }

    fn config() -> Config {
        Config {
            read_timeout: Duration::from_secs(20),
            retry_interval: Duration::from_secs(3),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_filters_and_delivers_price_updates() {
        let program_key = Pubkey::new_unique();
        let price_key = Pubkey::new_unique();
        let mut malformed = price_notification(program_key, price_key, 9);
        malformed.data.truncate(1000);
        let script = vec![
            // Owned by another program.
            price_notification(Pubkey::new_unique(), price_key, 10),
            // Not a price account.
            AccountNotification {
                key:   Pubkey::new_unique(),
                owner: program_key,
                data:  MappingAccount::new(Pubkey::default(), &[]).unwrap().to_bytes(),
                slot:  10,
            },
            malformed,
            price_notification(program_key, price_key, 11),
            price_notification(program_key, price_key, 12),
        ];
        let subscriber = Arc::new(FakeSubscriber {
            scripts: Mutex::new(vec![script]),
            ..Default::default()
        });

        let mut stream = PriceAccountStream::spawn(subscriber.clone(), program_key, config());
        let first = stream.recv().await.unwrap();
        assert_eq!(first.key, price_key);
        assert_eq!(first.slot, 11);
        assert_eq!(first.account.value().unwrap().0.to_string(), "1.12717");
        assert_eq!(stream.recv().await.unwrap().slot, 12);

        stream.close();
        assert!(stream.recv().await.is_none());
        assert_eq!(stream.err().await, StreamError::Cancelled);
        assert_eq!(subscriber.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_reconnects_once() {
        let subscriber = Arc::new(FakeSubscriber::default());
        let stream = PriceAccountStream::spawn(subscriber.clone(), Pubkey::new_unique(), config());
        let controller = stream.controller();

        // 20s read timeout, then a 3s pause before the second subscription.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(subscriber.connects.load(Ordering::SeqCst), 2);
        assert_eq!(subscriber.unsubscribes.load(Ordering::SeqCst), 1);
        assert!(!controller.is_terminated());
        assert_eq!(controller.state(), ConnectionState::Subscribed);

        controller.close();
        assert_eq!(controller.err().await, StreamError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_unsubscribe_does_not_block_reconnect() {
        let subscriber = Arc::new(FakeSubscriber {
            hang_unsubscribe: true,
            ..Default::default()
        });
        let stream = PriceAccountStream::spawn(subscriber.clone(), Pubkey::new_unique(), config());
        let controller = stream.controller();

        // 20s read timeout, 5s unsubscribe timeout, then the 3s retry pause.
        tokio::time::sleep(Duration::from_secs(27)).await;
        assert_eq!(subscriber.connects.load(Ordering::SeqCst), 1);
        assert_eq!(subscriber.unsubscribes.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(subscriber.connects.load(Ordering::SeqCst), 2);
        assert_eq!(controller.state(), ConnectionState::Subscribed);

        controller.close();
        assert_eq!(controller.err().await, StreamError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_cancelled() {
        let subscriber = Arc::new(FakeSubscriber {
            fail_connect: true,
            ..Default::default()
        });
        let mut stream = PriceAccountStream::spawn(subscriber.clone(), Pubkey::new_unique(), config());

        // Attempts at 0s, 3s, 6s and 9s.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(subscriber.connects.load(Ordering::SeqCst), 4);

        stream.close();
        assert!(stream.recv().await.is_none());
        assert_eq!(stream.err().await, StreamError::Cancelled);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(subscriber.connects.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_reconnects() {
        let program_key = Pubkey::new_unique();
        let price_key = Pubkey::new_unique();
        let subscriber = Arc::new(FakeSubscriber {
            scripts: Mutex::new(vec![
                vec![price_notification(program_key, price_key, 1)],
                vec![price_notification(program_key, price_key, 2)],
            ]),
            fail_reads: true,
            ..Default::default()
        });
        let mut stream = PriceAccountStream::spawn(subscriber.clone(), program_key, config());

        assert_eq!(stream.recv().await.unwrap().slot, 1);
        assert_eq!(stream.recv().await.unwrap().slot, 2);
        assert_eq!(subscriber.connects.load(Ordering::SeqCst), 2);
        // The second subscription may already have failed as well.
        assert!(subscriber.unsubscribes.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let subscriber = Arc::new(FakeSubscriber::default());
        let stream = PriceAccountStream::spawn(
            subscriber,
            Pubkey::new_unique(),
            Config {
                deadline: Some(Duration::from_secs(5)),
                ..config()
            },
        );
        assert_eq!(stream.err().await, StreamError::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_stream_cancels() {
        let subscriber = Arc::new(FakeSubscriber::default());
        let stream = PriceAccountStream::spawn(subscriber, Pubkey::new_unique(), config());
        let (updates, controller) = stream.into_parts();
        let termination = controller.termination.clone();
        drop(updates);
        drop(controller);

        let mut termination = termination;
        let reason = termination.wait_for(Option::is_some).await.unwrap().clone();
        assert_eq!(reason, Some(StreamError::Cancelled));
    }
}
