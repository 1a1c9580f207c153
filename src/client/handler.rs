//! Callback interface over a price account stream.
//!
//! Callbacks are registered per price account, either for the aggregate price
//! or for the contribution of a single publisher. Each registration remembers
//! the last `PriceInfo` it was shown and is only invoked when the publishing
//! slot or status moves on, or when the price appears or disappears.
//!
//! Callbacks run one after another on a dedicated thread while the
//! registration table is locked. A slow callback delays every other callback
//! of the same handler and, through the bounded update channel, the stream
//! itself. Registering or unsubscribing from inside a callback deadlocks.

use {
    super::{
        accounts::{
            PriceAccount,
            PriceInfo,
        },
        stream::{
            PriceAccountStream,
            PriceAccountUpdate,
            StreamController,
            StreamError,
        },
    },
    rust_decimal::Decimal,
    solana_sdk::pubkey::Pubkey,
    std::{
        collections::{
            BTreeMap,
            HashMap,
        },
        sync::{
            Arc,
            Mutex,
            MutexGuard,
            PoisonError,
            Weak,
        },
    },
    tokio::sync::watch,
};

pub type Callback = Box<dyn FnMut(&PriceUpdate) + Send>;

/// Passed to callbacks when an aggregate or component price has changed.
#[derive(Clone, Debug)]
pub struct PriceUpdate {
    pub key:           Pubkey,
    pub slot:          u64,
    pub account:       Arc<PriceAccount>,
    /// Last value shown to this callback, `None` on the first invocation.
    pub previous_info: Option<PriceInfo>,
    pub current_info:  PriceInfo,
}

impl PriceUpdate {
    /// Previously seen price and confidence, `None` if absent or not trading.
    pub fn previous(&self) -> Option<(Decimal, Decimal)> {
        self.previous_info
            .as_ref()?
            .value(self.account.exponent)
    }

    /// Current price and confidence, `None` if not trading.
    pub fn current(&self) -> Option<(Decimal, Decimal)> {
        self.current_info.value(self.account.exponent)
    }
}

struct Registration {
    callback:  Callback,
    last_seen: Option<PriceInfo>,
}

impl Registration {
    fn inform(&mut self, update: &PriceAccountUpdate, current: &PriceInfo) {
        if PriceInfo::has_changed(self.last_seen.as_ref(), Some(current)) {
            (self.callback)(&PriceUpdate {
                key:           update.key,
                slot:          update.slot,
                account:       update.account.clone(),
                previous_info: self.last_seen,
                current_info:  *current,
            });
        }
        self.last_seen = Some(*current);
    }
}

/// Registrations of a single price account, ordered by registration.
#[derive(Default)]
struct PriceCallbacks {
    aggregate:  BTreeMap<u64, Registration>,
    components: HashMap<Pubkey, BTreeMap<u64, Registration>>,
}

impl PriceCallbacks {
    fn is_empty(&self) -> bool {
        self.aggregate.is_empty() && self.components.is_empty()
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    prices:  HashMap<Pubkey, PriceCallbacks>,
    /// Set once the stream has ended; later registrations are discarded.
    closed:  bool,
}

impl Registry {
    fn register(&mut self, price_key: Pubkey, publisher: Option<Pubkey>, callback: Callback) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        if self.closed {
            return id;
        }

        let callbacks = self.prices.entry(price_key).or_default();
        let registrations = match publisher {
            None => &mut callbacks.aggregate,
            Some(publisher) => callbacks.components.entry(publisher).or_default(),
        };
        registrations.insert(
            id,
            Registration {
                callback,
                last_seen: None,
            },
        );
        id
    }

    fn unregister(&mut self, price_key: &Pubkey, publisher: Option<&Pubkey>, id: u64) {
        let Some(callbacks) = self.prices.get_mut(price_key) else {
            return;
        };
        match publisher {
            None => {
                callbacks.aggregate.remove(&id);
            }
            Some(publisher) => {
                if let Some(registrations) = callbacks.components.get_mut(publisher) {
                    registrations.remove(&id);
                    if registrations.is_empty() {
                        callbacks.components.remove(publisher);
                    }
                }
            }
        }
        if callbacks.is_empty() {
            self.prices.remove(price_key);
        }
    }

    fn dispatch(&mut self, update: &PriceAccountUpdate) {
        let Some(callbacks) = self.prices.get_mut(&update.key) else {
            return;
        };
        tracing::trace!(key = %update.key, slot = update.slot, "Dispatching price update.");

        for registration in callbacks.aggregate.values_mut() {
            registration.inform(update, &update.account.agg);
        }
        for component in update.account.components() {
            if let Some(registrations) = callbacks.components.get_mut(&component.publisher) {
                for registration in registrations.values_mut() {
                    registration.inform(update, &component.latest);
                }
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.prices.clear();
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Dispatches the updates of one price account stream to registered callbacks.
///
/// Dropping the handler closes the stream.
pub struct PriceEventHandler {
    registry:   Arc<Mutex<Registry>>,
    controller: StreamController,
    done:       watch::Receiver<bool>,
}

impl PriceEventHandler {
    /// Takes over `stream` and starts consuming it on a blocking thread.
    pub fn new(stream: PriceAccountStream) -> Self {
        let (mut updates, controller) = stream.into_parts();
        let registry = Arc::new(Mutex::new(Registry::default()));
        let (done_tx, done) = watch::channel(false);

        let consumer_registry = registry.clone();
        tokio::task::spawn_blocking(move || {
            while let Some(update) = updates.blocking_recv() {
                lock(&consumer_registry).dispatch(&update);
            }
            lock(&consumer_registry).close();
            done_tx.send_replace(true);
        });

        Self {
            registry,
            controller,
            done,
        }
    }

    /// Calls `callback` whenever the aggregate price of `price_key` changes.
    pub fn on_price_change<F>(&self, price_key: Pubkey, callback: F) -> CallbackHandle
    where
        F: FnMut(&PriceUpdate) + Send + 'static,
    {
        self.register(price_key, None, Box::new(callback))
    }

    /// Calls `callback` whenever the latest price submitted by `publisher` to
    /// `price_key` changes.
    pub fn on_component_change<F>(
        &self,
        price_key: Pubkey,
        publisher: Pubkey,
        callback: F,
    ) -> CallbackHandle
    where
        F: FnMut(&PriceUpdate) + Send + 'static,
    {
        self.register(price_key, Some(publisher), Box::new(callback))
    }

    fn register(&self, price_key: Pubkey, publisher: Option<Pubkey>, callback: Callback) -> CallbackHandle {
        let id = lock(&self.registry).register(price_key, publisher, callback);
        CallbackHandle {
            registry: Arc::downgrade(&self.registry),
            price_key,
            publisher,
            id,
        }
    }

    /// Waits until the stream has ended and the last callback has returned.
    pub async fn err(&self) -> StreamError {
        let reason = self.controller.err().await;
        let mut done = self.done.clone();
        let _ = done.wait_for(|done| *done).await;
        reason
    }

    pub fn close(&self) {
        self.controller.close();
    }

    pub fn controller(&self) -> StreamController {
        self.controller.clone()
    }
}

impl Drop for PriceEventHandler {
    fn drop(&mut self) {
        self.controller.close();
    }
}

/// Keeps track of a callback registration.
///
/// Unsubscribing is optional: registrations are removed when the stream ends.
#[derive(Debug)]
pub struct CallbackHandle {
    registry:  Weak<Mutex<Registry>>,
    price_key: Pubkey,
    publisher: Option<Pubkey>,
    id:        u64,
}

impl CallbackHandle {
    /// Removes the registration. Waits for an in-flight dispatch to finish;
    /// the callback is never invoked once this returns.
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).unregister(&self.price_key, self.publisher.as_ref(), self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::client::{
            accounts::{
                PriceComponent,
                PriceStatus,
            },
            stream::{
                AccountNotification,
                AccountSubscriber,
                Config,
                Subscription,
            },
        },
        anyhow::Result,
        solana_sdk::commitment_config::CommitmentConfig,
        std::{
            sync::atomic::{
                AtomicUsize,
                Ordering,
            },
            time::Duration,
        },
        tokio::sync::mpsc,
    };

    /// Subscriber fed by the test through a channel.
    struct ChannelSubscriber {
        notifications: Mutex<Option<mpsc::UnboundedReceiver<AccountNotification>>>,
    }

    struct ChannelSubscription(Option<mpsc::UnboundedReceiver<AccountNotification>>);

    #[async_trait::async_trait]
    impl AccountSubscriber for ChannelSubscriber {
        async fn subscribe(
            &self,
            _program_key: &Pubkey,
            _prefix: &[u8],
            _commitment: CommitmentConfig,
        ) -> Result<Box<dyn Subscription>> {
            let notifications = self.notifications.lock().unwrap().take();
            Ok(Box::new(ChannelSubscription(notifications)))
        }
    }

    #[async_trait::async_trait]
    impl Subscription for ChannelSubscription {
        async fn recv(&mut self) -> Result<AccountNotification> {
            match self.0.as_mut() {
                Some(notifications) => match notifications.recv().await {
                    Some(notification) => Ok(notification),
                    None => std::future::pending().await,
                },
                None => std::future::pending().await,
            }
        }

        async fn unsubscribe(self: Box<Self>) {}
    }

    struct Fixture {
        program_key: Pubkey,
        price_key:   Pubkey,
        publisher:   Pubkey,
        feed:        mpsc::UnboundedSender<AccountNotification>,
        handler:     PriceEventHandler,
    }

    impl Fixture {
        fn new() -> Self {
            let (feed, notifications) = mpsc::unbounded_channel();
            let subscriber = Arc::new(ChannelSubscriber {
                notifications: Mutex::new(Some(notifications)),
            });
            let program_key = Pubkey::new_unique();
            let stream = PriceAccountStream::spawn(subscriber, program_key, Config::default());
            Self {
                program_key,
                price_key: Pubkey::new_unique(),
                publisher: Pubkey::new_unique(),
                feed,
                handler: PriceEventHandler::new(stream),
            }
        }

        /// Publishes an update where both the aggregate and the publisher's
        /// component carry `info`.
        fn publish(&self, key: Pubkey, info: PriceInfo) {
            let mut account = PriceAccount {
                exponent: -5,
                ..Default::default()
            };
            account.agg = info;
            account.components[1] = PriceComponent {
                publisher: self.publisher,
                agg:       info,
                latest:    info,
            };
            self.feed
                .send(AccountNotification {
                    key,
                    owner: self.program_key,
                    data: account.to_bytes(),
                    slot: info.pub_slot,
                })
                .unwrap();
        }
    }

    fn trading(price: i64, pub_slot: u64) -> PriceInfo {
        PriceInfo {
            price,
            conf: 1,
            status: PriceStatus::Trading,
            corp_act: 0,
            pub_slot,
        }
    }

    async fn next(updates: &mut mpsc::UnboundedReceiver<PriceUpdate>) -> PriceUpdate {
        tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn collector() -> (
        impl FnMut(&PriceUpdate) + Send + 'static,
        mpsc::UnboundedReceiver<PriceUpdate>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |update: &PriceUpdate| {
                let _ = tx.send(update.clone());
            },
            rx,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_price_change_diffing() {
        let fixture = Fixture::new();
        let (callback, mut updates) = collector();
        let _handle = fixture.handler.on_price_change(fixture.price_key, callback);

        fixture.publish(fixture.price_key, trading(112_717, 10));
        // Same slot and status: not a change, even with a different price.
        fixture.publish(fixture.price_key, trading(112_800, 10));
        fixture.publish(fixture.price_key, trading(112_900, 11));

        let first = next(&mut updates).await;
        assert_eq!(first.previous_info, None);
        assert_eq!(first.current_info.pub_slot, 10);
        assert_eq!(first.current().unwrap().0.to_string(), "1.12717");
        assert_eq!(first.previous(), None);

        let second = next(&mut updates).await;
        assert_eq!(second.current_info.pub_slot, 11);
        assert_eq!(second.previous_info.unwrap().price, 112_800);
        assert_eq!(second.previous().unwrap().0.to_string(), "1.128");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_component_change() {
        let fixture = Fixture::new();
        let (callback, mut updates) = collector();
        let _handle =
            fixture
                .handler
                .on_component_change(fixture.price_key, fixture.publisher, callback);
        let (other_callback, mut other_updates) = collector();
        let _other = fixture.handler.on_component_change(
            fixture.price_key,
            Pubkey::new_unique(),
            other_callback,
        );

        fixture.publish(fixture.price_key, trading(5, 20));
        let update = next(&mut updates).await;
        assert_eq!(update.key, fixture.price_key);
        assert_eq!(update.current_info.pub_slot, 20);
        assert!(other_updates.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_subscribers_diff_independently() {
        let fixture = Fixture::new();
        let (early, mut early_updates) = collector();
        let _early = fixture.handler.on_price_change(fixture.price_key, early);

        fixture.publish(fixture.price_key, trading(1, 30));
        next(&mut early_updates).await;

        // A late subscriber sees the unchanged price as its first update.
        let (late, mut late_updates) = collector();
        let _late = fixture.handler.on_price_change(fixture.price_key, late);
        fixture.publish(fixture.price_key, trading(1, 30));
        fixture.publish(fixture.price_key, trading(1, 31));

        assert_eq!(next(&mut late_updates).await.current_info.pub_slot, 30);
        assert_eq!(next(&mut late_updates).await.current_info.pub_slot, 31);
        assert_eq!(next(&mut early_updates).await.current_info.pub_slot, 31);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unsubscribe() {
        let fixture = Fixture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = fixture.handler.on_price_change(fixture.price_key, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.unsubscribe();

        let (barrier, mut barrier_updates) = collector();
        let _barrier = fixture.handler.on_price_change(fixture.price_key, barrier);
        fixture.publish(fixture.price_key, trading(1, 40));
        next(&mut barrier_updates).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unsubscribe_during_dispatch() {
        let fixture = Fixture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let counter = calls.clone();
        let handle = fixture.handler.on_price_change(fixture.price_key, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = started_tx.send(());
            std::thread::sleep(Duration::from_millis(50));
        });

        fixture.publish(fixture.price_key, trading(1, 50));
        started.recv().await.unwrap();
        tokio::task::spawn_blocking(move || handle.unsubscribe())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let (barrier, mut barrier_updates) = collector();
        let _barrier = fixture.handler.on_price_change(fixture.price_key, barrier);
        fixture.publish(fixture.price_key, trading(1, 51));
        next(&mut barrier_updates).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_registrations_cleared_when_stream_ends() {
        let fixture = Fixture::new();
        let (callback, _updates) = collector();
        let _handle = fixture.handler.on_price_change(fixture.price_key, callback);
        assert_eq!(lock(&fixture.handler.registry).prices.len(), 1);

        fixture.handler.close();
        assert_eq!(fixture.handler.err().await, StreamError::Cancelled);
        assert!(lock(&fixture.handler.registry).prices.is_empty());

        let (callback, _updates) = collector();
        let _late = fixture.handler.on_price_change(fixture.price_key, callback);
        assert!(lock(&fixture.handler.registry).prices.is_empty());
    }
}
