//! Bus client - MQTT Connectivity and Subscription Registry
//!
//! ## Responsibilities
//!
//! - Own the broker connection; reconnect with a fixed backoff
//! - Keep the subscription registry (topic -> feed channel) and connect
//!   hooks, and replay both on every (re)connect
//! - Publish at QoS 0 non-retained; announce liveness on `hab/online`
//!
//! On every ConnAck the client, in order: publishes `"online"` on the
//! liveness topic, re-installs all registered subscriptions, then runs
//! every connect hook in registration order. A subscription failure is
//! fatal: a mis-subscribed process cannot produce correct verdicts.

use crate::error::{Error, Result};
use crate::settings::Settings;
use bytes::Bytes;
use futures::future::BoxFuture;
use rand::Rng;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Topic every controller instance announces itself on.
pub const LIVENESS_TOPIC: &str = "hab/online";

const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";

/// Interval between liveness re-announcements.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(10);

/// Backoff between reconnect attempts after a connection error.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// An inbound message handed to a subscription's feed channel.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// A hook run after every (re)connect, e.g. re-advertising discovery
/// records. Hooks are awaited sequentially in registration order.
pub type ConnectHook = Arc<dyn Fn(AsyncClient) -> BoxFuture<'static, ()> + Send + Sync>;

type SubscriptionMap = HashMap<String, mpsc::Sender<BusMessage>>;

pub struct BusClient {
    settings: Arc<Settings>,
    subscriptions: Arc<RwLock<SubscriptionMap>>,
    connect_hooks: Arc<RwLock<Vec<(String, ConnectHook)>>>,
    active: RwLock<Option<AsyncClient>>,
    /// Bumped by `reinit`; the event-loop task for a stale generation
    /// notices and exits.
    generation: Arc<AtomicU64>,
}

impl BusClient {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            connect_hooks: Arc::new(RwLock::new(Vec::new())),
            active: RwLock::new(None),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replace the subscription set so it exactly matches `topics`, all
    /// feeding the same channel. Topics no longer present are
    /// unsubscribed; new ones are subscribed when a connection is up
    /// (and re-installed on every ConnAck regardless).
    pub async fn replace_subscriptions(
        &self,
        topics: Vec<String>,
        feed: mpsc::Sender<BusMessage>,
    ) {
        let (added, removed) = {
            let mut subs = self.subscriptions.write().expect("subscriptions poisoned");
            let removed: Vec<String> = subs
                .keys()
                .filter(|t| !topics.iter().any(|n| n == *t))
                .cloned()
                .collect();
            let added: Vec<String> = topics
                .iter()
                .filter(|t| !subs.contains_key(*t))
                .cloned()
                .collect();
            subs.clear();
            for topic in &topics {
                subs.insert(topic.clone(), feed.clone());
            }
            (added, removed)
        };

        let client = self.client();
        if let Some(client) = client {
            for topic in removed {
                if let Err(e) = client.unsubscribe(&topic).await {
                    tracing::warn!(topic = %topic, error = %e, "error unsubscribing");
                }
            }
            for topic in added {
                subscribe_or_die(&client, &topic).await;
            }
        }
    }

    /// Topics currently registered, for the subscription-closure check.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscriptions
            .read()
            .expect("subscriptions poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Register a connect hook by name. Re-registering a name replaces the
    /// hook in place, keeping its position in the run order.
    pub fn register_connect_hook(&self, name: &str, hook: ConnectHook) {
        let mut hooks = self.connect_hooks.write().expect("hooks poisoned");
        if let Some(entry) = hooks.iter_mut().find(|(n, _)| n == name) {
            entry.1 = hook;
        } else {
            hooks.push((name.to_string(), hook));
        }
    }

    /// Remove a connect hook by name.
    pub fn remove_connect_hook(&self, name: &str) {
        self.connect_hooks
            .write()
            .expect("hooks poisoned")
            .retain(|(n, _)| n != name);
    }

    /// Names of registered connect hooks in run order.
    pub fn connect_hook_names(&self) -> Vec<String> {
        self.connect_hooks
            .read()
            .expect("hooks poisoned")
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// (Re)connect to the broker configured by `broker_uri`. Tears down
    /// any previous connection. Resolves once the first ConnAck of the new
    /// connection arrives; an initial connect failure is returned to the
    /// caller (and is fatal per the error-handling policy).
    pub async fn reinit(&self) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let old = self.active.write().expect("active poisoned").take();
        if let Some(old) = old {
            tracing::debug!("bus client exists - destroying");
            let _ = old.disconnect().await;
        }

        let (host, port) = parse_broker_uri(&self.settings.get_string("broker_uri"))?;
        let client_id = format!("{}_{}", self.settings.get_string("id_base"), rand_letters(6));

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(self.settings.get_bool("cleansess"));
        let username = self.settings.get_string("username");
        if !username.is_empty() {
            options.set_credentials(username, self.settings.get_string("password"));
        }
        options.set_last_will(LastWill::new(
            LIVENESS_TOPIC,
            PAYLOAD_OFFLINE,
            QoS::AtMostOnce,
            false,
        ));

        // the request queue must hold the whole on-connect burst
        // (resubscribes + discovery publishes) because the event loop is
        // not polling while the connect sequence runs
        let (client, event_loop) = AsyncClient::new(options, 512);
        *self.active.write().expect("active poisoned") = Some(client.clone());

        let (ready_tx, ready_rx) = oneshot::channel();
        let subscriptions = self.subscriptions.clone();
        let connect_hooks = self.connect_hooks.clone();
        let generations = self.generation.clone();
        tokio::spawn(run_event_loop(
            event_loop,
            client,
            subscriptions,
            connect_hooks,
            generations,
            generation,
            ready_tx,
        ));

        match ready_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Internal(format!("bus connect failed: {}", e))),
            Err(_) => Err(Error::Internal("bus event loop exited early".to_string())),
        }
    }

    /// Publish at QoS 0, non-retained. Awaits hand-off to the event loop,
    /// which is the designed backpressure point against a slow broker.
    pub async fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        let Some(client) = self.client() else {
            return Err(Error::Internal("bus client not connected".to_string()));
        };
        client
            .publish(topic, QoS::AtMostOnce, false, payload.into())
            .await?;
        Ok(())
    }

    fn client(&self) -> Option<AsyncClient> {
        self.active.read().expect("active poisoned").clone()
    }
}

/// Announce liveness every 10 seconds for as long as the process runs.
pub fn spawn_liveness_task(bus: Arc<BusClient>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LIVENESS_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = bus.publish(LIVENESS_TOPIC, PAYLOAD_ONLINE).await {
                tracing::error!(error = %e, "error publishing online message");
            }
        }
    })
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    subscriptions: Arc<RwLock<SubscriptionMap>>,
    connect_hooks: Arc<RwLock<Vec<(String, ConnectHook)>>>,
    generations: Arc<AtomicU64>,
    generation: u64,
    ready_tx: oneshot::Sender<std::result::Result<(), rumqttc::ConnectionError>>,
) {
    let mut ready = Some(ready_tx);
    loop {
        if generations.load(Ordering::SeqCst) != generation {
            tracing::debug!(generation, "bus event loop superseded, exiting");
            return;
        }
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("connected to broker");
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
                on_connect(&client, &subscriptions, &connect_hooks).await;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let feed = subscriptions
                    .read()
                    .expect("subscriptions poisoned")
                    .get(&publish.topic)
                    .cloned();
                match feed {
                    Some(feed) => {
                        let msg = BusMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.clone(),
                        };
                        // a full stage channel blocks the event loop here:
                        // overload propagates to the broker instead of
                        // silently dropping snapshots
                        if feed.send(msg).await.is_err() {
                            tracing::error!(topic = %publish.topic, "ingest feed closed");
                        }
                    }
                    None => {
                        tracing::warn!(topic = %publish.topic, "received message but no handler");
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                if let Some(tx) = ready.take() {
                    // never connected: report to the caller and stop
                    let _ = tx.send(Err(e));
                    return;
                }
                tracing::info!(error = %e, "connection lost");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        }
    }
}

/// The on-connect sequence: liveness publish, resubscribe, hooks in order.
async fn on_connect(
    client: &AsyncClient,
    subscriptions: &Arc<RwLock<SubscriptionMap>>,
    connect_hooks: &Arc<RwLock<Vec<(String, ConnectHook)>>>,
) {
    if let Err(e) = client
        .publish(LIVENESS_TOPIC, QoS::AtMostOnce, false, PAYLOAD_ONLINE)
        .await
    {
        tracing::error!(error = %e, "error publishing online message");
    }

    let topics: Vec<String> = subscriptions
        .read()
        .expect("subscriptions poisoned")
        .keys()
        .cloned()
        .collect();
    for topic in topics {
        subscribe_or_die(client, &topic).await;
    }

    let hooks: Vec<(String, ConnectHook)> = connect_hooks
        .read()
        .expect("hooks poisoned")
        .clone();
    for (name, hook) in hooks {
        tracing::debug!(hook = %name, "running connect hook");
        hook(client.clone()).await;
    }
}

async fn subscribe_or_die(client: &AsyncClient, topic: &str) {
    if let Err(e) = client.subscribe(topic, QoS::AtMostOnce).await {
        // a mis-subscribed process would silently publish wrong verdicts
        tracing::error!(topic = %topic, error = %e, "error subscribing");
        std::process::exit(1);
    }
}

/// Parse a broker URI of the form `[tcp://|mqtt://]host[:port]`.
fn parse_broker_uri(uri: &str) -> Result<(String, u16)> {
    let mut remainder = uri.trim();
    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "tcp" | "mqtt" => {}
            other => {
                return Err(Error::Internal(format!(
                    "unsupported broker scheme: {}",
                    other
                )))
            }
        }
        remainder = rest;
    }
    match remainder.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| Error::Internal(format!("invalid broker port in {}", uri)))?;
            Ok((host.to_string(), port))
        }
        None => Ok((remainder.to_string(), 1883)),
    }
}

fn rand_letters(n: usize) -> String {
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
        .collect()
}
