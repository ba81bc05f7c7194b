//! In-process fan-out of ingested events to local subscribers.
//!
//! Slow subscribers are evicted, never queued: a local dashboard can
//! reconnect and replay from the index service, while the proxy must
//! not grow unbounded. Subscriber ids are a single-holder resource:
//! subscribing again with a live id closes the previous holder.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use histwire_event::Event;
use tokio::io::{AsyncWrite, AsyncWriteExt as _};
use tokio::sync::RwLock;

const WRITE_DEADLINE: Duration = Duration::from_millis(100);

pub type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared with the subscriber handler, which interleaves control
/// responses (`SUBSCRIBED`, `PONG`) with published events.
pub type SharedSink = Arc<tokio::sync::Mutex<Sink>>;

/// Identifies one `subscribe` call. Removal is token-checked so a
/// stale handler cleaning up after its id was taken over cannot evict
/// the new holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken(u64);

struct Subscriber {
    token: SubscriptionToken,
    sink: SharedSink,
    filter: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HubStats {
    /// Currently registered subscribers.
    pub subscribers: usize,
    /// `subscribe` calls over the hub's lifetime.
    pub total_subscribes: u64,
    /// Events published (parsed and offered to subscribers).
    pub total_published: u64,
}

#[derive(Default)]
struct Counters {
    total_subscribes: u64,
    total_published: u64,
    next_token: u64,
}

pub struct Hub {
    subscribers: RwLock<HashMap<String, Subscriber>>,
    counters: parking_lot::Mutex<Counters>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            counters: parking_lot::Mutex::new(Counters::default()),
        }
    }

    /// Registers `sink` under `id`, shutting down any previous holder
    /// of the same id first.
    pub async fn subscribe(&self, id: String, sink: Sink, filter: HashMap<String, String>) -> (SubscriptionToken, SharedSink) {
        let token = {
            let mut counters = self.counters.lock();
            counters.total_subscribes += 1;
            counters.next_token += 1;
            SubscriptionToken(counters.next_token)
        };

        let sink = Arc::new(tokio::sync::Mutex::new(sink));

        let previous = {
            let mut subscribers = self.subscribers.write().await;

            subscribers.insert(
                id.clone(),
                Subscriber {
                    token,
                    sink: Arc::clone(&sink),
                    filter,
                },
            )
        };

        if let Some(previous) = previous {
            debug!(%id, "Replacing subscriber");
            close_sink(&previous.sink).await;
        }

        (token, sink)
    }

    /// Removes `id` whoever holds it. Idempotent.
    pub async fn unsubscribe(&self, id: &str) {
        let removed = self.subscribers.write().await.remove(id);

        if let Some(subscriber) = removed {
            close_sink(&subscriber.sink).await;
        }
    }

    /// Removes `id` only if it is still held by `token`.
    pub async fn unsubscribe_token(&self, id: &str, token: SubscriptionToken) {
        let mut subscribers = self.subscribers.write().await;

        let removed = match subscribers.get(id) {
            Some(subscriber) if subscriber.token == token => subscribers.remove(id),
            _ => None,
        };

        drop(subscribers);

        if let Some(subscriber) = removed {
            close_sink(&subscriber.sink).await;
        }
    }

    /// Delivers `record` to every subscriber whose filter matches.
    ///
    /// The record is parsed once; if it doesn't parse, nobody
    /// receives it and the publish counter is unchanged. Each matching
    /// subscriber gets one bounded write; a write error or deadline
    /// marks it dead, and dead subscribers are removed after the pass.
    pub async fn publish(&self, record: &[u8]) {
        let Ok(event) = Event::decode_line(record) else {
            return;
        };

        self.counters.lock().total_published += 1;

        let mut dead = Vec::new();

        {
            let subscribers = self.subscribers.read().await;

            for (id, subscriber) in subscribers.iter() {
                if !filter_matches(&subscriber.filter, &event) {
                    continue;
                }

                let delivery = tokio::time::timeout(WRITE_DEADLINE, async {
                    let mut sink = subscriber.sink.lock().await;
                    sink.write_all(record).await?;
                    sink.write_all(b"\n").await?;
                    sink.flush().await
                })
                .await;

                match delivery {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        warn!(%id, %error, "Subscriber write failed, evicting");
                        dead.push((id.clone(), subscriber.token));
                    }
                    Err(_elapsed) => {
                        warn!(%id, "Subscriber write deadline elapsed, evicting");
                        dead.push((id.clone(), subscriber.token));
                    }
                }
            }
        }

        for (id, token) in dead {
            self.unsubscribe_token(&id, token).await;
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn stats(&self) -> HubStats {
        let subscribers = self.subscriber_count().await;
        let counters = self.counters.lock();

        HubStats {
            subscribers,
            total_subscribes: counters.total_subscribes,
            total_published: counters.total_published,
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

fn filter_matches(filter: &HashMap<String, String>, event: &Event) -> bool {
    filter
        .iter()
        .all(|(field, expected)| event.field_as_string(field).as_deref() == Some(expected.as_str()))
}

async fn close_sink(sink: &SharedSink) {
    let shutdown = tokio::time::timeout(WRITE_DEADLINE, async {
        sink.lock().await.shutdown().await
    })
    .await;

    if let Ok(Err(error)) = shutdown {
        debug!(%error, "Subscriber sink didn’t shut down cleanly");
    }
}
