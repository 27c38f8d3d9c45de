use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use log::debug;
use serde::Serialize;

use crate::host::ManualUpdate;

/// Oldest records are dropped once the history grows past this.
const HISTORY_LIMIT: usize = 512;

/// Everything the pipeline reports to the UI.
///
/// Serialized with a `type` tag in kebab-case, e.g.
/// `{"type":"installed-module","name":"voice","succeeded":true}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum UpdateEvent {
    DownloadingModule {
        name: String,
        cur: u64,
        total: u64,
    },
    DownloadedModule {
        name: String,
        succeeded: bool,
        received_bytes: u64,
    },
    Downloaded {
        failed: usize,
    },
    InstallingModule {
        name: String,
        cur: u64,
        total: u64,
    },
    InstalledModule {
        name: String,
        succeeded: bool,
    },
    Installed {
        failed: usize,
    },
    /// Terminal event of a check cycle. `count` is absent when the call was
    /// debounced or the catalog could not be fetched.
    Checked {
        #[serde(skip_serializing_if = "Option::is_none")]
        count: Option<usize>,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        failed: bool,
    },
    Manual {
        payload: ManualUpdate,
    },
    UpdateError {
        error: String,
    },
    HostUpdated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    pub at: DateTime<Utc>,
    pub event: UpdateEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&UpdateEvent) + Send + Sync>;

#[derive(Default)]
struct BusState {
    next_id: u64,
    listeners: Vec<(SubscriptionId, Listener)>,
    history: Vec<EventRecord>,
}

/// Ordered listener list plus a timestamped history of emitted events.
#[derive(Default)]
pub struct EventBus {
    state: Mutex<BusState>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&UpdateEvent) + Send + Sync + 'static,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        state.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Subscribe with an unbounded channel, for consumers outside the async
    /// runtime. Events sent after the receiver is dropped are discarded.
    pub fn subscribe_channel(&self) -> (SubscriptionId, Receiver<UpdateEvent>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let id = self.subscribe(move |event| {
            let _ = sender.send(event.clone());
        });
        (id, receiver)
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let before = state.listeners.len();
        state.listeners.retain(|(existing, _)| *existing != id);
        state.listeners.len() != before
    }

    pub fn emit(&self, event: UpdateEvent) {
        debug!("Update event: {event:?}");
        let listeners: Vec<Listener> = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.history.len() >= HISTORY_LIMIT {
                state.history.remove(0);
            }
            state.history.push(EventRecord {
                at: Utc::now(),
                event: event.clone(),
            });
            state
                .listeners
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect()
        };

        for listener in listeners {
            listener(&event);
        }
    }

    /// Return every recorded event and clear the history.
    pub fn query_and_truncate_history(&self) -> Vec<EventRecord> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut state.history)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::{EventBus, HISTORY_LIMIT, UpdateEvent};

    #[test]
    fn events_serialize_with_kebab_tag_and_camel_fields() {
        let event = UpdateEvent::DownloadedModule {
            name: "voice".to_string(),
            succeeded: true,
            received_bytes: 42,
        };
        assert_eq!(
            serde_json::to_value(&event).expect("event should serialize"),
            json!({ "type": "downloaded-module", "name": "voice", "succeeded": true, "receivedBytes": 42 })
        );

        assert_eq!(
            serde_json::to_value(UpdateEvent::HostUpdated).expect("event should serialize"),
            json!({ "type": "host-updated" })
        );
    }

    #[test]
    fn checked_omits_absent_fields() {
        let debounced = UpdateEvent::Checked {
            count: None,
            failed: false,
        };
        let failed = UpdateEvent::Checked {
            count: None,
            failed: true,
        };

        assert_eq!(
            serde_json::to_value(&debounced).expect("event should serialize"),
            json!({ "type": "checked" })
        );
        assert_eq!(
            serde_json::to_value(&failed).expect("event should serialize"),
            json!({ "type": "checked", "failed": true })
        );
    }

    #[test]
    fn listeners_run_in_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |_| seen.lock().expect("lock").push(tag));
        }
        bus.emit(UpdateEvent::HostUpdated);

        assert_eq!(*seen.lock().expect("lock"), vec!["first", "second"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (id, receiver) = bus.subscribe_channel();

        bus.emit(UpdateEvent::Installed { failed: 0 });
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(UpdateEvent::Installed { failed: 1 });

        let received: Vec<UpdateEvent> = receiver.try_iter().collect();
        assert_eq!(received, vec![UpdateEvent::Installed { failed: 0 }]);
    }

    #[test]
    fn history_is_returned_then_cleared() {
        let bus = EventBus::new();
        bus.emit(UpdateEvent::HostUpdated);
        bus.emit(UpdateEvent::Downloaded { failed: 0 });

        let history = bus.query_and_truncate_history();
        assert_eq!(history.len(), 2);
        assert!(history[0].at <= history[1].at);
        assert_eq!(history[1].event, UpdateEvent::Downloaded { failed: 0 });
        assert!(bus.query_and_truncate_history().is_empty());
    }

    #[test]
    fn history_is_capped() {
        let bus = EventBus::new();
        for failed in 0..=HISTORY_LIMIT {
            bus.emit(UpdateEvent::Installed { failed });
        }

        let history = bus.query_and_truncate_history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].event, UpdateEvent::Installed { failed: 1 });
    }
}
