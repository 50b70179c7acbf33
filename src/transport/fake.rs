//! Scripted in-memory transport for exercising the connection core.

use super::{EventHandler, RemoteEvent, ServerAddress, SubscriptionId, Transport, TransportError};
use crate::model::{OutputStatus, VersionInfo};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Accept,
    RejectCredentials,
    Unreachable,
    Hang,
}

#[derive(Default)]
pub struct Calls {
    pub connect: u32,
    pub disconnect: u32,
    pub subscribe: u32,
    pub unsubscribe: u32,
    pub toggle_recording: u32,
}

struct Script {
    behavior: ConnectBehavior,
    status: OutputStatus,
    version: VersionInfo,
    fail_status_query: bool,
    during_reconcile: Vec<RemoteEvent>,
    gate: Option<Arc<Notify>>,
    last_address: Option<ServerAddress>,
    last_password: Option<String>,
    connected: bool,
    handlers: HashMap<SubscriptionId, Arc<dyn EventHandler>>,
    next_id: u64,
    calls: Calls,
}

pub struct FakeTransport {
    script: Mutex<Script>,
    /// Signalled every time `connect` is entered.
    pub entered: Notify,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script {
                behavior: ConnectBehavior::Accept,
                status: OutputStatus::default(),
                version: VersionInfo {
                    plugin_version: "5.4.2".to_string(),
                    server_version: "30.1.2".to_string(),
                },
                fail_status_query: false,
                during_reconcile: Vec::new(),
                gate: None,
                last_address: None,
                last_password: None,
                connected: false,
                handlers: HashMap::new(),
                next_id: 1,
                calls: Calls::default(),
            }),
            entered: Notify::new(),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        f(&mut self.script.lock().unwrap())
    }

    pub fn set_behavior(&self, behavior: ConnectBehavior) {
        self.with(|s| s.behavior = behavior);
    }

    pub fn set_status(&self, is_streaming: bool, is_recording: bool) {
        self.with(|s| {
            s.status = OutputStatus {
                is_streaming,
                is_recording,
            }
        });
    }

    pub fn fail_status_query(&self) {
        self.with(|s| s.fail_status_query = true);
    }

    /// Events emitted to subscribers while the version query is in flight.
    pub fn emit_during_reconcile(&self, events: Vec<RemoteEvent>) {
        self.with(|s| s.during_reconcile = events);
    }

    /// Makes `connect` wait until the returned notify is signalled.
    pub fn gate_connect(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.with(|s| s.gate = Some(gate.clone()));
        gate
    }

    pub fn emit(&self, event: RemoteEvent) {
        let handlers: Vec<_> = self.with(|s| s.handlers.values().cloned().collect());
        for handler in handlers {
            handler.handle(event.clone());
        }
    }

    pub fn handler_count(&self) -> usize {
        self.with(|s| s.handlers.len())
    }

    pub fn calls<R>(&self, f: impl FnOnce(&Calls) -> R) -> R {
        self.with(|s| f(&s.calls))
    }

    pub fn is_connected(&self) -> bool {
        self.with(|s| s.connected)
    }

    pub fn last_credentials(&self) -> (Option<ServerAddress>, Option<String>) {
        self.with(|s| (s.last_address.clone(), s.last_password.clone()))
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        address: &ServerAddress,
        password: Option<&str>,
    ) -> Result<(), TransportError> {
        let (behavior, gate) = self.with(|s| {
            s.calls.connect += 1;
            s.last_address = Some(address.clone());
            s.last_password = password.map(str::to_string);
            (s.behavior, s.gate.take())
        });
        self.entered.notify_one();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        match behavior {
            ConnectBehavior::Accept => {
                self.with(|s| s.connected = true);
                Ok(())
            }
            ConnectBehavior::RejectCredentials => {
                Err(TransportError::Auth("Authentication failed.".to_string()))
            }
            ConnectBehavior::Unreachable => Err(TransportError::Connect(
                "Connection refused (os error 111)".to_string(),
            )),
            ConnectBehavior::Hang => std::future::pending().await,
        }
    }

    async fn disconnect(&self) {
        self.with(|s| {
            s.calls.disconnect += 1;
            s.connected = false;
        });
    }

    fn subscribe(&self, handler: Arc<dyn EventHandler>) -> Result<SubscriptionId, TransportError> {
        self.with(|s| {
            if !s.connected {
                return Err(TransportError::NotConnected);
            }
            s.calls.subscribe += 1;
            let id = SubscriptionId(s.next_id);
            s.next_id += 1;
            s.handlers.insert(id, handler);
            Ok(id)
        })
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.with(|s| {
            s.calls.unsubscribe += 1;
            assert!(
                s.handlers.remove(&id).is_some(),
                "subscription {id:?} removed twice"
            );
        });
    }

    async fn version(&self) -> Result<VersionInfo, TransportError> {
        let (connected, version, events) =
            self.with(|s| (s.connected, s.version.clone(), std::mem::take(&mut s.during_reconcile)));
        if !connected {
            return Err(TransportError::NotConnected);
        }
        for event in events {
            self.emit(event);
        }
        Ok(version)
    }

    async fn output_status(&self) -> Result<OutputStatus, TransportError> {
        self.with(|s| {
            if !s.connected {
                Err(TransportError::NotConnected)
            } else if s.fail_status_query {
                Err(TransportError::Request("GetStreamStatus failed".to_string()))
            } else {
                Ok(s.status)
            }
        })
    }

    async fn toggle_recording(&self) -> Result<(), TransportError> {
        self.with(|s| {
            if !s.connected {
                return Err(TransportError::NotConnected);
            }
            s.calls.toggle_recording += 1;
            Ok(())
        })
    }
}
