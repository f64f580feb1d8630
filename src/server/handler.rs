//! Message handlers
//!
//! A [`Handler`] gets first refusal on every message a connection reads.
//! [`MessageHandler`] routes `<key>:<body>` messages to callbacks by key;
//! [`JsonMessageHandler`] does the same after decoding the body as JSON.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::conn::Connection;

/// Separator between routing key and body
pub const KEY_SEPARATOR: u8 = b':';

/// Pluggable message consumer
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle `message`; return true if it was consumed
    async fn handle(&self, conn: &Arc<Connection>, message: &[u8]) -> bool;
}

/// Reasons a message was not dispatched
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Message has no key separator")]
    MissingSeparator,

    #[error("Message key is not valid UTF-8")]
    InvalidKey,

    #[error("No handler registered for key {0:?}")]
    UnknownKey(String),

    #[error("Invalid JSON body for key {key:?}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Split `message` at the first separator into key and body
pub fn split_key(message: &[u8]) -> Result<(&str, &[u8]), DispatchError> {
    let pos = message
        .iter()
        .position(|&b| b == KEY_SEPARATOR)
        .ok_or(DispatchError::MissingSeparator)?;
    let key = std::str::from_utf8(&message[..pos]).map_err(|_| DispatchError::InvalidKey)?;
    Ok((key, &message[pos + 1..]))
}

type Route<T> = Arc<dyn Fn(Arc<Connection>, T) -> BoxFuture<'static, ()> + Send + Sync>;

/// Key to callback table shared by both handler flavours
struct RouteTable<T> {
    routes: RwLock<HashMap<String, Route<T>>>,
}

impl<T: Send + 'static> RouteTable<T> {
    fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
        }
    }

    async fn insert<F, Fut>(&self, key: String, callback: F)
    where
        F: Fn(Arc<Connection>, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let route: Route<T> = Arc::new(move |conn, body| Box::pin(callback(conn, body)));
        self.routes.write().await.insert(key, route);
    }

    async fn remove(&self, key: &str) -> bool {
        self.routes.write().await.remove(key).is_some()
    }

    /// Clone the route out so the lock is not held while it runs
    async fn lookup(&self, key: &str) -> Result<Route<T>, DispatchError> {
        self.routes
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownKey(key.to_string()))
    }

    async fn len(&self) -> usize {
        self.routes.read().await.len()
    }
}

/// Routes raw `<key>:<body>` messages to callbacks
pub struct MessageHandler {
    routes: RouteTable<Vec<u8>>,
}

impl MessageHandler {
    /// Create an empty handler
    pub fn new() -> Self {
        Self {
            routes: RouteTable::new(),
        }
    }

    /// Register `callback` for messages keyed `key`, replacing any previous one
    pub async fn add_handler<F, Fut>(&self, key: impl Into<String>, callback: F)
    where
        F: Fn(Arc<Connection>, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.routes.insert(key.into(), callback).await;
    }

    /// Unregister the callback for `key`
    pub async fn remove_handler(&self, key: &str) -> bool {
        self.routes.remove(key).await
    }

    /// Number of registered keys
    pub async fn len(&self) -> usize {
        self.routes.len().await
    }

    /// Route `message` to its callback, reporting why if it could not be
    pub async fn dispatch(&self, conn: &Arc<Connection>, message: &[u8]) -> Result<(), DispatchError> {
        let (key, body) = split_key(message)?;
        let route = self.routes.lookup(key).await?;
        route(Arc::clone(conn), body.to_vec()).await;
        Ok(())
    }
}

impl Default for MessageHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for MessageHandler {
    async fn handle(&self, conn: &Arc<Connection>, message: &[u8]) -> bool {
        match self.dispatch(conn, message).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Message on connection {} not handled: {}", conn.id(), e);
                false
            }
        }
    }
}

/// Routes `<key>:<json>` messages to callbacks taking a decoded JSON value
pub struct JsonMessageHandler {
    routes: RouteTable<Value>,
}

impl JsonMessageHandler {
    /// Create an empty handler
    pub fn new() -> Self {
        Self {
            routes: RouteTable::new(),
        }
    }

    /// Register `callback` for messages keyed `key`, replacing any previous one
    pub async fn add_handler<F, Fut>(&self, key: impl Into<String>, callback: F)
    where
        F: Fn(Arc<Connection>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.routes.insert(key.into(), callback).await;
    }

    /// Unregister the callback for `key`
    pub async fn remove_handler(&self, key: &str) -> bool {
        self.routes.remove(key).await
    }

    /// Number of registered keys
    pub async fn len(&self) -> usize {
        self.routes.len().await
    }

    /// Decode and route `message`, reporting why if it could not be
    pub async fn dispatch(&self, conn: &Arc<Connection>, message: &[u8]) -> Result<(), DispatchError> {
        let (key, body) = split_key(message)?;
        let route = self.routes.lookup(key).await?;
        let value: Value = serde_json::from_slice(body).map_err(|source| DispatchError::Decode {
            key: key.to_string(),
            source,
        })?;
        route(Arc::clone(conn), value).await;
        Ok(())
    }
}

impl Default for JsonMessageHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for JsonMessageHandler {
    async fn handle(&self, conn: &Arc<Connection>, message: &[u8]) -> bool {
        match self.dispatch(conn, message).await {
            Ok(()) => true,
            Err(e @ DispatchError::Decode { .. }) => {
                warn!("Error while decoding JSON on connection {}: {}", conn.id(), e);
                false
            }
            Err(e) => {
                debug!("Message on connection {} not handled: {}", conn.id(), e);
                false
            }
        }
    }
}
