//! High-level client API.

use crate::connection::{Connection, ConnectionConfig, ConnectionStatus};
use crate::error::ClientError;
use crate::subscription::SubscriptionManager;
use crate::transport::{Dialer, TcpDialer};
use respline_protocol::{ProtocolError, RespValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Existence condition for SET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetCondition {
    /// `XX`: only set the key if it already exists.
    IfExists,
    /// `NX`: only set the key if it does not exist.
    IfNotExists,
}

/// Optional SET arguments.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub condition: Option<SetCondition>,
    /// Sent as `PX <milliseconds>`.
    pub expire: Option<Duration>,
}

impl SetOptions {
    pub fn if_exists(mut self) -> Self {
        self.condition = Some(SetCondition::IfExists);
        self
    }

    pub fn if_not_exists(mut self) -> Self {
        self.condition = Some(SetCondition::IfNotExists);
        self
    }

    pub fn expire(mut self, ttl: Duration) -> Self {
        self.expire = Some(ttl);
        self
    }
}

/// High-level client for a Redis-compatible server.
///
/// Commands share one connection and never interleave on it; each channel
/// subscription runs on its own connection and task.
pub struct Client<D: Dialer = TcpDialer> {
    conn: Mutex<Connection<D>>,
    subscriptions: SubscriptionManager<D>,
}

impl Client<TcpDialer> {
    /// Connects to `host:port`.
    pub async fn connect(host: impl Into<String>, port: u16) -> Result<Self, ClientError> {
        Self::with_config(ConnectionConfig::new(host, port)).await
    }

    /// Connects to `host:port` and authenticates.
    ///
    /// A rejected password fails with [`ClientError::Server`], a network
    /// problem with one of the connection failure variants.
    pub async fn connect_with_password(
        host: impl Into<String>,
        port: u16,
        password: impl Into<String>,
    ) -> Result<Self, ClientError> {
        Self::with_config(ConnectionConfig::new(host, port).with_password(password)).await
    }

    /// Connects with a custom configuration.
    pub async fn with_config(config: ConnectionConfig) -> Result<Self, ClientError> {
        Self::with_dialer(config, TcpDialer).await
    }
}

impl<D: Dialer> Client<D> {
    /// Connects through a custom dialer.
    pub async fn with_dialer(config: ConnectionConfig, dialer: D) -> Result<Self, ClientError> {
        let dialer = Arc::new(dialer);
        let conn = Connection::open(config, Arc::clone(&dialer)).await?;
        Ok(Self {
            conn: Mutex::new(conn),
            subscriptions: SubscriptionManager::new(dialer),
        })
    }

    /// Sends a raw command and returns its reply.
    pub async fn send<A: AsRef<[u8]>>(
        &self,
        name: &str,
        args: &[A],
    ) -> Result<RespValue, ClientError> {
        self.conn.lock().await.send(name, args).await
    }

    /// Returns whether the primary connection holds a live socket.
    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_connected()
    }

    /// Closes the primary connection and every subscription. Safe to call
    /// more than once.
    pub async fn close(&self) {
        self.subscriptions.close_all();
        self.conn.lock().await.close().await;
    }

    // =========================================================================
    // Connection commands
    // =========================================================================

    /// Sends AUTH and returns the raw reply; a rejected password is an error.
    pub async fn auth(&self, password: &str) -> Result<RespValue, ClientError> {
        self.conn.lock().await.auth(password).await
    }

    /// Sends AUTH and reports whether the password was accepted.
    ///
    /// Only a server-side rejection maps to `false`; connection failures are
    /// still returned as errors.
    pub async fn check_auth(&self, password: &str) -> Result<bool, ClientError> {
        match self.auth(password).await {
            Ok(reply) => Ok(reply.is_ok()),
            Err(e) if e.is_server_error() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Pings the server.
    pub async fn ping(&self) -> Result<String, ClientError> {
        Ok(self.send::<&str>("PING", &[]).await?.into_text()?)
    }

    /// Selects the logical database; later reconnects select it again.
    pub async fn select(&self, index: i64) -> Result<(), ClientError> {
        let mut conn = self.conn.lock().await;
        expect_ok(conn.send("SELECT", &[index.to_string()]).await?)?;
        conn.config_mut().database = Some(index);
        Ok(())
    }

    /// Names this connection; later reconnects set the name again.
    pub async fn client_setname(&self, name: &str) -> Result<(), ClientError> {
        let mut conn = self.conn.lock().await;
        expect_ok(conn.send("CLIENT", &["SETNAME", name]).await?)?;
        conn.config_mut().client_name = Some(name.to_string());
        Ok(())
    }

    // =========================================================================
    // String commands
    // =========================================================================

    /// Gets the value of a key, or `None` if it does not exist.
    pub async fn get(&self, key: &str) -> Result<Option<String>, ClientError> {
        Ok(self.send("GET", &[key]).await?.into_optional_text()?)
    }

    /// Sets a key unconditionally.
    pub async fn set(&self, key: &str, value: &str) -> Result<(), ClientError> {
        self.set_with(key, value, SetOptions::default()).await?;
        Ok(())
    }

    /// Sets a key with an existence condition and/or expiry.
    ///
    /// Returns false when the condition was not met.
    pub async fn set_with(
        &self,
        key: &str,
        value: &str,
        options: SetOptions,
    ) -> Result<bool, ClientError> {
        let mut args = vec![key.to_string(), value.to_string()];
        match options.condition {
            Some(SetCondition::IfExists) => args.push("XX".to_string()),
            Some(SetCondition::IfNotExists) => args.push("NX".to_string()),
            None => {}
        }
        if let Some(ttl) = options.expire {
            args.push("PX".to_string());
            args.push(ttl.as_millis().to_string());
        }

        let reply = self.send("SET", &args).await?;
        if reply.is_null() {
            return Ok(false);
        }
        expect_ok(reply)?;
        Ok(true)
    }

    /// Increments the integer stored at a key.
    pub async fn incr(&self, key: &str) -> Result<i64, ClientError> {
        Ok(self.send("INCR", &[key]).await?.as_int()?)
    }

    /// Deletes keys; returns how many existed.
    pub async fn del(&self, keys: &[&str]) -> Result<i64, ClientError> {
        Ok(self.send("DEL", keys).await?.as_int()?)
    }

    // =========================================================================
    // Set commands
    // =========================================================================

    /// Adds members to a set; returns how many were new.
    pub async fn sadd(&self, key: &str, members: &[&str]) -> Result<i64, ClientError> {
        let args = with_key(key, members);
        Ok(self.send("SADD", &args).await?.as_int()?)
    }

    /// Returns every member of a set, in server order.
    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, ClientError> {
        let items = self.send("SMEMBERS", &[key]).await?.into_array()?;
        Ok(items
            .into_iter()
            .map(RespValue::into_text)
            .collect::<Result<Vec<_>, _>>()?)
    }

    // =========================================================================
    // List commands
    // =========================================================================

    /// Pushes values onto the head of a list; returns the new length.
    pub async fn lpush(&self, key: &str, values: &[&str]) -> Result<i64, ClientError> {
        let args = with_key(key, values);
        Ok(self.send("LPUSH", &args).await?.as_int()?)
    }

    /// Pops the head of a list, or `None` if the list is empty or missing.
    pub async fn lpop(&self, key: &str) -> Result<Option<String>, ClientError> {
        Ok(self.send("LPOP", &[key]).await?.into_optional_text()?)
    }

    // =========================================================================
    // Hash commands
    // =========================================================================

    /// Sets one hash field; returns 1 if the field is new, 0 if updated.
    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<i64, ClientError> {
        Ok(self.send("HSET", &[key, field, value]).await?.as_int()?)
    }

    /// Gets one hash field, or `None` if the field or key is missing.
    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, ClientError> {
        Ok(self.send("HGET", &[key, field]).await?.into_optional_text()?)
    }

    /// Gets every field and value of a hash.
    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, ClientError> {
        let items = self.send("HGETALL", &[key]).await?.into_array()?;
        if items.len() % 2 != 0 {
            return Err(ProtocolError::MalformedEncoding(format!(
                "HGETALL returned {} elements, expected field/value pairs",
                items.len()
            ))
            .into());
        }

        let mut map = HashMap::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            map.insert(field.into_text()?, value.into_text()?);
        }
        Ok(map)
    }

    // =========================================================================
    // Pub/sub
    // =========================================================================

    /// Publishes a message; returns the number of subscribers that got it.
    pub async fn publish(&self, channel: &str, message: &str) -> Result<i64, ClientError> {
        Ok(self.send("PUBLISH", &[channel, message]).await?.as_int()?)
    }

    /// Subscribes to a channel on a dedicated connection.
    ///
    /// Fails with [`ClientError::NotConnected`] once the client is closed.
    ///
    /// `callback` runs on the subscription's own task for every pushed frame.
    /// See [`SubscriptionManager::subscribe`].
    pub async fn subscribe<F>(&self, channel: &str, callback: F) -> Result<(), ClientError>
    where
        F: FnMut(Result<RespValue, ClientError>) + Send + 'static,
    {
        let config = {
            let conn = self.conn.lock().await;
            if conn.status() == ConnectionStatus::Closed {
                return Err(ClientError::NotConnected);
            }
            conn.config().clone()
        };
        self.subscriptions.subscribe(&config, channel, callback).await
    }

    /// Stops a subscription; returns false if the channel was not subscribed.
    pub fn unsubscribe(&self, channel: &str) -> bool {
        self.subscriptions.unsubscribe(channel)
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.is_subscribed(channel)
    }
}

fn with_key<'a>(key: &'a str, rest: &[&'a str]) -> Vec<&'a str> {
    let mut args = Vec::with_capacity(rest.len() + 1);
    args.push(key);
    args.extend_from_slice(rest);
    args
}

fn expect_ok(reply: RespValue) -> Result<(), ClientError> {
    if reply.is_ok() {
        Ok(())
    } else {
        Err(ProtocolError::TypeMismatch {
            expected: "OK status",
            found: reply.kind(),
        }
        .into())
    }
}
