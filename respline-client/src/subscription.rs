//! Publish/subscribe delivery.
//!
//! Every subscribed channel gets its own transport and its own background
//! task. The task reads pushed frames and hands each one to the channel's
//! callback, so nothing here ever touches the primary connection's socket.
//!
//! ```text
//! subscribe()                      unsubscribe() / socket death
//!   Unsubscribed ──► Active (task running) ──► Terminated (entry removed)
//! ```

use crate::connection::{exchange, into_result, ConnectionConfig};
use crate::error::ClientError;
use crate::transport::{Dialer, TcpDialer, Transport};
use dashmap::DashMap;
use respline_protocol::{Decoder, Encoder, RespValue};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

type Registry = DashMap<String, Subscription>;

/// A live subscription's handle in the registry.
struct Subscription {
    id: u64,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Subscription {
    /// Signals the task to close its transport. Does not wait for it.
    fn cancel(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Owns the channel → subscription map.
///
/// Dropping the manager drops every shutdown handle, which ends every task.
pub struct SubscriptionManager<D: Dialer = TcpDialer> {
    dialer: Arc<D>,
    subscriptions: Arc<Registry>,
    next_id: AtomicU64,
}

impl<D: Dialer> SubscriptionManager<D> {
    pub fn new(dialer: Arc<D>) -> Self {
        Self {
            dialer,
            subscriptions: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Opens a dedicated transport, sends SUBSCRIBE and starts delivering
    /// pushed frames to `callback`.
    ///
    /// When `config` carries a password, AUTH runs first and anything other
    /// than `+OK` fails the call with [`ClientError::NotAuthorized`]. The
    /// callback runs on the subscription's task and receives every frame,
    /// starting with the server's subscribe confirmation. Subscribing again
    /// to the same channel replaces the previous subscription.
    pub async fn subscribe<F>(
        &self,
        config: &ConnectionConfig,
        channel: &str,
        callback: F,
    ) -> Result<(), ClientError>
    where
        F: FnMut(Result<RespValue, ClientError>) + Send + 'static,
    {
        let mut transport = self.dialer.dial(config).await?;
        let mut decoder = Decoder::new();

        if let Err(e) = preflight(&mut transport, &mut decoder, config, channel).await {
            transport.close().await;
            return Err(e);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let subscription = Subscription {
            id,
            shutdown: Some(shutdown_tx),
        };
        if let Some(mut previous) = self.subscriptions.insert(channel.to_string(), subscription)
        {
            tracing::debug!("Replacing existing subscription to {}", channel);
            previous.cancel();
        }

        tracing::debug!("Subscribed to {} (id={})", channel, id);
        tokio::spawn(run_subscription(
            channel.to_string(),
            id,
            transport,
            decoder,
            shutdown_rx,
            callback,
            Arc::downgrade(&self.subscriptions),
        ));
        Ok(())
    }

    /// Stops delivery for `channel`. Returns false if it was not subscribed.
    ///
    /// The task closes the transport on its own schedule; a frame already
    /// being handled may still reach the callback.
    pub fn unsubscribe(&self, channel: &str) -> bool {
        match self.subscriptions.remove(channel) {
            Some((_, mut subscription)) => {
                tracing::debug!("Unsubscribing from {}", channel);
                subscription.cancel();
                true
            }
            None => false,
        }
    }

    /// Stops every subscription.
    pub fn close_all(&self) {
        self.subscriptions.retain(|channel, subscription| {
            tracing::debug!("Closing subscription to {}", channel);
            subscription.cancel();
            false
        });
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.contains_key(channel)
    }

    /// Returns the currently subscribed channel names.
    pub fn channels(&self) -> Vec<String> {
        self.subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

async fn preflight(
    transport: &mut Transport,
    decoder: &mut Decoder,
    config: &ConnectionConfig,
    channel: &str,
) -> Result<(), ClientError> {
    if let Some(password) = &config.password {
        let frame = Encoder::encode_command("AUTH", &[password.as_str()]);
        let reply = exchange(transport, decoder, &frame).await?;
        if !reply.is_ok() {
            let reason = match reply.first_error() {
                Some(message) => message.to_string(),
                None => format!("unexpected AUTH reply: {}", reply),
            };
            return Err(ClientError::NotAuthorized(reason));
        }
    }

    transport
        .write(&Encoder::encode_command("SUBSCRIBE", &[channel]))
        .await
}

async fn run_subscription<F>(
    channel: String,
    id: u64,
    mut transport: Transport,
    mut decoder: Decoder,
    mut shutdown: oneshot::Receiver<()>,
    mut callback: F,
    registry: Weak<Registry>,
) where
    F: FnMut(Result<RespValue, ClientError>) + Send + 'static,
{
    loop {
        loop {
            match decoder.decode_reply() {
                Ok(Some(frame)) => callback(into_result(frame)),
                Ok(None) => break,
                Err(e) => {
                    // The decoder dropped the bad bytes; keep listening.
                    tracing::warn!("Undecodable frame on {}: {}", channel, e);
                    callback(Err(e.into()));
                }
            }
        }

        tokio::select! {
            _ = &mut shutdown => {
                tracing::debug!("Subscription to {} cancelled", channel);
                transport.close().await;
                return;
            }
            read = transport.read() => match read {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => decoder.extend(&chunk),
                Err(e) => {
                    callback(Err(e));
                    break;
                }
            }
        }

        if !transport.is_alive() {
            break;
        }
    }

    tracing::debug!("Subscription to {} ended: transport closed", channel);
    transport.close().await;
    if let Some(registry) = registry.upgrade() {
        registry.remove_if(&channel, |_, subscription| subscription.id == id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeServer, MemoryDialer};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn message(channel: &str, payload: &str) -> RespValue {
        RespValue::from(vec!["message", channel, payload])
    }

    fn forward(
        tx: mpsc::UnboundedSender<Result<RespValue, ClientError>>,
    ) -> impl FnMut(Result<RespValue, ClientError>) + Send + 'static {
        move |frame| {
            let _ = tx.send(frame);
        }
    }

    async fn recv(
        rx: &mut mpsc::UnboundedReceiver<Result<RespValue, ClientError>>,
    ) -> Result<RespValue, ClientError> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("callback not invoked")
            .expect("callback dropped")
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_subscribe_delivers_messages() {
        let dialer = MemoryDialer::new();
        let mut server = FakeServer::new(dialer.push_pipe());
        let manager = SubscriptionManager::new(Arc::new(dialer.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        manager
            .subscribe(&ConnectionConfig::default(), "news", forward(tx))
            .await
            .unwrap();
        assert!(manager.is_subscribed("news"));

        assert_eq!(
            server.next_command().await.unwrap(),
            vec!["SUBSCRIBE", "news"]
        );
        server
            .reply(&RespValue::Array(vec![
                RespValue::from("subscribe"),
                RespValue::from("news"),
                RespValue::Integer(1),
            ]))
            .await;
        server.reply(&message("news", "hello")).await;

        let confirmation = recv(&mut rx).await.unwrap();
        assert_eq!(confirmation.as_array().unwrap()[0].as_text().unwrap(), "subscribe");

        let pushed = recv(&mut rx).await.unwrap();
        let parts = pushed.as_array().unwrap();
        assert_eq!(parts[0].as_text().unwrap(), "message");
        assert_eq!(parts[2].as_text().unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_transport() {
        let dialer = MemoryDialer::new();
        let mut server = FakeServer::new(dialer.push_pipe());
        let manager = SubscriptionManager::new(Arc::new(dialer.clone()));
        let (tx, _rx) = mpsc::unbounded_channel();

        manager
            .subscribe(&ConnectionConfig::default(), "news", forward(tx))
            .await
            .unwrap();
        server.next_command().await.unwrap();

        assert!(manager.unsubscribe("news"));
        assert!(!manager.is_subscribed("news"));
        assert!(!manager.unsubscribe("news"));

        // The task shuts its transport down, which the server sees as EOF.
        let eof = tokio::time::timeout(Duration::from_secs(5), server.next_command())
            .await
            .unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_decode_error_does_not_end_subscription() {
        let dialer = MemoryDialer::new();
        let mut server = FakeServer::new(dialer.push_pipe());
        let manager = SubscriptionManager::new(Arc::new(dialer.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        manager
            .subscribe(&ConnectionConfig::default(), "news", forward(tx))
            .await
            .unwrap();
        server.next_command().await.unwrap();

        server.reply_raw(b"%bogus\r\n").await;
        let err = recv(&mut rx).await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));

        server.reply(&message("news", "still here")).await;
        let pushed = recv(&mut rx).await.unwrap();
        assert_eq!(pushed.as_array().unwrap()[2].as_text().unwrap(), "still here");
        assert!(manager.is_subscribed("news"));
    }

    #[tokio::test]
    async fn test_error_frame_is_delivered_as_error() {
        let dialer = MemoryDialer::new();
        let mut server = FakeServer::new(dialer.push_pipe());
        let manager = SubscriptionManager::new(Arc::new(dialer.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        manager
            .subscribe(&ConnectionConfig::default(), "news", forward(tx))
            .await
            .unwrap();
        server.next_command().await.unwrap();

        server.reply(&RespValue::Error("ERR pubsub".into())).await;
        let err = recv(&mut rx).await.unwrap_err();
        assert!(err.is_server_error());
    }

    #[tokio::test]
    async fn test_socket_death_removes_entry() {
        let dialer = MemoryDialer::new();
        let mut server = FakeServer::new(dialer.push_pipe());
        let manager = SubscriptionManager::new(Arc::new(dialer.clone()));
        let (tx, _rx) = mpsc::unbounded_channel();

        manager
            .subscribe(&ConnectionConfig::default(), "news", forward(tx))
            .await
            .unwrap();
        server.next_command().await.unwrap();
        drop(server);

        wait_until(|| !manager.is_subscribed("news")).await;
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_read_error_delivered_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ConnectionConfig::new("127.0.0.1", listener.local_addr().unwrap().port());
        let manager = SubscriptionManager::new(Arc::new(TcpDialer));
        let (tx, mut rx) = mpsc::unbounded_channel();

        manager.subscribe(&config, "news", forward(tx)).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        // Zero linger turns the close into a reset.
        stream.set_linger(Some(Duration::ZERO)).unwrap();
        let mut server = FakeServer::new(stream);
        assert_eq!(
            server.next_command().await.unwrap(),
            vec!["SUBSCRIBE", "news"]
        );
        drop(server);

        let err = recv(&mut rx).await.unwrap_err();
        assert!(matches!(err, ClientError::Io(_)));

        // The loop exited: no second error, and the callback was dropped.
        let next = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert!(next.is_none());
        wait_until(|| !manager.is_subscribed("news")).await;
    }

    #[tokio::test]
    async fn test_preflight_auth_rejected() {
        let dialer = MemoryDialer::new();
        let mut server = FakeServer::new(dialer.push_pipe());
        let manager = SubscriptionManager::new(Arc::new(dialer.clone()));
        let config = ConnectionConfig::default().with_password("wrong");

        let server_task = tokio::spawn(async move {
            assert_eq!(server.next_command().await.unwrap(), vec!["AUTH", "wrong"]);
            server
                .reply(&RespValue::Error("WRONGPASS invalid password".into()))
                .await;
            server
        });

        let err = manager
            .subscribe(&config, "news", |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotAuthorized(ref m) if m.contains("WRONGPASS")));
        assert!(!manager.is_subscribed("news"));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_preflight_auth_accepted() {
        let dialer = MemoryDialer::new();
        let mut server = FakeServer::new(dialer.push_pipe());
        let manager = SubscriptionManager::new(Arc::new(dialer.clone()));
        let config = ConnectionConfig::default().with_password("secret");

        let server_task = tokio::spawn(async move {
            assert_eq!(server.next_command().await.unwrap(), vec!["AUTH", "secret"]);
            server.reply(&RespValue::SimpleString("OK".into())).await;
            assert_eq!(
                server.next_command().await.unwrap(),
                vec!["SUBSCRIBE", "news"]
            );
            server
        });

        manager.subscribe(&config, "news", |_| {}).await.unwrap();
        assert_eq!(manager.channels(), vec!["news".to_string()]);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_previous() {
        let dialer = MemoryDialer::new();
        let mut first = FakeServer::new(dialer.push_pipe());
        let mut second = FakeServer::new(dialer.push_pipe());
        let manager = SubscriptionManager::new(Arc::new(dialer.clone()));

        manager
            .subscribe(&ConnectionConfig::default(), "news", |_| {})
            .await
            .unwrap();
        first.next_command().await.unwrap();

        manager
            .subscribe(&ConnectionConfig::default(), "news", |_| {})
            .await
            .unwrap();
        second.next_command().await.unwrap();

        let eof = tokio::time::timeout(Duration::from_secs(5), first.next_command())
            .await
            .unwrap();
        assert!(eof.is_none());
        assert_eq!(manager.len(), 1);

        // The replaced task must not remove the new entry on its way out.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.is_subscribed("news"));
    }

    #[tokio::test]
    async fn test_close_all_and_drop() {
        let dialer = MemoryDialer::new();
        let mut a = FakeServer::new(dialer.push_pipe());
        let mut b = FakeServer::new(dialer.push_pipe());
        let manager = SubscriptionManager::new(Arc::new(dialer.clone()));
        let config = ConnectionConfig::default();

        manager.subscribe(&config, "a", |_| {}).await.unwrap();
        manager.subscribe(&config, "b", |_| {}).await.unwrap();
        a.next_command().await.unwrap();
        b.next_command().await.unwrap();

        manager.close_all();
        assert!(manager.is_empty());
        assert!(a.next_command().await.is_none());

        // Dropping the manager also ends any task it still owned.
        let mut c = FakeServer::new(dialer.push_pipe());
        manager.subscribe(&config, "c", |_| {}).await.unwrap();
        c.next_command().await.unwrap();
        drop(manager);
        assert!(b.next_command().await.is_none());
        let eof = tokio::time::timeout(Duration::from_secs(5), c.next_command())
            .await
            .unwrap();
        assert!(eof.is_none());
    }
}
