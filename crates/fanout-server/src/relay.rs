//! Relay facade
//!
//! The surface a host application binds to. Everything crossing it is plain
//! data from `fanout-protocol`: ids, strings, parameter structs and events.
//! Connections and routers stay owned by the relay.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};

use fanout_media::{CodecFactory, CodecRegistry};
use fanout_protocol::{
    CodecParameters, ConnectionEvent, ConnectionId, ConnectionState, ConnectionStats, DtlsFingerprint,
    LocalParameters, RemoteParameters, RouterId, RouterStats,
};
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{IceConfig, RelayConfig, SyntheticConfig};
use crate::connection::{Connection, ConnectionKind};
use crate::endpoint::{FileSink, FileSource, SyntheticSource};
use crate::error::{RelayError, Result};
use crate::pool::Pools;
use crate::router::Router;
use crate::transport::{DtlsEngine, SessionContext, WebRtcDtlsEngine};

pub struct RelayBuilder {
    config: RelayConfig,
    pools: Option<Pools>,
    codecs: Option<Arc<dyn CodecFactory>>,
    dtls: Option<Arc<dyn DtlsEngine>>,
}

impl RelayBuilder {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            pools: None,
            codecs: None,
            dtls: None,
        }
    }

    /// Use existing pools instead of starting new ones
    pub fn pools(mut self, pools: Pools) -> Self {
        self.pools = Some(pools);
        self
    }

    /// Codec implementations for transcoding; defaults to the built-in
    /// registry
    pub fn codec_factory(mut self, codecs: Arc<dyn CodecFactory>) -> Self {
        self.codecs = Some(codecs);
        self
    }

    /// DTLS implementation; defaults to `webrtc::dtls` with a freshly
    /// generated certificate
    pub fn dtls_engine(mut self, dtls: Arc<dyn DtlsEngine>) -> Self {
        self.dtls = Some(dtls);
        self
    }

    pub async fn build(self) -> Result<Relay> {
        let config = self.config;
        let pools = match self.pools {
            Some(pools) => pools,
            None => Pools::new(&config.pools)?,
        };
        let dtls: Arc<dyn DtlsEngine> = match self.dtls {
            Some(dtls) => dtls,
            None => Arc::new(WebRtcDtlsEngine::generate(&pools.cpu).await?),
        };
        let codecs = self
            .codecs
            .unwrap_or_else(|| Arc::new(CodecRegistry::new()) as Arc<dyn CodecFactory>);

        let (events, _) = broadcast::channel(config.events.capacity.max(1));
        let shared = Arc::new(RelayShared {
            connections: RwLock::new(HashMap::new()),
            routers: RwLock::new(HashMap::new()),
            publishers: RwLock::new(HashMap::new()),
            events: events.clone(),
        });
        let watcher = pools
            .io
            .spawn(watch_failures(Arc::downgrade(&shared), events.subscribe()));

        tracing::info!(fingerprint = %dtls.fingerprint(), "relay started");
        Ok(Relay {
            config,
            pools,
            codecs,
            dtls,
            shared,
            watcher,
        })
    }
}

struct RelayShared {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    routers: RwLock<HashMap<RouterId, Router>>,
    /// Router each publishing connection feeds
    publishers: RwLock<HashMap<ConnectionId, RouterId>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl RelayShared {
    async fn connection(&self, id: ConnectionId) -> Result<Arc<Connection>> {
        self.connections
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(RelayError::ConnectionNotFound(id))
    }

    async fn router(&self, id: RouterId) -> Result<Router> {
        self.routers
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(RelayError::RouterNotFound(id))
    }

    /// Remove a connection from every router. A publisher keeps its router's
    /// subscriptions in place without an active source.
    async fn detach_connection(&self, id: ConnectionId, failed: bool) {
        let routers: Vec<Router> = self.routers.read().await.values().cloned().collect();
        if let Some(router_id) = self.publishers.write().await.remove(&id) {
            if let Some(router) = routers.iter().find(|r| r.id() == router_id) {
                if router.publisher_lost(id) && failed {
                    let _ = self.events.send(ConnectionEvent::PublisherLost {
                        router_id,
                        connection_id: id,
                    });
                }
            }
        }
        for router in &routers {
            router.remove_subscriber(id);
        }
    }
}

/// Detach connections whose transport failed
async fn watch_failures(shared: Weak<RelayShared>, mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Failed { connection_id, reason }) => {
                let Some(shared) = shared.upgrade() else { break };
                tracing::warn!(connection = %connection_id, ?reason, "connection failed, detaching from routers");
                shared.detach_connection(connection_id, true).await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "relay fell behind on connection events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Owns every connection and router of one relay instance
pub struct Relay {
    config: RelayConfig,
    pools: Pools,
    codecs: Arc<dyn CodecFactory>,
    dtls: Arc<dyn DtlsEngine>,
    shared: Arc<RelayShared>,
    watcher: JoinHandle<()>,
}

impl Relay {
    pub fn builder(config: RelayConfig) -> RelayBuilder {
        RelayBuilder::new(config)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn pools(&self) -> &Pools {
        &self.pools
    }

    /// Fingerprint peers must see in the local description
    pub fn local_fingerprint(&self) -> DtlsFingerprint {
        self.dtls.fingerprint()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    async fn insert(&self, connection: Arc<Connection>) -> ConnectionId {
        let id = connection.id();
        tracing::info!(connection = %id, kind = ?connection.kind(), codecs = connection.negotiated_codecs().len(), "connection created");
        self.shared.connections.write().await.insert(id, connection);
        id
    }

    pub async fn create_webrtc_connection(&self, codecs: Vec<CodecParameters>) -> Result<ConnectionId> {
        if codecs.is_empty() {
            return Err(RelayError::InvalidOperation("a connection needs at least one codec".into()));
        }
        let context = SessionContext {
            pools: self.pools.clone(),
            dtls: self.dtls.clone(),
            dtls_config: self.config.dtls.clone(),
            events: self.shared.events.clone(),
        };
        let connection = Connection::live(Uuid::new_v4(), codecs, context, &self.config.pipeline);
        Ok(self.insert(connection).await)
    }

    pub async fn create_file_source(
        &self,
        path: impl AsRef<Path>,
        looping: bool,
        codecs: Vec<CodecParameters>,
    ) -> Result<ConnectionId> {
        let source = FileSource::open(
            Uuid::new_v4(),
            path.as_ref(),
            looping,
            codecs,
            self.pools.io.clone(),
        )
        .await?;
        Ok(self.insert(Connection::file_source(source)).await)
    }

    pub async fn create_synthetic_source(&self, config: SyntheticConfig) -> ConnectionId {
        let source = SyntheticSource::new(Uuid::new_v4(), config, self.pools.io.clone());
        self.insert(Connection::synthetic(source)).await
    }

    pub async fn create_file_sink(&self, path: impl AsRef<Path>, codecs: Vec<CodecParameters>) -> Result<ConnectionId> {
        let sink = FileSink::create(Uuid::new_v4(), path.as_ref(), codecs, &self.pools.io).await?;
        Ok(self.insert(Connection::file_sink(sink)).await)
    }

    /// Start ICE for a WebRTC connection with the relay's ICE settings
    pub async fn open(&self, id: ConnectionId) -> Result<LocalParameters> {
        self.open_with(id, &self.config.ice).await
    }

    /// Start ICE with connection-specific settings, e.g. a different role or
    /// host address
    pub async fn open_with(&self, id: ConnectionId, ice: &IceConfig) -> Result<LocalParameters> {
        let connection = self.shared.connection(id).await?;
        let session = connection
            .session()
            .ok_or_else(|| RelayError::InvalidOperation(format!("connection {id} is not a WebRTC transport")))?;
        Ok(session.open(ice).await?)
    }

    pub async fn add_remote_candidate(&self, id: ConnectionId, candidate: &str) -> Result<()> {
        let connection = self.shared.connection(id).await?;
        match connection.session() {
            Some(session) => Ok(session.add_remote_candidate(candidate)?),
            None => Err(RelayError::InvalidOperation(format!("connection {id} has no ICE agent"))),
        }
    }

    pub async fn set_remote_parameters(&self, id: ConnectionId, params: RemoteParameters) -> Result<()> {
        let connection = self.shared.connection(id).await?;
        match connection.session() {
            Some(session) => session.set_remote_parameters(params),
            None => Err(RelayError::InvalidOperation(format!("connection {id} has no DTLS transport"))),
        }
    }

    pub async fn create_router(&self) -> RouterId {
        let id = Uuid::new_v4();
        let router = Router::new(id, self.pools.clone(), self.codecs.clone(), self.config.router.clone());
        self.shared.routers.write().await.insert(id, router);
        tracing::info!(router = %id, "router created");
        id
    }

    /// Make a connection the router's publisher. A connection publishes into
    /// at most one router.
    pub async fn set_publisher(&self, router_id: RouterId, connection_id: ConnectionId) -> Result<()> {
        let router = self.shared.router(router_id).await?;
        let connection = self.shared.connection(connection_id).await?;
        if !connection.kind().can_publish() || connection.is_closed() {
            return Err(RelayError::InvalidOperation(format!(
                "connection {connection_id} ({:?}) cannot publish",
                connection.kind()
            )));
        }

        let mut publishers = self.shared.publishers.write().await;
        if let Some(existing) = publishers.get(&connection_id).filter(|r| **r != router_id) {
            return Err(RelayError::InvalidOperation(format!(
                "connection {connection_id} already publishes into router {existing}"
            )));
        }
        let previous = router.publisher_id().filter(|p| *p != connection_id);
        router.set_publisher(connection)?;
        if let Some(previous) = previous {
            publishers.remove(&previous);
        }
        publishers.insert(connection_id, router_id);
        Ok(())
    }

    pub async fn add_subscriber(&self, router_id: RouterId, connection_id: ConnectionId) -> Result<()> {
        let router = self.shared.router(router_id).await?;
        let connection = self.shared.connection(connection_id).await?;
        if !connection.kind().can_subscribe() || connection.is_closed() {
            return Err(RelayError::InvalidOperation(format!(
                "connection {connection_id} ({:?}) cannot subscribe",
                connection.kind()
            )));
        }
        router.add_subscriber(connection.clone())?;
        connection.add_upstream(router);
        Ok(())
    }

    /// Returns `false` if the connection was not subscribed
    pub async fn remove_subscriber(&self, router_id: RouterId, connection_id: ConnectionId) -> Result<bool> {
        let router = self.shared.router(router_id).await?;
        let removed = router.remove_subscriber(connection_id);
        if let Ok(connection) = self.shared.connection(connection_id).await {
            connection.remove_upstream(router_id);
        }
        Ok(removed)
    }

    /// Close and forget a connection
    pub async fn close(&self, id: ConnectionId) -> Result<()> {
        let connection = self
            .shared
            .connections
            .write()
            .await
            .remove(&id)
            .ok_or(RelayError::ConnectionNotFound(id))?;
        self.shared.detach_connection(id, false).await;
        connection.close();
        Ok(())
    }

    pub async fn close_router(&self, id: RouterId) -> Result<()> {
        let router = self
            .shared
            .routers
            .write()
            .await
            .remove(&id)
            .ok_or(RelayError::RouterNotFound(id))?;
        self.shared.publishers.write().await.retain(|_, router_id| *router_id != id);
        {
            let connections = self.shared.connections.read().await;
            for subscriber in router.subscriber_ids() {
                if let Some(connection) = connections.get(&subscriber) {
                    connection.remove_upstream(id);
                }
            }
        }
        router.close();
        Ok(())
    }

    pub async fn connection_state(&self, id: ConnectionId) -> Result<ConnectionState> {
        Ok(self.shared.connection(id).await?.state())
    }

    pub async fn connection_kind(&self, id: ConnectionId) -> Result<ConnectionKind> {
        Ok(self.shared.connection(id).await?.kind())
    }

    pub async fn stats(&self, id: ConnectionId) -> Result<ConnectionStats> {
        Ok(self.shared.connection(id).await?.stats())
    }

    pub async fn router_stats(&self, id: RouterId) -> Result<RouterStats> {
        Ok(self.shared.router(id).await?.stats())
    }

    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        self.shared.connections.read().await.keys().copied().collect()
    }

    pub async fn router_ids(&self) -> Vec<RouterId> {
        self.shared.routers.read().await.keys().copied().collect()
    }

    /// Close a file sink and wait until its recording is complete. Returns
    /// the number of packets written.
    pub async fn finish_recording(&self, id: ConnectionId) -> Result<u64> {
        let connection = self.shared.connection(id).await?;
        match connection.finish_recording().await {
            Some(result) => Ok(result?),
            None => Err(RelayError::InvalidOperation(format!("connection {id} is not a file sink"))),
        }
    }

    /// Close every router and connection, waiting for recordings to be
    /// flushed
    pub async fn shutdown(&self) {
        let routers: Vec<Router> = self.shared.routers.write().await.drain().map(|(_, r)| r).collect();
        for router in &routers {
            router.close();
        }
        self.shared.publishers.write().await.clear();

        let connections: Vec<Arc<Connection>> = self
            .shared
            .connections
            .write()
            .await
            .drain()
            .map(|(_, c)| c)
            .collect();
        for connection in &connections {
            connection.close();
        }
        for connection in &connections {
            if let Some(Err(e)) = connection.finish_recording().await {
                tracing::warn!(connection = %connection.id(), error = %e, "recording incomplete");
            }
        }
        tracing::info!(routers = routers.len(), connections = connections.len(), "relay shut down");
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}
