use ferrule::client::Client;
use ferrule::codec::JsonCodec;
use ferrule::config::{ClientConfig, ServerConfig};
use ferrule::server::{ProcedureDef, ServiceSchemaMap, Server};
use ferrule::schema::PermissiveSchema;
use ferrule::transport::{in_memory_pair, Connection, ConnectionEvent, Transport};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// A [`Transport`] that hands out a fresh in-memory connection pair on
/// every `connect()` call, spawning the paired server half against a
/// shared [`Server`] each time — what lets a [`Client`]'s reconnect loop
/// actually resume against the same session in a test.
pub struct ReconnectableTransport {
    server: Arc<Server>,
    current: Mutex<Option<(Arc<dyn Connection>, Arc<dyn Connection>)>>,
}

impl ReconnectableTransport {
    pub fn new(server: Arc<Server>) -> Self {
        ReconnectableTransport {
            server,
            current: Mutex::new(None),
        }
    }

    /// The client-side connection handed out by the most recent
    /// `connect()` call.
    pub fn current_connection(&self) -> Arc<dyn Connection> {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .expect("connect() has not been called yet")
            .0
            .clone()
    }

    /// Severs the most recent connection from both ends — each side of an
    /// [`in_memory_pair`] only notifies its peer on `close()`, not itself,
    /// so a real transport hangup needs both closed to be observed by
    /// both the client and the server.
    pub fn sever_current(&self) {
        let (client_conn, server_conn) = self
            .current
            .lock()
            .unwrap()
            .clone()
            .expect("connect() has not been called yet");
        client_conn.close();
        server_conn.close();
    }
}

impl Transport for ReconnectableTransport {
    fn connect(&self, _peer: &str) -> (Arc<dyn Connection>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let ((client_conn, client_rx), (server_conn, server_rx)) = in_memory_pair();
        *self.current.lock().unwrap() = Some((client_conn.clone(), server_conn.clone()));

        let server = self.server.clone();
        tokio::spawn(async move {
            server.serve_connection(server_conn, server_rx).await;
        });

        (client_conn, client_rx)
    }
}

/// A [`Transport`] good for exactly one `connect()` call — enough for
/// scenarios that never need to survive a reconnect.
pub struct SingleUseTransport {
    pair: Mutex<Option<(Arc<dyn Connection>, mpsc::UnboundedReceiver<ConnectionEvent>)>>,
}

impl SingleUseTransport {
    pub fn new(conn: Arc<dyn Connection>, rx: mpsc::UnboundedReceiver<ConnectionEvent>) -> Self {
        SingleUseTransport {
            pair: Mutex::new(Some((conn, rx))),
        }
    }
}

impl Transport for SingleUseTransport {
    fn connect(&self, _peer: &str) -> (Arc<dyn Connection>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        self.pair
            .lock()
            .unwrap()
            .take()
            .expect("SingleUseTransport.connect() called more than once")
    }
}

/// Installs a `tracing` subscriber controlled by `RUST_LOG`, once per test
/// binary. Safe to call from every test — `try_init` swallows the "already
/// installed" error from a second caller.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Builds a server wired with `schema`, plus a client connected to it
/// over an in-memory pair, using `client_config`. Returns the
/// [`ReconnectableTransport`] too, so a test can sever the connection
/// and exercise reconnection.
pub async fn connected_pair(
    schema: ServiceSchemaMap,
    client_config: ClientConfig,
) -> (Client, Arc<Server>, Arc<ReconnectableTransport>) {
    init_tracing();
    let codec = Arc::new(JsonCodec::default());
    let server = Arc::new(Server::new("server", schema, ServerConfig::default(), codec.clone()));
    let transport = Arc::new(ReconnectableTransport::new(server.clone()));
    let client = Client::new("client", "server", client_config, codec, transport.clone());
    client.connect().await.expect("handshake should succeed");
    (client, server, transport)
}

pub fn procedures(entries: Vec<(&str, ProcedureDef)>) -> HashMap<String, ProcedureDef> {
    entries.into_iter().map(|(name, def)| (name.to_string(), def)).collect()
}

pub fn permissive() -> Arc<PermissiveSchema> {
    Arc::new(PermissiveSchema)
}

/// Polls `client.is_connected()` until it reports `true` or `timeout`
/// elapses, for tests driving an explicit reconnect.
pub async fn wait_until_connected(client: &Client, timeout: Duration) {
    tokio::time::timeout(timeout, async {
        while !client.is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("client did not reconnect in time");
}
