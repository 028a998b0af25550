use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Credentials;
use crate::database::{Camera, CameraEndpoint, CameraFilter, DatabaseProvider, Page};
use crate::errors::Result;
use crate::gateway::VideoGateway;
use crate::onvif::{CameraDevice, DeviceConnector};
use crate::prober::{CameraCandidate, DeviceProber};

struct DetectedEntry {
    credentials: Option<Credentials>,
    updated_at: Instant,
}

struct ConnectedEntry {
    device: Arc<dyn CameraDevice>,
    credentials: Option<Credentials>,
    stream_uri: Option<String>,
}

/// A handshake that succeeded away from the manager
pub struct Connection {
    device: Arc<dyn CameraDevice>,
    credentials: Option<Credentials>,
    stream_uri: Option<String>,
}

/// The network half of a pool pass. Holds clones of everything it touches
/// so it can run in a spawned task while the manager keeps serving.
pub struct PoolPass {
    connector: Arc<dyn DeviceConnector>,
    live: Vec<(CameraEndpoint, Arc<dyn CameraDevice>)>,
    pending: Vec<(CameraEndpoint, Vec<Option<Credentials>>)>,
}

pub enum PoolReport {
    Failed(Vec<CameraEndpoint>),
    Connected(Vec<(CameraEndpoint, Connection)>),
}

impl PoolPass {
    /// Liveness first; connect attempts only run when every connected camera answered
    pub async fn run(self) -> PoolReport {
        let checks = self.live.iter()
            .map(|(endpoint, device)| async move { (endpoint.clone(), device.liveness().await) });
        let failed: Vec<CameraEndpoint> = join_all(checks).await
            .into_iter()
            .filter_map(|(endpoint, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    warn!("Camera {} failed liveness check: {}", endpoint, e);
                    Some(endpoint)
                }
            })
            .collect();
        if !failed.is_empty() {
            return PoolReport::Failed(failed);
        }

        let attempts = self.pending.into_iter().map(|(endpoint, attempts)| {
            let connector = self.connector.clone();
            async move {
                let outcome = try_connect(connector, endpoint.clone(), attempts).await;
                outcome.map(|connection| (endpoint, connection))
            }
        });
        PoolReport::Connected(join_all(attempts).await.into_iter().flatten().collect())
    }
}

/// Outcome of one pool pass. A pass either shrinks or grows the connected
/// set, never both: when a liveness check demotes anything, promotion of
/// detected endpoints waits for the next pass.
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyChange {
    Unchanged,
    Added(Vec<CameraEndpoint>),
    Removed(Vec<CameraEndpoint>),
}

/// A persisted camera that just joined the connected set
#[derive(Debug, Clone)]
pub struct AddedCamera {
    pub camera: Camera,
    pub is_new: bool,
}

/// Owns the Detected and Connected endpoint maps. Mutated only through
/// `&mut self`, from the coordinator task.
pub struct ConnectionManager {
    connector: Arc<dyn DeviceConnector>,
    credentials: Vec<Credentials>,
    detected: BTreeMap<CameraEndpoint, DetectedEntry>,
    connected: BTreeMap<CameraEndpoint, ConnectedEntry>,
    /// Last credentials that worked or were stored per endpoint; outlives reaping
    known: BTreeMap<CameraEndpoint, Credentials>,
}

async fn try_connect(
    connector: Arc<dyn DeviceConnector>,
    endpoint: CameraEndpoint,
    attempts: Vec<Option<Credentials>>,
) -> Option<Connection> {
    for credentials in attempts {
        match connector.connect(&endpoint, credentials.as_ref()).await {
            Ok(device) => {
                let stream_uri = match device.stream_uri().await {
                    Ok(uri) => Some(uri),
                    Err(e) => {
                        warn!("Connected to {} but could not resolve stream URI: {}", endpoint, e);
                        None
                    }
                };
                return Some(Connection { device: Arc::from(device), credentials, stream_uri });
            }
            Err(e) if e.is_transient() => {
                debug!("Connect to {} as {:?} failed: {}", endpoint,
                       credentials.as_ref().map(|c| c.username.as_str()), e);
            }
            Err(e) => {
                warn!("Connect to {} as {:?} rejected: {}", endpoint,
                      credentials.as_ref().map(|c| c.username.as_str()), e);
            }
        }
    }
    None
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn DeviceConnector>, credentials: Vec<Credentials>) -> Self {
        Self {
            connector,
            credentials,
            detected: BTreeMap::new(),
            connected: BTreeMap::new(),
            known: BTreeMap::new(),
        }
    }

    pub fn set_credentials(&mut self, credentials: Vec<Credentials>) {
        self.credentials = credentials;
    }

    /// Supplied credentials are tried alone; otherwise the configured list in order
    fn credential_attempts(&self, supplied: Option<&Credentials>) -> Vec<Option<Credentials>> {
        match supplied {
            Some(creds) => vec![Some(creds.clone())],
            None if self.credentials.is_empty() => vec![None],
            None => self.credentials.iter().cloned().map(Some).collect(),
        }
    }

    pub fn record_candidates(&mut self, candidates: &[CameraCandidate]) {
        let now = Instant::now();
        for candidate in candidates {
            let endpoint = candidate.endpoint();
            let stored = self.known.get(&endpoint).cloned();
            self.detected.entry(endpoint)
                .and_modify(|entry| entry.updated_at = now)
                .or_insert_with(|| {
                    debug!("Detected camera candidate {}", candidate);
                    DetectedEntry { credentials: stored, updated_at: now }
                });
        }
    }

    /// Registers a known endpoint with its stored credentials, e.g. from the database at boot
    pub fn record_known(&mut self, endpoint: CameraEndpoint, credentials: Option<Credentials>) {
        if let Some(creds) = &credentials {
            self.known.insert(endpoint.clone(), creds.clone());
        }
        self.detected.insert(endpoint, DetectedEntry { credentials, updated_at: Instant::now() });
    }

    /// A persisted camera answered again; it re-enters Detected with what the database holds
    pub fn revive(&mut self, camera: &Camera) {
        debug!("Camera {} is reachable again", camera.id);
        self.record_known(camera.endpoint(), camera.credentials());
    }

    fn insert_connected(&mut self, endpoint: CameraEndpoint, connection: Connection) {
        info!("Connected to camera {}", endpoint);
        if let Some(creds) = &connection.credentials {
            self.known.insert(endpoint.clone(), creds.clone());
        }
        self.connected.insert(endpoint, ConnectedEntry {
            device: connection.device,
            credentials: connection.credentials,
            stream_uri: connection.stream_uri,
        });
    }

    /// Snapshot of the work for the next pool pass
    pub fn pool_pass(&self) -> PoolPass {
        PoolPass {
            connector: self.connector.clone(),
            live: self.connected.iter()
                .map(|(endpoint, entry)| (endpoint.clone(), entry.device.clone()))
                .collect(),
            pending: self.detected.iter()
                .filter(|(endpoint, _)| !self.connected.contains_key(*endpoint))
                .map(|(endpoint, entry)| (endpoint.clone(), self.credential_attempts(entry.credentials.as_ref())))
                .collect(),
        }
    }

    /// Folds a finished pass into the maps. The maps may have moved on while
    /// the pass ran, so endpoints already gone or already connected are skipped.
    pub fn apply_pool(&mut self, report: PoolReport) -> TopologyChange {
        match report {
            PoolReport::Failed(failed) => {
                let removed: Vec<CameraEndpoint> = failed.into_iter()
                    .filter(|endpoint| self.connected.remove(endpoint).is_some())
                    .collect();
                if removed.is_empty() {
                    TopologyChange::Unchanged
                } else {
                    TopologyChange::Removed(removed)
                }
            }
            PoolReport::Connected(connections) => {
                let mut added = Vec::new();
                for (endpoint, connection) in connections {
                    if self.connected.contains_key(&endpoint) {
                        debug!("Camera {} connected twice, keeping the first session", endpoint);
                        continue;
                    }
                    self.insert_connected(endpoint.clone(), connection);
                    added.push(endpoint);
                }
                if added.is_empty() {
                    TopologyChange::Unchanged
                } else {
                    TopologyChange::Added(added)
                }
            }
        }
    }

    /// Runs a whole pass in place
    #[cfg(test)]
    pub async fn connect_pool(&mut self) -> TopologyChange {
        let report = self.pool_pass().run().await;
        self.apply_pool(report)
    }

    /// Drops detected entries that were never promoted within `timeout`
    pub fn reap_detected(&mut self, timeout: Duration) -> usize {
        let now = Instant::now();
        let connected = &self.connected;
        let before = self.detected.len();
        self.detected.retain(|endpoint, entry| {
            connected.contains_key(endpoint) || now.duration_since(entry.updated_at) < timeout
        });
        let reaped = before - self.detected.len();
        if reaped > 0 {
            debug!("Reaped {} stale detected endpoints", reaped);
        }
        reaped
    }

    pub fn is_connected(&self, endpoint: &CameraEndpoint) -> bool {
        self.connected.contains_key(endpoint)
    }

    pub fn connected_endpoints(&self) -> Vec<CameraEndpoint> {
        self.connected.keys().cloned().collect()
    }

    pub fn detected_count(&self) -> usize {
        self.detected.len()
    }

    /// Persists the growth half of a topology change and returns the affected cameras
    pub async fn persist_added(
        &self,
        database: &dyn DatabaseProvider,
        gateway: Option<&VideoGateway>,
        endpoints: &[CameraEndpoint],
    ) -> Result<Vec<AddedCamera>> {
        let mut cameras = Vec::new();
        for endpoint in endpoints {
            let entry = match self.connected.get(endpoint) {
                Some(entry) => entry,
                None => continue,
            };

            match database.find_camera_by_endpoint(endpoint).await? {
                Some(mut camera) => {
                    camera.connected = true;
                    camera.disconnected_at = None;
                    if let Some(creds) = &entry.credentials {
                        camera.username = Some(creds.username.clone());
                        camera.password = Some(creds.password.clone());
                    }
                    if entry.stream_uri.is_some() {
                        camera.stream_uri = entry.stream_uri.clone();
                    }
                    database.update_camera(&camera).await?;
                    info!("Camera {} ({}) reconnected", camera.id, endpoint);
                    cameras.push(AddedCamera { camera, is_new: false });
                }
                None => {
                    let mut camera = Camera::new(endpoint, entry.credentials.as_ref(), entry.stream_uri.clone());
                    camera.id = database.create_camera(&camera).await?;
                    info!("New camera {} persisted for {}", camera.id, endpoint);

                    if let (Some(gateway), Some(uri)) = (gateway, &camera.stream_uri) {
                        if let Err(e) = gateway.register(camera.id, uri).await {
                            warn!("Failed to register camera {} with video gateway: {}", camera.id, e);
                        }
                    }
                    cameras.push(AddedCamera { camera, is_new: true });
                }
            }
        }
        Ok(cameras)
    }

    /// Marks removed cameras disconnected; stopping their streams is the caller's job
    pub async fn persist_removed(
        &self,
        database: &dyn DatabaseProvider,
        endpoints: &[CameraEndpoint],
    ) -> Result<Vec<Camera>> {
        let mut cameras = Vec::new();
        for endpoint in endpoints {
            if let Some(mut camera) = database.find_camera_by_endpoint(endpoint).await? {
                camera.connected = false;
                camera.streaming = false;
                camera.disconnected_at = Some(Utc::now());
                database.update_camera(&camera).await?;
                info!("Camera {} ({}) marked disconnected", camera.id, endpoint);
                cameras.push(camera);
            }
        }
        Ok(cameras)
    }

    pub async fn disconnected_cameras(&self, database: &dyn DatabaseProvider) -> Result<Vec<Camera>> {
        let filter = CameraFilter { connected: Some(false), ..Default::default() };
        let cameras = database.list_cameras(&filter, Page::all()).await?;
        Ok(cameras.into_iter()
            .filter(|camera| !self.connected.contains_key(&camera.endpoint()))
            .collect())
    }
}

/// The cameras among `cameras` that accept a TCP connection again
pub async fn reachable_cameras(prober: &DeviceProber, cameras: Vec<Camera>) -> Vec<Camera> {
    let total = cameras.len();
    let checks = cameras.into_iter().map(|camera| async move {
        let reachable = prober.is_reachable(&camera.endpoint()).await;
        reachable.then_some(camera)
    });
    let revived: Vec<Camera> = join_all(checks).await.into_iter().flatten().collect();
    if revived.is_empty() {
        debug!("None of {} disconnected cameras answered", total);
    } else {
        let endpoints: Vec<CameraEndpoint> = revived.iter().map(Camera::endpoint).collect();
        info!("Disconnected camera(s) {:?} answered", endpoints);
    }
    revived
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqliteDatabase;
    use crate::errors::EdgeError;
    use crate::prober::CandidateSource;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct FakeDevice {
        alive: Arc<Mutex<HashSet<CameraEndpoint>>>,
        endpoint: CameraEndpoint,
    }

    #[async_trait]
    impl CameraDevice for FakeDevice {
        async fn liveness(&self) -> Result<()> {
            if self.alive.lock().unwrap().contains(&self.endpoint) {
                Ok(())
            } else {
                Err(EdgeError::device("timeout"))
            }
        }

        async fn stream_uri(&self) -> Result<String> {
            Ok(format!("rtsp://{}/stream", self.endpoint))
        }
    }

    /// Accepts only password "right" and records every attempt
    struct FakeConnector {
        alive: Arc<Mutex<HashSet<CameraEndpoint>>>,
        attempts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeviceConnector for FakeConnector {
        async fn connect(&self, endpoint: &CameraEndpoint, credentials: Option<&Credentials>) -> Result<Box<dyn CameraDevice>> {
            let password = credentials.map(|c| c.password.clone()).unwrap_or_default();
            self.attempts.lock().unwrap().push(password.clone());
            if password == "right" && self.alive.lock().unwrap().contains(endpoint) {
                Ok(Box::new(FakeDevice { alive: self.alive.clone(), endpoint: endpoint.clone() }))
            } else {
                Err(EdgeError::device("unauthorized"))
            }
        }
    }

    fn creds(password: &str) -> Credentials {
        Credentials { username: "admin".into(), password: password.into() }
    }

    fn setup(endpoints: &[CameraEndpoint]) -> (ConnectionManager, Arc<FakeConnector>, Arc<Mutex<HashSet<CameraEndpoint>>>) {
        let alive = Arc::new(Mutex::new(endpoints.iter().cloned().collect::<HashSet<_>>()));
        let connector = Arc::new(FakeConnector { alive: alive.clone(), attempts: Mutex::new(Vec::new()) });
        let manager = ConnectionManager::new(connector.clone(), vec![creds("wrong"), creds("right"), creds("never")]);
        (manager, connector, alive)
    }

    #[tokio::test]
    async fn test_credentials_tried_in_order_until_success() {
        let endpoint = CameraEndpoint::new("10.0.0.2", 80);
        let (mut manager, connector, _) = setup(&[endpoint.clone()]);

        manager.record_known(endpoint.clone(), None);
        assert_eq!(manager.connect_pool().await, TopologyChange::Added(vec![endpoint.clone()]));
        assert_eq!(*connector.attempts.lock().unwrap(), vec!["wrong", "right"]);
        assert_eq!(manager.connected[&endpoint].stream_uri.as_deref(), Some("rtsp://10.0.0.2:80/stream"));
    }

    #[tokio::test]
    async fn test_supplied_credentials_are_tried_alone() {
        let endpoint = CameraEndpoint::new("10.0.0.2", 80);
        let (mut manager, connector, _) = setup(&[endpoint.clone()]);

        manager.record_known(endpoint.clone(), Some(creds("wrong")));
        assert_eq!(manager.connect_pool().await, TopologyChange::Unchanged);
        assert_eq!(*connector.attempts.lock().unwrap(), vec!["wrong"]);
        assert!(!manager.is_connected(&endpoint));
    }

    #[tokio::test]
    async fn test_connect_pool_grows_then_shrinks() {
        let a = CameraEndpoint::new("10.0.0.2", 80);
        let b = CameraEndpoint::new("10.0.0.3", 80);
        let (mut manager, _, alive) = setup(&[a.clone(), b.clone()]);

        manager.record_known(a.clone(), None);
        manager.record_known(b.clone(), None);
        assert_eq!(manager.connect_pool().await, TopologyChange::Added(vec![a.clone(), b.clone()]));
        assert_eq!(manager.connect_pool().await, TopologyChange::Unchanged);

        alive.lock().unwrap().remove(&b);
        assert_eq!(manager.connect_pool().await, TopologyChange::Removed(vec![b.clone()]));
        assert_eq!(manager.connected_endpoints(), vec![a.clone()]);

        alive.lock().unwrap().insert(b.clone());
        assert_eq!(manager.connect_pool().await, TopologyChange::Added(vec![b]));
    }

    #[tokio::test]
    async fn test_stored_credentials_survive_reap() {
        let a = CameraEndpoint::new("10.0.0.2", 80);
        let alive = Arc::new(Mutex::new(HashSet::from([a.clone()])));
        let connector = Arc::new(FakeConnector { alive: alive.clone(), attempts: Mutex::new(Vec::new()) });
        let mut manager = ConnectionManager::new(connector.clone(), vec![creds("wrong")]);

        manager.record_known(a.clone(), Some(creds("right")));
        assert_eq!(manager.connect_pool().await, TopologyChange::Added(vec![a.clone()]));

        alive.lock().unwrap().remove(&a);
        assert_eq!(manager.connect_pool().await, TopologyChange::Removed(vec![a.clone()]));
        assert_eq!(manager.reap_detected(Duration::ZERO), 1);

        alive.lock().unwrap().insert(a.clone());
        connector.attempts.lock().unwrap().clear();
        manager.record_candidates(&[CameraCandidate {
            ip: "10.0.0.2".into(),
            port: 80,
            xaddr: None,
            source: CandidateSource::SubnetScan,
        }]);
        assert_eq!(manager.connect_pool().await, TopologyChange::Added(vec![a]));
        assert_eq!(*connector.attempts.lock().unwrap(), vec!["right"]);
    }

    #[tokio::test]
    async fn test_revived_camera_uses_stored_credentials() {
        let a = CameraEndpoint::new("10.0.0.2", 80);
        let alive = Arc::new(Mutex::new(HashSet::from([a.clone()])));
        let connector = Arc::new(FakeConnector { alive: alive.clone(), attempts: Mutex::new(Vec::new()) });
        let mut manager = ConnectionManager::new(connector.clone(), vec![creds("wrong")]);

        let camera = Camera::new(&a, Some(&creds("right")), None);
        manager.revive(&camera);
        assert_eq!(manager.connect_pool().await, TopologyChange::Added(vec![a]));
        assert_eq!(*connector.attempts.lock().unwrap(), vec!["right"]);
    }

    #[tokio::test]
    async fn test_stale_pool_report_is_ignored() {
        let a = CameraEndpoint::new("10.0.0.2", 80);
        let (mut manager, _, alive) = setup(&[a.clone()]);
        manager.record_known(a.clone(), None);

        let first = manager.pool_pass();
        let second = manager.pool_pass();
        let first = first.run().await;
        let second = second.run().await;
        assert_eq!(manager.apply_pool(first), TopologyChange::Added(vec![a.clone()]));
        assert_eq!(manager.apply_pool(second), TopologyChange::Unchanged);

        alive.lock().unwrap().remove(&a);
        let failed = manager.pool_pass().run().await;
        let again = manager.pool_pass().run().await;
        assert_eq!(manager.apply_pool(failed), TopologyChange::Removed(vec![a]));
        assert_eq!(manager.apply_pool(again), TopologyChange::Unchanged);
    }

    #[tokio::test]
    async fn test_reachable_cameras_keeps_listening_endpoints() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let closed = {
            let scratch = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            scratch.local_addr().unwrap().port()
        };
        let network = crate::config::NetworkConfig { probe_timeout_ms: 300, ..Default::default() };
        let prober = DeviceProber::new(network);

        let up = Camera::new(&CameraEndpoint::new("127.0.0.1", port), Some(&creds("right")), None);
        let down = Camera::new(&CameraEndpoint::new("127.0.0.1", closed), None, None);
        let revived = reachable_cameras(&prober, vec![up, down]).await;
        assert_eq!(revived.len(), 1);
        assert_eq!(revived[0].port, port);
        drop(listener);
    }

    #[tokio::test]
    async fn test_reap_keeps_connected_entries() {
        let a = CameraEndpoint::new("10.0.0.2", 80);
        let b = CameraEndpoint::new("10.0.0.9", 80);
        let (mut manager, _, _) = setup(&[a.clone()]);

        manager.record_known(a.clone(), None);
        manager.record_known(b, None);
        manager.connect_pool().await;

        assert_eq!(manager.reap_detected(Duration::ZERO), 1);
        assert_eq!(manager.detected_count(), 1);
    }

    #[tokio::test]
    async fn test_persist_added_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteDatabase::new(dir.path().join("cm.db").to_str().unwrap()).await.unwrap();
        db.initialize().await.unwrap();

        let a = CameraEndpoint::new("10.0.0.2", 80);
        let (mut manager, _, _) = setup(&[a.clone()]);
        manager.record_known(a.clone(), None);
        manager.connect_pool().await;

        let added = manager.persist_added(&db, None, &[a.clone()]).await.unwrap();
        assert!(added[0].is_new);
        assert_eq!(added[0].camera.password.as_deref(), Some("right"));

        let removed = manager.persist_removed(&db, &[a.clone()]).await.unwrap();
        assert!(!removed[0].connected);
        assert!(removed[0].disconnected_at.is_some());

        let again = manager.persist_added(&db, None, &[a]).await.unwrap();
        assert!(!again[0].is_new);
        assert_eq!(again[0].camera.id, added[0].camera.id);
        assert!(again[0].camera.connected);
    }
}
