//! Upgrade graph synthesis
//!
//! Zincati asks an update service (Cincinnati) which releases it may move
//! to. Upgrade tests fake that service: a [`Graph`] document is kept in
//! sync on the machine as `~core/graph.json` and served on
//! `localhost:8080/v1/graph` by the `httpd` native function, alongside the
//! test's OSTree repository.
//!
//! The wire format is
//! `{"nodes": [{"version", "metadata", "payload"}], "edges": [[from, to]]}`
//! where edges index into `nodes`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::cluster::TestCluster;
use crate::harness::{Abort, TestResult};
use crate::platform::Machine;
use crate::Result;

/// Metadata key ordering releases from oldest to newest
pub const AGE_INDEX_KEY: &str = "org.fedoraproject.coreos.releases.age_index";
/// Metadata key naming how `payload` identifies the release
pub const SCHEME_KEY: &str = "org.fedoraproject.coreos.scheme";
const SCHEME_CHECKSUM: &str = "checksum";

/// Where the graph is written, relative to the `core` user's home
pub const GRAPH_FILE: &str = "graph.json";
/// Working directory of upgrade tests on the machine
pub const WORKDIR: &str = "/var/srv/upgrade";
/// OSTree repository served to the machine's own Zincati
pub const OSTREE_REPO: &str = "/var/srv/upgrade/repo";
/// Address the `httpd` native function listens on
pub const HTTPD_ADDR: &str = "127.0.0.1:8080";

const REBOOT_TIMEOUT: Duration = Duration::from_secs(240);
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// A fake Cincinnati update graph
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<Node>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<[usize; 2]>,
}

/// One release in a [`Graph`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub version: String,
    pub metadata: BTreeMap<String, String>,
    pub payload: String,
}

impl Node {
    fn new(version: impl Into<String>, payload: impl Into<String>, age_index: usize) -> Self {
        let metadata = BTreeMap::from([
            (AGE_INDEX_KEY.to_string(), age_index.to_string()),
            (SCHEME_KEY.to_string(), SCHEME_CHECKSUM.to_string()),
        ]);
        Self {
            version: version.into(),
            metadata,
            payload: payload.into(),
        }
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the graph to the single release `m` is booted into
    pub async fn seed_from_machine(&mut self, c: &TestCluster, m: &dyn Machine) -> TestResult {
        let booted = booted_deployment(c, m).await?;
        self.seed(booted.version, booted.checksum);
        self.sync(c, m).await
    }

    /// Append a release reachable from the newest one
    pub async fn add_update(
        &mut self,
        c: &TestCluster,
        m: &dyn Machine,
        version: &str,
        payload: &str,
    ) -> TestResult {
        self.push_update(version, payload);
        self.sync(c, m).await
    }

    pub fn seed(&mut self, version: impl Into<String>, payload: impl Into<String>) {
        self.nodes = vec![Node::new(version, payload, 0)];
        self.edges.clear();
    }

    pub fn push_update(&mut self, version: impl Into<String>, payload: impl Into<String>) {
        let i = self.nodes.len();
        self.nodes.push(Node::new(version, payload, i));
        if i > 0 {
            self.edges.push([i - 1, i]);
        }
    }

    async fn sync(&self, c: &TestCluster, m: &dyn Machine) -> TestResult {
        let body = serde_json::to_vec(self)
            .map_err(|e| c.fatal(format!("failed to marshal graph: {}", e)))?;
        m.install_file(&body, GRAPH_FILE, 0o644)
            .await
            .map_err(|e| c.fatal(format!("failed to update graph.json: {}", e)))
    }
}

/// `rpm-ostree status --json`, reduced to what the harness reads
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpmOstreeStatus {
    #[serde(default)]
    pub deployments: Vec<Deployment>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Deployment {
    #[serde(default)]
    pub booted: bool,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub container_image_reference: Option<String>,
}

impl Deployment {
    /// Ref the deployment follows, `origin` without its remote
    pub fn ostree_ref(&self) -> &str {
        self.origin
            .split_once(':')
            .map(|(_, r)| r)
            .unwrap_or(&self.origin)
    }
}

impl RpmOstreeStatus {
    pub fn parse(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn booted(&self) -> Option<&Deployment> {
        self.deployments.iter().find(|d| d.booted)
    }
}

pub async fn rpm_ostree_status(
    c: &TestCluster,
    m: &dyn Machine,
) -> std::result::Result<RpmOstreeStatus, Abort> {
    let out = c.must_ssh(m, "rpm-ostree status --json").await?;
    RpmOstreeStatus::parse(&out)
        .map_err(|e| c.fatal(format!("couldn't parse rpm-ostree status: {}", e)))
}

pub async fn booted_deployment(
    c: &TestCluster,
    m: &dyn Machine,
) -> std::result::Result<Deployment, Abort> {
    let status = rpm_ostree_status(c, m).await?;
    status
        .booted()
        .cloned()
        .ok_or_else(|| c.fatal("no booted deployment found"))
}

/// Run `trigger`, wait for `m` to reboot and check it came back in
/// `version`
async fn wait_for_reboot_into_version<F, Fut>(
    c: &TestCluster,
    m: &dyn Machine,
    version: &str,
    trigger: F,
) -> TestResult
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = TestResult>,
{
    let old_boot_id = m.boot_id().await.map_err(|e| c.fatal(e.to_string()))?;
    trigger().await?;
    m.wait_for_reboot(REBOOT_TIMEOUT, &old_boot_id)
        .await
        .map_err(|e| c.fatal(format!("failed waiting for machine reboot: {}", e)))?;
    let booted = booted_deployment(c, m).await?;
    if booted.version != version {
        return Err(c.fatal(format!(
            "expected reboot into version {}, but got version {}",
            version, booted.version
        )));
    }
    Ok(())
}

async fn wait_for_upgrade_to_be_staged(c: &TestCluster, m: &dyn Machine) -> TestResult {
    c.run_cmd_sync(
        m,
        "sudo systemd-run -u refchanged --path-property=PathChanged=/ostree/deploy systemctl stop wait.service",
    )
    .await?;
    c.run_cmd_sync(m, "sudo systemd-run --wait -u wait sleep infinity")
        .await
}

/// Start Zincati and wait until it reboots the machine into `version`
pub async fn wait_for_upgrade_to_version(c: &TestCluster, m: &dyn Machine, version: &str) -> TestResult {
    wait_for_reboot_into_version(c, m, version, || async {
        c.run_cmd_sync(m, "sudo systemctl start zincati.service").await?;
        wait_for_upgrade_to_be_staged(c, m).await
    })
    .await
}

/// Rebase onto `target` with rpm-ostree and wait to boot into `version`
pub async fn rpm_ostree_rebase(
    c: &TestCluster,
    m: &dyn Machine,
    target: &str,
    version: &str,
) -> TestResult {
    wait_for_reboot_into_version(c, m, version, || async {
        c.run_cmd_sync(m, "sudo systemctl stop zincati").await?;
        c.run_cmd_sync(
            m,
            &format!(
                "sudo systemd-run rpm-ostree rebase --reboot {}",
                shell_words::quote(target)
            ),
        )
        .await?;
        wait_for_upgrade_to_be_staged(c, m).await
    })
    .await
}

/// Files served by [`serve`]
#[derive(Debug, Clone)]
pub struct ServeRoots {
    /// Returned for `GET /v1/graph`
    pub graph: PathBuf,
    /// Every other path is looked up below this directory
    pub repo: PathBuf,
}

impl Default for ServeRoots {
    fn default() -> Self {
        Self {
            graph: PathBuf::from("/var/home/core").join(GRAPH_FILE),
            repo: PathBuf::from(OSTREE_REPO),
        }
    }
}

/// Serve the graph and the repository until the listener fails
pub async fn serve(listener: TcpListener, roots: ServeRoots) -> Result<()> {
    let roots = Arc::new(roots);
    tracing::info!(addr = ?listener.local_addr().ok(), "starting server");
    loop {
        let (stream, peer) = listener.accept().await?;
        let roots = roots.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(stream, &roots).await {
                tracing::warn!(%peer, "connection error: {}", e);
            }
        });
    }
}

/// Body of the `httpd` native function
pub async fn httpd() -> Result<()> {
    let addr: SocketAddr = HTTPD_ADDR
        .parse()
        .map_err(|e| crate::Error::Config(format!("bad listen address {}: {}", HTTPD_ADDR, e)))?;
    serve(TcpListener::bind(addr).await?, ServeRoots::default()).await
}

async fn handle_stream(stream: TcpStream, roots: &ServeRoots) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(());
    }
    // Drain headers up to the blank line; only the request line matters
    let mut header_bytes = 0;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        header_bytes += n;
        if n == 0 || line == "\r\n" || line == "\n" || header_bytes > MAX_HEADER_BYTES {
            break;
        }
    }
    let mut stream = reader.into_inner();

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");

    let (status, content_type, body) = route_request(method, path, roots).await;
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        content_type,
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    if method != "HEAD" {
        stream.write_all(&body).await?;
    }
    Ok(())
}

async fn route_request(method: &str, path: &str, roots: &ServeRoots) -> (&'static str, &'static str, Vec<u8>) {
    if method != "GET" && method != "HEAD" {
        return ("405 Method Not Allowed", "text/plain", b"method not allowed\n".to_vec());
    }
    let path = path.split('?').next().unwrap_or("");
    let file = if path == "/v1/graph" {
        Some((roots.graph.clone(), "application/json"))
    } else {
        repo_path(&roots.repo, path).map(|p| (p, "application/octet-stream"))
    };
    let Some((file, content_type)) = file else {
        return ("400 Bad Request", "text/plain", b"bad path\n".to_vec());
    };
    match tokio::fs::read(&file).await {
        Ok(body) => ("200 OK", content_type, body),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            ("404 Not Found", "text/plain", b"not found\n".to_vec())
        }
        Err(e) => {
            tracing::warn!(file = %file.display(), "read failed: {}", e);
            ("500 Internal Server Error", "text/plain", b"read failed\n".to_vec())
        }
    }
}

/// Map a URL path below `root`, refusing anything that escapes it
fn repo_path(root: &Path, url_path: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(url_path).ok()?;
    let rel = Path::new(decoded.trim_start_matches('/'));
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(root.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_push_update_links_to_previous() {
        let mut g = Graph::new();
        g.seed("39.20240104.3.0", "aaaa");
        g.push_update("39.20240104.3.0.kola", "bbbb");
        g.push_update("39.20240104.3.0.kola.2", "cccc");
        assert_eq!(g.edges, vec![[0, 1], [1, 2]]);
        assert_eq!(g.nodes[2].metadata[AGE_INDEX_KEY], "2");
        assert_eq!(g.nodes[2].metadata[SCHEME_KEY], "checksum");
    }

    #[test]
    fn test_seed_only_omits_edges() {
        let mut g = Graph::new();
        g.seed("1", "a");
        let json = serde_json::to_value(&g).unwrap();
        assert!(json.get("edges").is_none());
        assert_eq!(json["nodes"][0]["metadata"][AGE_INDEX_KEY], "0");
    }

    #[test]
    fn test_parse_rpm_ostree_status() {
        let status = RpmOstreeStatus::parse(
            r#"{"deployments": [
                {"booted": false, "version": "38.1", "checksum": "old", "origin": "fedora:fedora/x86_64/coreos/stable"},
                {"booted": true, "version": "39.2", "checksum": "new", "origin": "fedora:fedora/x86_64/coreos/testing",
                 "container-image-reference": "ostree-unverified-registry:quay.io/fedora/fedora-coreos:testing"}
            ], "transaction": null}"#,
        )
        .unwrap();
        let booted = status.booted().unwrap();
        assert_eq!(booted.version, "39.2");
        assert_eq!(booted.ostree_ref(), "fedora/x86_64/coreos/testing");
        assert!(booted.container_image_reference.is_some());
    }

    #[test]
    fn test_repo_path_rejects_escape() {
        let root = Path::new("/var/srv/upgrade/repo");
        assert_eq!(
            repo_path(root, "/objects/ab/cdef.filez"),
            Some(root.join("objects/ab/cdef.filez"))
        );
        assert_eq!(repo_path(root, "/../../etc/shadow"), None);
        assert_eq!(repo_path(root, "/%2E%2E/etc/shadow"), None);
    }

    async fn mock_cluster(
        provider: &crate::platform::mock::MockProvider,
    ) -> (TestCluster, Arc<dyn Machine>) {
        use crate::harness::H;
        use crate::platform::{MachineOptions, Provider, RuntimeConfig};
        use crate::register::Test;

        let cluster = provider.new_cluster(RuntimeConfig::default()).await.unwrap();
        let m = cluster
            .new_machine(None, &MachineOptions::default())
            .await
            .unwrap();
        let test = Arc::new(Test::new("fcos.upgrade.basic", |_c| async { Ok(()) }));
        let c = TestCluster::new(H::root("fcos.upgrade.basic"), cluster, test);
        (c, m)
    }

    #[tokio::test]
    async fn test_graph_synced_to_machine() {
        let provider = crate::platform::mock::MockProvider::new("qemu").os_version("39.20240104.3.0");
        let (c, m) = mock_cluster(&provider).await;

        let mut g = Graph::new();
        g.seed_from_machine(&c, m.as_ref()).await.unwrap();
        g.add_update(&c, m.as_ref(), "39.20240104.3.0.kola", "bbbb")
            .await
            .unwrap();

        let synced = m.ssh("cat graph.json").await.unwrap().stdout_str();
        let synced: Graph = serde_json::from_str(&synced).unwrap();
        assert_eq!(synced, g);
        assert_eq!(synced.nodes.len(), 2);
        assert_eq!(synced.nodes[0].version, "39.20240104.3.0");
        assert_eq!(synced.edges, vec![[0, 1]]);
    }

    #[tokio::test]
    async fn test_wait_for_upgrade_to_version() {
        let provider = crate::platform::mock::MockProvider::new("qemu")
            .os_version("39.1")
            .reboot_on("systemctl start zincati.service", Some("39.1.kola"));
        let (c, m) = mock_cluster(&provider).await;

        wait_for_upgrade_to_version(&c, m.as_ref(), "39.1.kola")
            .await
            .unwrap();
        assert_eq!(booted_deployment(&c, m.as_ref()).await.unwrap().version, "39.1.kola");
        assert!(provider
            .history()
            .iter()
            .any(|cmd| cmd.ends_with("<reboot>")));
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).as_bytes())
            .await
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_serve_graph_and_repo() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join("config"), "[core]\nmode=archive\n").unwrap();
        let graph = dir.path().join("graph.json");
        let mut g = Graph::new();
        g.seed("1", "a");
        std::fs::write(&graph, serde_json::to_vec(&g).unwrap()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, ServeRoots { graph, repo }));

        let resp = get(addr, "/v1/graph").await;
        assert!(resp.starts_with("HTTP/1.1 200 OK"));
        let body = resp.split("\r\n\r\n").nth(1).unwrap();
        assert_eq!(serde_json::from_str::<Graph>(body).unwrap(), g);

        assert!(get(addr, "/config").await.ends_with("mode=archive\n"));
        assert!(get(addr, "/missing").await.starts_with("HTTP/1.1 404"));
        server.abort();
    }

    #[tokio::test]
    async fn test_serve_request_split_across_writes() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(repo.join("refs/heads")).unwrap();
        std::fs::write(repo.join("refs/heads/kola"), "4e1b9d5ac31f\n").unwrap();
        let roots = ServeRoots {
            graph: dir.path().join("graph.json"),
            repo,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, roots));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        for chunk in ["GET /refs/he", "ads/kola HTTP/1.1\r\nHo", "st: localhost\r\n", "\r\n"] {
            stream.write_all(chunk.as_bytes()).await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK"), "{}", out);
        assert!(out.ends_with("4e1b9d5ac31f\n"));
        server.abort();
    }
}
