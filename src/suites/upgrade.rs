//! Upgrade tests
//!
//! `fcos.upgrade.basic` points Zincati and the `fedora` OSTree remote at
//! `localhost:8080`, where the `httpd` native function serves a synthesized
//! update graph and a local repository. The test then commits a new
//! version on top of the booted one and expects Zincati to reboot into it.

use serde_json::json;

use crate::cluster::TestCluster;
use crate::conf::{data_url, UserData};
use crate::harness::TestResult;
use crate::register::{NativeFunc, NativeFuture, Test};
use crate::registry::RegistryBuilder;
use crate::upgrade::{self, booted_deployment, wait_for_upgrade_to_version, Graph, OSTREE_REPO, WORKDIR};

pub const UPGRADE_BASIC: &str = "fcos.upgrade.basic";

pub const HTTPD: NativeFunc = NativeFunc::new("httpd", httpd);

fn httpd() -> NativeFuture {
    Box::pin(upgrade::httpd())
}

pub fn register(builder: &mut RegistryBuilder) {
    builder.register_upgrade(
        Test::new(UPGRADE_BASIC, upgrade_basic)
            .description("Zincati upgrades the booted release to a newer commit")
            .cluster_size(1)
            .fail_fast(true)
            .native(HTTPD)
            .tags(&["upgrade"])
            .distros(&["fcos"])
            .user_data(user_data()),
    );
}

/// First-boot config: quiet Zincati until the test starts it, serve
/// updates from `localhost:8080` and start `httpd` once kolet lands
fn user_data() -> UserData {
    let file = |path: &str, contents: &str| {
        json!({
            "path": path,
            "contents": { "source": data_url(contents) },
            "overwrite": true,
            "mode": 0o644,
        })
    };
    let kolet = "/var/home/core/kolet";
    let config = json!({
        "ignition": { "version": "3.0.0" },
        "systemd": {
            "units": [
                {
                    "name": "zincati.service",
                    "enabled": false,
                    "dropins": [{
                        "name": "verbose.conf",
                        "contents": "[Service]\nEnvironment=ZINCATI_VERBOSITY=\"-vvvv\"\n",
                    }],
                },
                {
                    "name": "kolet-httpd.path",
                    "enabled": true,
                    "contents": format!("[Path]\nPathExists={}\n[Install]\nWantedBy=multi-user.target\n", kolet),
                },
                {
                    "name": "kolet-httpd.service",
                    "contents": format!("[Service]\nExecStart={} run {} httpd\n", kolet, UPGRADE_BASIC),
                },
            ],
        },
        "storage": {
            "files": [
                file(
                    "/etc/zincati/config.d/99-cincinnati-url.toml",
                    "cincinnati.base_url = \"http://localhost:8080\"\n",
                ),
                file("/etc/zincati/config.d/99-updates-enabled.toml", "updates.enabled = true\n"),
                file(
                    "/etc/zincati/config.d/99-agent-timing-speedup.toml",
                    "agent.timing.steady_interval_secs = 20\n",
                ),
                file(
                    "/etc/ostree/remotes.d/fedora.conf",
                    "[remote \"fedora\"]\nurl=http://localhost:8080\ngpg-verify=false\n",
                ),
            ],
            "directories": [{
                "path": WORKDIR,
                "mode": 0o755,
                "user": { "name": "core" },
            }],
        },
    });
    UserData::ignition(config.to_string())
}

async fn upgrade_basic(c: TestCluster) -> TestResult {
    let m = c.machine(0)?;
    let m = m.as_ref();
    let booted = booted_deployment(&c, m).await?;
    if booted.container_image_reference.is_some() {
        return Err(c.skip("booted from a container image; no local commit to serve"));
    }
    let ostree_ref = booted.ostree_ref().to_string();
    let parent = booted.checksum.clone();
    let new_version = format!("{}.kola", booted.version);
    let mut graph = Graph::new();

    let (r, p) = (&ostree_ref, &parent);
    c.run("setup", |c| async move {
        c.run_cmd_sync(m, &format!("ostree --repo={} init --mode=archive", OSTREE_REPO))
            .await?;
        c.run_cmd_sync(
            m,
            &format!("sudo ostree --repo={} pull-local /ostree/repo {}", OSTREE_REPO, p),
        )
        .await?;
        c.run_cmd_sync(
            m,
            &format!("sudo ostree --repo={} refs --create={} {}", OSTREE_REPO, r, p),
        )
        .await
    })
    .await;

    let (g, v) = (&mut graph, &new_version);
    c.run("upgrade-from-current", |c| async move {
        g.seed_from_machine(&c, m).await?;
        let commit = c
            .must_ssh(
                m,
                &format!(
                    "sudo ostree commit --repo={} -b {} --tree=ref={} \
                     --add-metadata-string=version={} \
                     --keep-metadata=fedora-coreos.stream \
                     --keep-metadata=coreos-assembler.basearch --parent={}",
                    OSTREE_REPO, r, p, v, p
                ),
            )
            .await?;
        let commit = commit.trim();
        if commit.is_empty() {
            return Err(c.fatal("ostree commit printed no checksum"));
        }
        g.add_update(&c, m, v, commit).await?;
        wait_for_upgrade_to_version(&c, m, v).await
    })
    .await;
    Ok(())
}
