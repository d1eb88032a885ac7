//! Smoke tests every image has to pass

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::Command;

use crate::cluster::TestCluster;
use crate::harness::TestResult;
use crate::register::{NativeFunc, NativeFuture, Test};
use crate::registry::RegistryBuilder;
use crate::{Error, Result};

const PORT_TIMEOUT: Duration = Duration::from_secs(3);

pub const PORT_SSH: NativeFunc = NativeFunc::new("PortSSH", port_ssh);
pub const READ_ONLY: NativeFunc = NativeFunc::new("ReadOnly", read_only);
pub const MACHINE_ID: NativeFunc = NativeFunc::new("MachineID", machine_id);
pub const SERVICES_ACTIVE: NativeFunc = NativeFunc::new("ServicesActive", services_active);
pub const NETWORK_SCRIPTS: NativeFunc =
    NativeFunc::new("NetworkScripts", network_scripts).excluding(&["s390x"]);

pub fn register(builder: &mut RegistryBuilder) {
    builder.register(
        Test::new("coreos.basic", local_tests)
            .description("Runs the in-guest smoke checks through kolet")
            .cluster_size(1)
            .native(PORT_SSH)
            .native(READ_ONLY)
            .native(MACHINE_ID)
            .native(SERVICES_ACTIVE)
            .native(NETWORK_SCRIPTS),
    );
    builder.register(
        Test::new("coreos.misc.machine-id-persists", machine_id_persists)
            .description("The machine ID survives a reboot")
            .cluster_size(1)
            .fail_fast(true)
            .tags(&["reboot"]),
    );
}

/// Run every native function the selected descriptor still carries
async fn local_tests(c: TestCluster) -> TestResult {
    let m = c.machine(0)?;
    for func in &c.test().native_funcs {
        c.run_native(func, m.as_ref()).await;
    }
    Ok(())
}

async fn machine_id_persists(c: TestCluster) -> TestResult {
    let m = c.machine(0)?;
    let m = m.as_ref();
    let id = c.must_ssh(m, "cat /etc/machine-id").await?;
    let id = id.trim();
    if id.is_empty() {
        return Err(c.fatal("/etc/machine-id is empty"));
    }

    c.run_logged("reboot", |c| async move {
        c.reboot(m)
            .await
            .map_err(|e| c.fatal(format!("reboot failed: {}", e)))
    })
    .await;
    c.run_logged("unchanged", |c| async move {
        c.assert_cmd_output_contains(m, "cat /etc/machine-id", id)
            .await
    })
    .await;
    Ok(())
}

fn port_ssh() -> NativeFuture {
    Box::pin(check_port("127.0.0.1:22"))
}

async fn check_port(addr: &'static str) -> Result<()> {
    tokio::time::timeout(PORT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Timeout(format!("connecting to {}", addr)))??;
    Ok(())
}

fn read_only() -> NativeFuture {
    Box::pin(async {
        let mounts = tokio::fs::read_to_string("/proc/self/mounts").await?;
        check_usr_read_only(&mounts)
    })
}

fn check_usr_read_only(mounts: &str) -> Result<()> {
    let usr = mounts
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>())
        .find(|fields| fields.len() >= 4 && fields[1] == "/usr")
        .ok_or_else(|| Error::NativeFunc("/usr is not a mount point".into()))?;
    if !usr[3].split(',').any(|opt| opt == "ro") {
        return Err(Error::NativeFunc(format!(
            "/usr is mounted read-write ({})",
            usr[3]
        )));
    }
    Ok(())
}

fn machine_id() -> NativeFuture {
    Box::pin(async {
        let id = tokio::fs::read_to_string("/etc/machine-id").await?;
        check_machine_id(&id)
    })
}

fn check_machine_id(id: &str) -> Result<()> {
    let id = id.trim();
    if id.len() != 32 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::NativeFunc(format!("invalid machine ID {:?}", id)));
    }
    Ok(())
}

fn services_active() -> NativeFuture {
    Box::pin(async {
        let out = Command::new("systemctl")
            .args(["is-active", "multi-user.target"])
            .output()
            .await?;
        if !out.status.success() {
            return Err(Error::NativeFunc(format!(
                "multi-user.target is {}",
                String::from_utf8_lossy(&out.stdout).trim()
            )));
        }
        Ok(())
    })
}

fn network_scripts() -> NativeFuture {
    Box::pin(async {
        let mut entries = match tokio::fs::read_dir("/etc/sysconfig/network-scripts").await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("ifcfg-") {
                return Err(Error::NativeFunc(format!(
                    "found legacy network script {}",
                    name
                )));
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usr_mount_options() {
        let mounts = "/dev/vda4 /sysroot xfs ro,relatime 0 0\n\
                      /dev/vda4 /usr xfs ro,seclabel,relatime 0 0\n";
        assert!(check_usr_read_only(mounts).is_ok());
        let rw = mounts.replace("ro,seclabel", "rw,seclabel");
        assert!(check_usr_read_only(&rw).is_err());
        assert!(check_usr_read_only("/dev/vda4 / xfs rw 0 0\n").is_err());
    }

    #[test]
    fn test_machine_id_format() {
        assert!(check_machine_id("0123456789abcdef0123456789abcdef\n").is_ok());
        assert!(check_machine_id("uninitialized\n").is_err());
        assert!(check_machine_id("").is_err());
    }
}
