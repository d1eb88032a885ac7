//! Cross-machine networking

use std::time::Duration;

use crate::cluster::TestCluster;
use crate::harness::TestResult;
use crate::platform::Machine;
use crate::register::Test;
use crate::registry::RegistryBuilder;
use crate::util::{retry_until, run_paired, Ready};
use crate::{Error, Result};

const PORT: u16 = 9988;
const TOKEN: &str = "kola-network-ping";
const RECEIVED: &str = "/tmp/kola-received";
const DEADLINE: Duration = Duration::from_secs(90);
const POLL: Duration = Duration::from_secs(1);
const WAIT: Duration = Duration::from_secs(30);

pub fn register(builder: &mut RegistryBuilder) {
    builder.register(
        Test::new("coreos.network.reachability", reachability)
            .description("A machine can open a TCP connection to another one")
            .cluster_size(2)
            .tags(&["network"]),
    );
}

async fn reachability(c: TestCluster) -> TestResult {
    let listener = c.machine(0)?;
    let talker = c.machine(1)?;
    let addr = listener.ip();

    run_paired(
        DEADLINE,
        |ready| listen(&c, listener.as_ref(), ready),
        || talk(&c, talker.as_ref(), &addr),
    )
    .await
    .map_err(|e| c.fatal(format!("{} -> {}: {}", talker.id(), listener.id(), e)))
}

async fn listen(c: &TestCluster, m: &dyn Machine, ready: Ready) -> Result<()> {
    c.ssh(
        m,
        &format!(
            "sudo systemd-run --unit kola-listen sh -c 'ncat -l {} > {}'",
            PORT, RECEIVED
        ),
    )
    .await?;

    let probe = format!("ss -Htln sport = :{}", PORT);
    let probe = probe.as_str();
    retry_until(WAIT, POLL, move || async move {
        if c.ssh(m, probe).await?.trim().is_empty() {
            return Err(Error::Timeout(format!("nothing listening on port {}", PORT)));
        }
        Ok(())
    })
    .await?;
    ready.signal();

    let read = format!("cat {}", RECEIVED);
    let read = read.as_str();
    retry_until(WAIT, POLL, move || async move {
        let got = c.ssh(m, read).await?;
        if !got.contains(TOKEN) {
            return Err(Error::Timeout(format!("received {:?} so far", got.trim())));
        }
        Ok(())
    })
    .await
}

async fn talk(c: &TestCluster, m: &dyn Machine, addr: &str) -> Result<()> {
    c.ssh(
        m,
        &format!(
            "echo {} | ncat --send-only {} {}",
            TOKEN,
            shell_words::quote(addr),
            PORT
        ),
    )
    .await
    .map(|_| ())
}
