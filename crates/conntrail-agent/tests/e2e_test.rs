//! End-to-end tests for the agent.
//!
//! Each test builds a fake `/proc` tree (conntrack table, socket tables, and
//! processes), runs a full [`Agent`] against it with an in-memory sink, and
//! rewrites the conntrack table to drive connections through their lifecycle.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::fmt::Write as _;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::fs::symlink;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conntrail_agent::{Agent, AgentError, AgentReport};
use conntrail_common::config::{AgentConfig, FilterRuleSet, SinkTarget};
use conntrail_common::record::EventRecord;
use conntrail_common::types::{Phase, Protocol};
use conntrail_dispatch::{DeliveryOutcome, Sink};
use tokio::sync::oneshot;

// ── Fixtures ─────────────────────────────────────────────────────────

const NETWORK_MANAGER: &str = "ipv4     2 tcp      6 431999 ESTABLISHED src=172.16.144.102 dst=104.197.3.80 \
    sport=59325 dport=80 src=104.197.3.80 dst=172.16.144.102 sport=80 dport=59325 [ASSURED] mark=0 zone=0 use=2";
const DNS_QUERY: &str = "ipv4     2 udp      17 29 src=172.16.144.102 dst=10.0.0.1 sport=40000 dport=53 \
    [UNREPLIED] src=10.0.0.1 dst=172.16.144.102 sport=53 dport=40000 mark=0 zone=0 use=2";
const SYSLOG_DELIVERY: &str = "ipv4     2 tcp      6 431999 ESTABLISHED src=172.16.144.102 dst=10.0.0.5 \
    sport=41000 dport=514 src=10.0.0.5 dst=172.16.144.102 sport=514 dport=41000 [ASSURED] mark=0 zone=0 use=2";

const NM_INODE: u64 = 1_227_937;

#[derive(Clone, Default)]
struct MemorySink {
    records: Arc<Mutex<Vec<EventRecord>>>,
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn deliver(&mut self, record: &EventRecord) -> DeliveryOutcome {
        self.records.lock().unwrap().push(record.clone());
        DeliveryOutcome::Delivered
    }

    async fn close(&mut self) {}
}

impl MemorySink {
    fn snapshot(&self) -> Vec<EventRecord> {
        self.records.lock().unwrap().clone()
    }

    async fn wait_for(&self, count: usize) -> Vec<EventRecord> {
        for _ in 0..250 {
            let records = self.snapshot();
            if records.len() >= count {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {count} records, got {:?}", self.snapshot());
    }
}

/// Gives the ingestion thread time to finish the current sample.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

fn write_conntrack(root: &Path, lines: &[&str]) {
    let mut text = lines.join("\n");
    text.push('\n');
    let staging = root.join("net").join("nf_conntrack.new");
    fs::write(&staging, text).expect("staging table");
    fs::rename(&staging, root.join("net").join("nf_conntrack")).expect("swap table");
}

fn hex_endpoint(address: SocketAddr) -> String {
    let IpAddr::V4(v4) = address.ip() else {
        unreachable!("fixtures use IPv4");
    };
    format!("{:08X}:{:04X}", u32::from_ne_bytes(v4.octets()), address.port())
}

fn write_tcp_table(root: &Path, local: SocketAddr, remote: SocketAddr, uid: u32, inode: u64) {
    let mut text = String::from(
        "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n",
    );
    let _ = writeln!(
        text,
        "   0: {} {} 01 00000000:00000000 00:00000000 00000000 {uid:5} 0 {inode} 1 0000000000000000 20 4 30 10 -1",
        hex_endpoint(local),
        hex_endpoint(remote),
    );
    fs::write(root.join("net").join("tcp"), text).expect("tcp table");
}

fn add_process(root: &Path, pid: i32, comm: &str, cmdline: &[&str], inode: u64) {
    let dir = root.join(pid.to_string());
    fs::create_dir_all(dir.join("fd")).expect("fd dir");
    let stat = format!(
        "{pid} ({comm}) S 1 {pid} {pid} 0 -1 4194560 2315 0 19 0 21 28 0 0 20 0 3 0 1187 \
         348712960 4780 18446744073709551615 1 1 0 0 0 0 0 4096 17410 0 0 0 17 1 0 0 0 0 0 \
         0 0 0 0 0 0 0 0"
    );
    fs::write(dir.join("stat"), stat).expect("stat");
    let mut raw_cmdline = cmdline.join("\0");
    raw_cmdline.push('\0');
    fs::write(dir.join("cmdline"), raw_cmdline).expect("cmdline");
    symlink(format!("socket:[{inode}]"), dir.join("fd").join("3")).expect("fd link");
}

/// A host with NetworkManager talking HTTP, a DNS query, and the agent's own
/// delivery to a remote syslog collector.
fn fake_host() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("net")).expect("net dir");
    write_conntrack(dir.path(), &[NETWORK_MANAGER, DNS_QUERY, SYSLOG_DELIVERY]);
    write_tcp_table(
        dir.path(),
        "172.16.144.102:59325".parse().unwrap(),
        "104.197.3.80:80".parse().unwrap(),
        0,
        NM_INODE,
    );
    add_process(
        dir.path(),
        656,
        "NetworkManager",
        &["/usr/sbin/NetworkManager", "--no-daemon"],
        NM_INODE,
    );
    dir
}

fn config(root: &Path, suppress_dns: bool) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.source.proc_root = root.to_path_buf();
    config.source.poll_interval_ms = 20;
    config.resolver.socket_retry_delay_ms = 0;
    config.filters = FilterRuleSet {
        suppress_non_process_connections: false,
        suppress_dns,
        suppress_self_traffic: true,
    };
    config.sinks = vec![SinkTarget::SyslogTcp {
        address: "10.0.0.5:514".parse().unwrap(),
    }];
    config
}

/// Runs the agent until `drive` returns, then shuts it down.
async fn run_agent<F, Fut>(config: AgentConfig, sink: MemorySink, drive: F) -> Result<AgentReport, AgentError>
where
    F: FnOnce(MemorySink) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let (stop, stopped) = oneshot::channel::<()>();
    let agent = Agent::with_sinks(config, vec![Box::new(sink.clone())]);
    let shutdown = async move {
        let _ = stopped.await;
    };
    let driver = async move {
        drive(sink).await;
        let _ = stop.send(());
    };
    let (report, ()) = tokio::join!(agent.run(shutdown), driver);
    report
}

// ── Lifecycle ────────────────────────────────────────────────────────

#[tokio::test]
async fn attributed_open_and_close_pair_up() {
    let host = fake_host();
    let root = host.path().to_path_buf();
    let sink = MemorySink::default();
    let observed = sink.clone();

    let report = run_agent(config(&root, true), sink, |sink| async move {
        let _ = sink.wait_for(1).await;
        write_conntrack(&root, &[]);
        let _ = sink.wait_for(2).await;
        settle().await;
    })
    .await
    .expect("agent run");

    let records = observed.snapshot();
    assert_eq!(records.len(), 2, "{records:?}");

    let open = &records[0];
    assert_eq!(open.phase, Phase::Open);
    assert_eq!(open.protocol, Protocol::Tcp);
    assert_eq!(open.source_port, 59325);
    assert_eq!(open.destination_port, 80);
    assert_eq!(open.uid, Some(0));
    let details = open.program_details.as_ref().expect("attributed");
    assert_eq!(details.pid, 656);
    assert_eq!(details.inode, NM_INODE);
    assert_eq!(details.process_name, "NetworkManager");
    assert_eq!(details.command_line, vec!["/usr/sbin/NetworkManager", "--no-daemon"]);

    let close = &records[1];
    assert_eq!(close.phase, Phase::Close);
    assert_eq!(close.uuid, open.uuid);
    assert_eq!(close.hash, open.hash);
    assert!(close.program_details.is_none());
    assert!(close.uid.is_none());

    assert_eq!(report.pipeline.emitted, 2);
    assert_eq!(report.pipeline.dropped_dns, 1);
    assert_eq!(report.pipeline.dropped_self, 1);
    assert_eq!(report.pipeline.suppressed_closes, 2);
    assert_eq!(report.sinks.len(), 1);
    assert_eq!(report.sinks[0].stats.delivered, 2);
}

#[tokio::test]
async fn dns_passes_when_its_rule_is_off() {
    let host = fake_host();
    let sink = MemorySink::default();
    let observed = sink.clone();

    let report = run_agent(config(host.path(), false), sink, |sink| async move {
        let _ = sink.wait_for(2).await;
        settle().await;
    })
    .await
    .expect("agent run");

    let records = observed.snapshot();
    assert!(records.iter().any(|r| r.destination_port == 53));
    assert!(records.iter().all(|r| r.destination_port != 514));
    assert_eq!(report.pipeline.dropped_dns, 0);
    assert_eq!(report.pipeline.dropped_self, 1);
}

#[tokio::test]
async fn open_connections_are_not_closed_on_shutdown() {
    let host = fake_host();
    let sink = MemorySink::default();
    let observed = sink.clone();

    let _ = run_agent(config(host.path(), true), sink, |sink| async move {
        let _ = sink.wait_for(1).await;
        settle().await;
    })
    .await
    .expect("agent run");

    let records = observed.snapshot();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].phase, Phase::Open);
}

// ── Failures ─────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_conntrack_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let agent = Agent::with_sinks(config(dir.path(), true), vec![Box::new(MemorySink::default())]);
    let err = agent.run(std::future::pending()).await.err().expect("error");
    assert!(matches!(err, AgentError::Source(_)), "{err}");
}

#[tokio::test]
async fn configuration_without_sinks_is_rejected() {
    let host = fake_host();
    let mut config = config(host.path(), true);
    config.sinks.clear();
    let agent = Agent::new(config);
    let err = agent.run(std::future::pending()).await.err().expect("error");
    assert!(matches!(err, AgentError::Config(_)), "{err}");
}
