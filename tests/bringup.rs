//! End-to-end bringup tests. These drive the real kernel: they need root
//! with CAP_NET_ADMIN and CAP_SYS_ADMIN, so they are ignored by default.
//!
//! Run with: cargo test -- --ignored

use nsnetsim::daemons::{Bird, Daemon, Supervisor};
use nsnetsim::devices::{AddressFamily, Node, Router, RouterKind};
use nsnetsim::topology::{State, Topology};

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use std::path::Path;
use std::process::Command;

fn random_suffix(n: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect()
}

fn netns_exists(name: &str) -> bool {
    Path::new("/var/run/netns").join(name).exists()
}

fn link_exists(name: &str) -> bool {
    Command::new("ip")
        .args(["link", "show", name])
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn ping_from(netns: &str, target: &str) -> bool {
    Command::new("ip")
        .args(["netns", "exec", netns, "ping", "-c", "1", "-W", "2", target])
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

#[tokio::test]
#[ignore = "requires root with CAP_NET_ADMIN and CAP_SYS_ADMIN"]
async fn two_routers_ping_over_switch() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let tag = random_suffix(4);
    let r1 = format!("r1-{tag}");
    let r2 = format!("r2-{tag}");
    let sw = format!("sw-{tag}");

    let mut topology = Topology::new();
    topology.add_router(&r1, RouterKind::Plain, None).unwrap();
    topology.add_router(&r2, RouterKind::Plain, None).unwrap();
    topology
        .add_interface(&r1, "sim0", None, Some(&sw))
        .unwrap();
    topology
        .add_interface(&r2, "sim0", None, Some(&sw))
        .unwrap();
    topology
        .add_address(&r1, "sim0", "10.199.0.1", 24, AddressFamily::V4)
        .unwrap();
    topology
        .add_address(&r2, "sim0", "10.199.0.2", 24, AddressFamily::V4)
        .unwrap();

    topology.run().await.unwrap();
    assert_eq!(topology.state(), State::Running);
    assert!(netns_exists(&r1));
    assert!(netns_exists(&r2));
    assert!(link_exists(&sw));

    assert!(ping_from(&r1, "10.199.0.2"), "r1 cannot reach r2");
    assert!(ping_from(&r2, "10.199.0.1"), "r2 cannot reach r1");

    topology.destroy().await.unwrap();
    assert_eq!(topology.state(), State::Destroyed);
    assert!(!netns_exists(&r1));
    assert!(!netns_exists(&r2));
    assert!(!link_exists(&sw));
    assert!(!link_exists(&format!("{r1}-sim0")));

    // second destroy is a no-op
    topology.destroy().await.unwrap();
}

#[tokio::test]
#[ignore = "requires root with CAP_NET_ADMIN and CAP_SYS_ADMIN"]
async fn preexisting_bridge_fails_without_mutation() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let tag = random_suffix(4);
    let sw = format!("sw-{tag}");
    let r1 = format!("r1-{tag}");

    let status = Command::new("ip")
        .args(["link", "add", &sw, "type", "bridge"])
        .status()
        .unwrap();
    assert!(status.success());

    let mut topology = Topology::new();
    topology.add_router(&r1, RouterKind::Plain, None).unwrap();
    topology
        .add_interface(&r1, "sim0", None, Some(&sw))
        .unwrap();

    let err = topology.run().await.unwrap_err();
    assert!(matches!(
        err,
        nsnetsim::error::Error::NameCollision(_)
    ));
    assert!(err.to_string().contains(&sw));

    // the probe must not have touched the host
    assert!(!netns_exists(&r1));
    assert!(!link_exists(&format!("{r1}-sim0")));
    assert!(link_exists(&sw), "pre-existing bridge must survive");

    let _ = Command::new("ip").args(["link", "del", &sw]).status();
}

#[tokio::test]
#[ignore = "requires root with CAP_NET_ADMIN and CAP_SYS_ADMIN"]
async fn failed_bringup_unwinds_completely() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let tag = random_suffix(4);
    let r1 = format!("r1-{tag}");
    let r2 = format!("r2-{tag}");

    let mut topology = Topology::new();
    topology.add_router(&r1, RouterKind::Plain, None).unwrap();
    topology.add_router(&r2, RouterKind::Plain, None).unwrap();
    topology.add_interface(&r1, "sim0", None, None).unwrap();
    topology
        .add_address(&r1, "sim0", "10.199.1.1", 24, AddressFamily::V4)
        .unwrap();
    // a daemon whose binary cannot exist fails after r1 is fully up
    // (r3 sorts after r1 and r2, so both plain routers are up by then)
    let r3 = format!("r3-{tag}");
    let config = std::env::temp_dir().join(format!("bird-{tag}.conf"));
    std::fs::write(&config, "").unwrap();
    let mut broken = Router::new(&r3);
    broken.daemon = Some(Supervisor::new(
        &r3,
        Daemon::Bird(Bird {
            daemon_path: String::from("/nonexistent/bird"),
        }),
        config,
    ));
    topology.add_node(Node::Router(broken)).unwrap();

    let err = topology.run().await.unwrap_err();
    assert!(matches!(
        err,
        nsnetsim::error::Error::ExternalFailure(..) | nsnetsim::error::Error::NotFound(_)
    ));
    assert_eq!(topology.state(), State::Destroyed);

    assert!(!netns_exists(&r1));
    assert!(!netns_exists(&r2));
    assert!(!link_exists(&format!("{r1}-sim0")));
    assert!(!Path::new("/run/nsnetsim").join(format!("r3-{tag}")).exists());
}
