//! Integration tests for netns-topology
//!
//! The tests that build real topologies need CAP_NET_ADMIN and run behind
//! the `sudo-tests` feature; the rest exercise the unprivileged surface and
//! always run.

use netns_topology::{Manager, TopologyError};

/// Initialize logging for tests
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("netns_topology=debug")
        .try_init();
}

#[tokio::test(flavor = "multi_thread")]
async fn manager_creation() {
    init_logging();

    // Opening the scope only creates a netlink socket; it works without
    // privileges, everything after it does not.
    let result = Manager::new().await;
    match result {
        Ok(manager) => {
            let root = manager.physical_host();
            assert!(manager.is_running(root));
            assert!(!manager.name(root).is_empty());
        }
        Err(e) => {
            panic!("opening the scope should not need privileges: {}", e);
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn error_variants_display() {
    init_logging();

    let errors = vec![
        TopologyError::EntityUp("host0".to_string()),
        TopologyError::EntityDown("host0".to_string()),
        TopologyError::NameCollision("sw".to_string()),
        TopologyError::UnknownInterface("eth9".to_string()),
    ];
    for error in errors {
        let _display = error.to_string();
        let _debug = format!("{:?}", error);
        let _: Box<dyn std::error::Error> = Box::new(error);
    }
}

#[cfg(feature = "sudo-tests")]
mod sudo {
    use super::init_logging;
    use anyhow::{ensure, Result};
    use netns_topology::{
        AddressError, ConnectOptions, Manager, NetemSpec, Network, NodeId, RouteDirection,
        SpawnOptions, TcAction, TopologyError,
    };
    use std::io::Read;
    use std::path::Path;

    /// Run a command in a host and return its stdout.
    async fn output(vnet: &Manager, host: NodeId, argv: &[&str]) -> Result<String> {
        let mut child = vnet.spawn(host, argv, SpawnOptions::piped_stdout())?;
        let mut stdout = child.stdout.take().expect("stdout was piped");
        let status = child.wait().await?;
        ensure!(status == 0, "{:?} exited with status {}", argv, status);
        let mut buf = String::new();
        stdout.read_to_string(&mut buf)?;
        Ok(buf)
    }

    async fn ping(vnet: &Manager, host: NodeId, target: &str) -> Result<bool> {
        let mut child = vnet.spawn(
            host,
            &["ping", "-c", "1", "-W", "5", target],
            SpawnOptions::quiet(),
        )?;
        Ok(child.wait().await? == 0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_subnet() -> Result<()> {
        init_logging();

        let mut network = Network::new("192.168.0.0/24", None)?;
        let mut vnet = Manager::new().await?;
        let switch = vnet.switch("sw").await?;

        let mut hosts = Vec::new();
        for i in 0..3 {
            let name = format!("host{}", i);
            let host = vnet.host(&name).await?;
            vnet.connect(host, switch, "eth0").await?;
            let addr = vnet.add_ip(host, "eth0", &mut network).await?;
            ensure!(addr.to_string() == format!("192.168.0.{}/24", i + 1));
            hosts.push(host);
        }
        vnet.update_hosts().await?;

        // Hosts resolve each other through the propagated hosts files.
        let hosts_file = std::fs::read_to_string("/etc/netns/host0/hosts")?;
        ensure!(hosts_file.contains("192.168.0.2\thost1\t"));
        ensure!(hosts_file.contains("192.168.0.3\thost2\t"));

        ensure!(ping(&vnet, hosts[0], "host1").await?);
        ensure!(ping(&vnet, hosts[0], "host2").await?);

        vnet.shutdown().await;
        for i in 0..3 {
            ensure!(!Path::new(&format!("/var/run/netns/host{}", i)).exists());
            ensure!(!Path::new(&format!("/etc/netns/host{}", i)).exists());
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn routed_subnets() -> Result<()> {
        init_logging();

        let mut vnet = Manager::new().await?;
        let sw1 = vnet
            .switch_with_network("sw1", Network::new("192.168.0.0/24", Some(1))?)
            .await?;
        let sw2 = vnet
            .switch_with_network("sw2", Network::new("10.0.0.0/24", Some(2))?)
            .await?;
        let host1 = vnet.host("host1").await?;
        let host2 = vnet.host("host2").await?;
        let router = vnet.router("router").await?;

        vnet.connect(host1, sw1, "eth0").await?;
        vnet.connect(router, sw1, "eth0").await?;
        vnet.connect(router, sw2, "eth1").await?;
        vnet.connect(host2, sw2, "eth0").await?;

        // The router holds the reserved slots of both subnets.
        ensure!(
            vnet.addresses(router, "eth0").unwrap()[0].to_string() == "192.168.0.1/24"
        );
        ensure!(vnet.addresses(router, "eth1").unwrap()[0].to_string() == "10.0.0.2/24");

        vnet.update_hosts().await?;
        vnet.simple_route().await?;

        let routes1 = output(&vnet, host1, &["ip", "route", "show", "default"]).await?;
        ensure!(routes1.contains("via 192.168.0.1"));
        let routes2 = output(&vnet, host2, &["ip", "route", "show", "default"]).await?;
        ensure!(routes2.contains("via 10.0.0.2"));

        ensure!(ping(&vnet, host1, "host2").await?);

        vnet.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn routed_stars() -> Result<()> {
        init_logging();

        let mut vnet = Manager::new().await?;
        let central = vnet.router("central").await?;

        let mut star_hosts = Vec::new();
        for i in 0..3 {
            let name = format!("star{}", i);
            let network = Network::new(&format!("192.168.{}.0/24", i), Some(1))?;
            let switch = vnet
                .switch_with_network(&format!("{}_sw", name), network)
                .await?;
            let router = vnet.router(&format!("{}_router", name)).await?;
            vnet.connect(router, switch, "eth0").await?;

            let mut hosts = Vec::new();
            for h in 0..3 {
                let host = vnet.host(&format!("{}_host{}", name, h)).await?;
                vnet.connect(host, switch, "eth0").await?;
                hosts.push(host);
            }
            star_hosts.push(hosts);

            // Transit link from the central router down into the star.
            let mut transit = Network::new(&format!("10.0.{}.0/24", i), None)?;
            vnet.connect_with(
                central,
                router,
                &name,
                ConnectOptions {
                    remote_name: Some(format!("up{}", i)),
                    ..Default::default()
                },
            )
            .await?;
            vnet.add_ip(central, &name, &mut transit).await?;
            vnet.add_ip(router, &format!("up{}", i), &mut transit).await?;
        }

        vnet.simple_route().await?;
        vnet.update_hosts().await?;

        let routes = output(&vnet, central, &["ip", "route"]).await?;
        ensure!(routes.contains("192.168.0.0/24 via 10.0.0.2"));
        ensure!(routes.contains("192.168.1.0/24 via 10.0.1.2"));
        ensure!(routes.contains("192.168.2.0/24 via 10.0.2.2"));

        ensure!(ping(&vnet, star_hosts[0][0], "star2_host2").await?);

        // The planner is idempotent: a second run leaves a working network
        // and identical tables behind.
        let before = output(&vnet, central, &["ip", "route"]).await?;
        vnet.simple_route().await?;
        let after = output(&vnet, central, &["ip", "route"]).await?;
        ensure!(before == after);
        ensure!(ping(&vnet, star_hosts[0][0], "star2_host2").await?);

        vnet.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn netem_delays_pings() -> Result<()> {
        init_logging();

        let mut network = Network::new("192.168.7.0/24", None)?;
        let mut vnet = Manager::new().await?;
        let switch = vnet.switch("nsw").await?;
        let a = vnet.host("netem0").await?;
        let b = vnet.host("netem1").await?;
        for host in [a, b] {
            vnet.connect(host, switch, "eth0").await?;
            vnet.add_ip(host, "eth0", &mut network).await?;
        }

        vnet.tc_netem(
            a,
            "eth0",
            TcAction::Add,
            &NetemSpec {
                delay_us: 100_000,
                jitter_us: 10_000,
                ..Default::default()
            },
        )
        .await?;

        let out = output(&vnet, a, &["ping", "-c", "3", "-W", "5", "192.168.7.2"]).await?;
        let times: Vec<f64> = out
            .lines()
            .filter_map(|line| line.split("time=").nth(1))
            .filter_map(|rest| rest.split_whitespace().next())
            .filter_map(|t| t.parse().ok())
            .collect();
        ensure!(times.len() == 3, "expected 3 RTT samples, got {:?}", times);
        let mean = times.iter().sum::<f64>() / times.len() as f64;
        ensure!(mean > 60.0, "netem delay not applied, mean RTT {}ms", mean);
        ensure!(mean < 400.0, "RTT {}ms way above the configured delay", mean);

        vnet.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn address_exhaustion_cleans_up() -> Result<()> {
        init_logging();

        let mut network = Network::new("192.168.9.0/30", None)?;
        let mut vnet = Manager::new().await?;
        let switch = vnet.switch("xsw").await?;

        for i in 0..2 {
            let host = vnet.host(&format!("xhost{}", i)).await?;
            vnet.connect(host, switch, "eth0").await?;
            vnet.add_ip(host, "eth0", &mut network).await?;
        }
        let third = vnet.host("xhost2").await?;
        vnet.connect(third, switch, "eth0").await?;
        let result = vnet.add_ip(third, "eth0", &mut network).await;
        ensure!(matches!(
            result,
            Err(TopologyError::Address(AddressError::Exhausted(_)))
        ));

        vnet.shutdown().await;
        for i in 0..3 {
            ensure!(!Path::new(&format!("/var/run/netns/xhost{}", i)).exists());
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manual_stop_then_scope_exit() -> Result<()> {
        init_logging();

        let mut vnet = Manager::new().await?;
        let first = vnet.host("stop0").await?;
        let second = vnet.host("stop1").await?;

        vnet.stop_node(first).await?;
        ensure!(!vnet.is_running(first));
        ensure!(!Path::new("/var/run/netns/stop0").exists());

        // Stopping again is refused.
        ensure!(matches!(
            vnet.stop_node(first).await,
            Err(TopologyError::EntityDown(_))
        ));

        // Scope exit stops the remaining host exactly once and skips the
        // stopped one.
        vnet.shutdown().await;
        ensure!(!vnet.is_running(second));
        ensure!(!Path::new("/var/run/netns/stop1").exists());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn link_direction_tags() -> Result<()> {
        init_logging();

        let mut vnet = Manager::new().await?;
        let a = vnet.host("dir0").await?;
        let b = vnet.host("dir1").await?;
        let link = vnet
            .connect_with(
                a,
                b,
                "eth0",
                ConnectOptions {
                    remote_name: None,
                    direction: RouteDirection::Inward,
                },
            )
            .await?;

        let ((main_node, main_iface), (peer_node, peer_iface)) = vnet.link_endpoints(link);
        ensure!(main_node == a && main_iface == "eth0");
        ensure!(peer_node == b && peer_iface == "dir00");
        ensure!(vnet.partner(a, "eth0") == Some((b, "dir00".to_string())));
        ensure!(
            vnet.interface_direction(a, "eth0") == Some(RouteDirection::Inward)
        );
        ensure!(
            vnet.interface_direction(b, "dir00") == Some(RouteDirection::Outward)
        );

        vnet.stop_link(link).await?;
        ensure!(!vnet.link_running(link));
        ensure!(vnet.interface_names(a).is_empty());

        vnet.shutdown().await;
        Ok(())
    }
}
