use crate::daemons::{Bird, Daemon, ExaBgp, Supervisor};
use crate::devices::{
    derive_peer_name, parse_mac, validate_name, AddressFamily, Interface, Node, Route, RouteVia,
    Router, RouterKind, Switch,
};
use crate::error::Error;
use crate::executor::{CleanupAction, Executor};
use crate::{Index, Result};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::PathBuf;

/// Lifecycle of a topology. Single-use: no path re-enters `Built`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Built,
    Running,
    Destroyed,
}

impl State {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Built => "BUILT",
            Self::Running => "RUNNING",
            Self::Destroyed => "DESTROYED",
        }
    }
}

/// Typed input records, the contract with the configuration front end.
#[derive(Debug)]
pub enum Record {
    AddRouter {
        name: String,
        kind: RouterKind,
        config: Option<PathBuf>,
    },
    AddInterface {
        router: String,
        iface: String,
        mac: Option<String>,
        switch: Option<String>,
    },
    AddAddress {
        router: String,
        iface: String,
        address: String,
        prefix_len: u8,
        family: AddressFamily,
    },
    AddRoute {
        router: String,
        destination: String,
        via: String,
    },
}

/// The node registry and scheduler. Builds a declarative model, then on
/// `run()` drives it into the kernel in dependency order; `destroy()` (or
/// any bringup failure) unwinds through the executor's cleanup stack.
pub struct Topology {
    nodes: BTreeMap<String, Node>,
    state: State,
    executor: Option<Executor>,
}

impl Topology {
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            state: State::Built,
            executor: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn get_node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    fn ensure_built(&self, operation: &str) -> Result<()> {
        if self.state != State::Built {
            return Err(Error::InvalidState(format!(
                "{operation} requires BUILT, topology is {}",
                self.state.as_str()
            )));
        }
        Ok(())
    }

    pub fn add_node(&mut self, node: Node) -> Result<()> {
        self.ensure_built("add_node")?;
        validate_name("node", node.name()).map_err(|msg| Error::InvariantViolation(vec![msg]))?;
        if self.nodes.contains_key(node.name()) {
            return Err(Error::NameCollision(format!(
                "node {} is already registered",
                node.name()
            )));
        }
        self.nodes.insert(node.name().to_string(), node);
        Ok(())
    }

    pub fn add_switch(&mut self, name: &str) -> Result<()> {
        self.add_node(Node::Switch(Switch::new(name)))
    }

    pub fn add_router(
        &mut self,
        name: &str,
        kind: RouterKind,
        config: Option<PathBuf>,
    ) -> Result<()> {
        let mut router = Router::new(name);
        router.daemon = match kind {
            RouterKind::Plain => None,
            RouterKind::Bird => Some(Supervisor::new(
                name,
                Daemon::Bird(Bird::default()),
                require_config(name, "bird", config)?,
            )),
            RouterKind::ExaBgp => Some(Supervisor::new(
                name,
                Daemon::ExaBgp(ExaBgp::default()),
                require_config(name, "exabgp", config)?,
            )),
        };
        self.add_node(Node::Router(router))
    }

    /// Adds an interface to a router. A referenced switch that is not yet
    /// registered is registered on the spot (the record stream has no
    /// dedicated switch record). The host-side peer name is derived here,
    /// against every peer minted so far.
    pub fn add_interface(
        &mut self,
        router: &str,
        iface: &str,
        mac: Option<&str>,
        switch: Option<&str>,
    ) -> Result<()> {
        self.ensure_built("add_interface")?;
        validate_name("interface", iface).map_err(|msg| Error::InvariantViolation(vec![msg]))?;
        let mac = match mac {
            Some(mac) => {
                Some(parse_mac(mac).map_err(|msg| Error::InvariantViolation(vec![msg]))?)
            }
            None => None,
        };

        match self.nodes.get(router) {
            None => return Err(Error::NotFound(format!("router {router}"))),
            Some(node) => {
                let existing = node
                    .as_router()
                    .ok_or_else(|| Error::Unsupported(format!("node {router} is not a router")))?;
                if existing.interfaces.iter().any(|i| i.name == iface) {
                    return Err(Error::NameCollision(format!(
                        "interface {iface} already exists on {router}"
                    )));
                }
            }
        }

        if let Some(switch_name) = switch {
            if !self.nodes.contains_key(switch_name) {
                self.add_switch(switch_name)?;
            }
            let switch_node = self
                .nodes
                .get_mut(switch_name)
                .and_then(|node| node.as_switch_mut())
                .ok_or_else(|| {
                    Error::Unsupported(format!("node {switch_name} is not a switch"))
                })?;
            switch_node
                .members
                .insert((router.to_string(), iface.to_string()));
        }

        let taken: BTreeSet<String> = self
            .nodes
            .values()
            .filter_map(|node| node.as_router())
            .flat_map(|r| r.interfaces.iter().map(|i| i.peer_name.clone()))
            .collect();
        let peer_name = derive_peer_name(router, iface, &taken);

        let router_node = self
            .nodes
            .get_mut(router)
            .and_then(|node| node.as_router_mut())
            .ok_or_else(|| Error::NotFound(format!("router {router}")))?;
        router_node.interfaces.push(Interface {
            name: iface.to_string(),
            peer_name,
            mac,
            addresses: Vec::new(),
            switch: switch.map(str::to_string),
        });
        Ok(())
    }

    /// Adds an address to an interface. Parsing happens here: an ill-formed
    /// address never makes it into the model.
    pub fn add_address(
        &mut self,
        router: &str,
        iface: &str,
        address: &str,
        prefix_len: u8,
        family: AddressFamily,
    ) -> Result<()> {
        self.ensure_built("add_address")?;
        let parsed: IpAddr = address.parse().map_err(|_| {
            Error::InvariantViolation(vec![format!(
                "address '{address}' on {router}:{iface} is not a valid IP address"
            )])
        })?;
        let network = match (family, parsed) {
            (AddressFamily::V4, IpAddr::V4(addr)) => {
                IpNetwork::V4(Ipv4Network::new(addr, prefix_len).map_err(|_| {
                    Error::InvariantViolation(vec![format!(
                        "prefix length {prefix_len} is invalid for v4 address '{address}'"
                    )])
                })?)
            }
            (AddressFamily::V6, IpAddr::V6(addr)) => {
                IpNetwork::V6(Ipv6Network::new(addr, prefix_len).map_err(|_| {
                    Error::InvariantViolation(vec![format!(
                        "prefix length {prefix_len} is invalid for v6 address '{address}'"
                    )])
                })?)
            }
            _ => {
                return Err(Error::InvariantViolation(vec![format!(
                    "address '{address}' on {router}:{iface} does not match its declared family"
                )]));
            }
        };

        let router_node = self
            .nodes
            .get_mut(router)
            .and_then(|node| node.as_router_mut())
            .ok_or_else(|| Error::NotFound(format!("router {router}")))?;
        let iface_entry = router_node
            .interfaces
            .iter_mut()
            .find(|i| i.name == iface)
            .ok_or_else(|| Error::NotFound(format!("interface {iface} on {router}")))?;
        iface_entry.addresses.push(network);
        Ok(())
    }

    /// Adds a static route. `via` is a gateway address when it parses as
    /// one, otherwise a device name on the router.
    pub fn add_route(&mut self, router: &str, destination: &str, via: &str) -> Result<()> {
        self.ensure_built("add_route")?;
        let destination: IpNetwork = destination.parse().map_err(|_| {
            Error::InvariantViolation(vec![format!(
                "route destination '{destination}' on {router} is not a valid prefix"
            )])
        })?;
        let via = match via.parse::<IpAddr>() {
            Ok(gateway) => {
                if destination.is_ipv4() != gateway.is_ipv4() {
                    return Err(Error::InvariantViolation(vec![format!(
                        "gateway '{gateway}' does not match the family of '{destination}'"
                    )]));
                }
                RouteVia::Gateway(gateway)
            }
            Err(_) => RouteVia::Device(via.to_string()),
        };

        let router_node = self
            .nodes
            .get_mut(router)
            .and_then(|node| node.as_router_mut())
            .ok_or_else(|| Error::NotFound(format!("router {router}")))?;
        router_node.routes.push(Route { destination, via });
        Ok(())
    }

    pub fn apply(&mut self, record: Record) -> Result<()> {
        match record {
            Record::AddRouter { name, kind, config } => self.add_router(&name, kind, config),
            Record::AddInterface {
                router,
                iface,
                mac,
                switch,
            } => self.add_interface(&router, &iface, mac.as_deref(), switch.as_deref()),
            Record::AddAddress {
                router,
                iface,
                address,
                prefix_len,
                family,
            } => self.add_address(&router, &iface, &address, prefix_len, family),
            Record::AddRoute {
                router,
                destination,
                via,
            } => self.add_route(&router, &destination, &via),
        }
    }

    /// One-pass global validation. Collects every violation so a single
    /// fix cycle suffices; runs before any kernel call.
    pub(crate) fn validate(&self) -> Result<()> {
        let mut violations = Vec::new();

        // bridges and veth peers coexist in the root namespace; their names
        // must be pairwise distinct
        let mut root_links: BTreeMap<String, String> = BTreeMap::new();
        for node in self.nodes.values() {
            if let Node::Switch(switch) = node {
                root_links.insert(switch.name.clone(), format!("bridge of {}", switch.name));
            }
        }
        for node in self.nodes.values() {
            let Node::Router(router) = node else { continue };
            for iface in &router.interfaces {
                let owner = format!("peer of {}:{}", router.name, iface.name);
                if let Some(previous) = root_links.insert(iface.peer_name.clone(), owner) {
                    violations.push(format!(
                        "peer name {} of {}:{} collides with {previous}",
                        iface.peer_name, router.name, iface.name
                    ));
                }
            }
        }
        // an interface transits the root namespace under its own name
        // before moving into its router
        for node in self.nodes.values() {
            let Node::Router(router) = node else { continue };
            for iface in &router.interfaces {
                if let Some(owner) = root_links.get(&iface.name) {
                    violations.push(format!(
                        "interface {} of {} would collide with {owner} during bringup",
                        iface.name, router.name
                    ));
                }
            }
        }

        for node in self.nodes.values() {
            match node {
                Node::Switch(switch) => {
                    for (router, iface) in &switch.members {
                        let present = self
                            .nodes
                            .get(router)
                            .and_then(|n| n.as_router())
                            .is_some_and(|r| r.interfaces.iter().any(|i| &i.name == iface));
                        if !present {
                            violations.push(format!(
                                "switch {} lists member {router}:{iface} which does not exist",
                                switch.name
                            ));
                        }
                    }
                }
                Node::Router(router) => {
                    for iface in &router.interfaces {
                        if let Some(switch) = &iface.switch {
                            if self
                                .nodes
                                .get(switch)
                                .and_then(|n| n.as_switch())
                                .is_none()
                            {
                                violations.push(format!(
                                    "interface {}:{} references unknown switch {switch}",
                                    router.name, iface.name
                                ));
                            }
                        }
                    }
                    for route in &router.routes {
                        if let RouteVia::Device(device) = &route.via {
                            if !router.interfaces.iter().any(|i| &i.name == device) {
                                violations.push(format!(
                                    "route to {} on {} references missing device {device}",
                                    route.destination, router.name
                                ));
                            }
                        }
                    }
                    if let Some(supervisor) = &router.daemon {
                        if !supervisor.config_path().exists() {
                            violations.push(format!(
                                "config file {} for {} does not exist",
                                supervisor.config_path().display(),
                                router.name
                            ));
                        }
                    }
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::InvariantViolation(violations))
        }
    }

    /// Read-only probe of every mint name against the live host, before the
    /// first mutation.
    async fn probe_collisions(&self, executor: &Executor) -> Result<()> {
        for node in self.nodes.values() {
            match node {
                Node::Switch(switch) => {
                    if executor.find_link(&switch.name).await?.is_some() {
                        return Err(Error::NameCollision(format!(
                            "bridge {} already exists on this host",
                            switch.name
                        )));
                    }
                }
                Node::Router(router) => {
                    if Executor::netns_exists(&router.name) {
                        return Err(Error::NameCollision(format!(
                            "netns {} already exists on this host",
                            router.name
                        )));
                    }
                    for iface in &router.interfaces {
                        if executor.find_link(&iface.peer_name).await?.is_some() {
                            return Err(Error::NameCollision(format!(
                                "veth peer {} already exists on this host",
                                iface.peer_name
                            )));
                        }
                        if executor.find_link(&iface.name).await?.is_some() {
                            return Err(Error::NameCollision(format!(
                                "interface {} of {} already exists in the root namespace",
                                iface.name, router.name
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn bring_up(&mut self, executor: &mut Executor) -> Result<()> {
        self.probe_collisions(executor).await?;

        tracing::info!("bringing up switches");
        let mut bridges: BTreeMap<String, Index> = BTreeMap::new();
        for node in self.nodes.values_mut() {
            if let Node::Switch(switch) = node {
                switch.create(executor).await?;
                if let Some(index) = switch.bridge_index {
                    bridges.insert(switch.name.clone(), index);
                }
            }
        }

        tracing::info!("bringing up routers");
        for node in self.nodes.values_mut() {
            let Node::Router(router) = node else { continue };
            router.create(executor).await?;
            for iface in &router.interfaces {
                let bridge = match &iface.switch {
                    Some(switch) => Some(
                        *bridges
                            .get(switch)
                            .ok_or_else(|| Error::NotFound(format!("switch {switch}")))?,
                    ),
                    None => None,
                };
                router.bring_up_interface(iface, bridge, executor).await?;
            }
            router.install_routes().await?;

            let name = router.name.clone();
            let ns_path = router.netns_path();
            if let Some(supervisor) = router.daemon.as_mut() {
                supervisor.materialise()?;
                executor.register(CleanupAction::RemoveRunDir {
                    path: supervisor.run_dir(),
                });
                let pid = supervisor.launch(&ns_path)?;
                executor.register(CleanupAction::StopDaemon { node: name, pid });
                supervisor.wait_ready().await?;
            }
        }
        Ok(())
    }

    /// Transitions BUILT to RUNNING. Atomic from the caller's view: either
    /// every node is fully up, or the cleanup stack has been drained, no
    /// minted kernel object remains, and the topology is DESTROYED.
    pub async fn run(&mut self) -> Result<()> {
        if self.state != State::Built {
            return Err(Error::InvalidState(format!(
                "run() requires BUILT, topology is {}",
                self.state.as_str()
            )));
        }
        if let Err(err) = self.validate() {
            self.state = State::Destroyed;
            return Err(err);
        }
        let mut executor = match Executor::new() {
            Ok(executor) => executor,
            Err(err) => {
                self.state = State::Destroyed;
                return Err(err);
            }
        };
        match self.bring_up(&mut executor).await {
            Ok(()) => {
                self.executor = Some(executor);
                self.state = State::Running;
                tracing::info!("topology running");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(%err, "bringup failed, unwinding");
                executor.drain().await;
                self.state = State::Destroyed;
                Err(err)
            }
        }
    }

    /// Drains the cleanup stack: daemons stop before their run dirs go,
    /// veths before their netns, netns before bridges. Idempotent; callable
    /// from any state.
    pub async fn destroy(&mut self) -> Result<()> {
        if self.state == State::Destroyed {
            return Ok(());
        }
        tracing::info!("destroying topology");
        if let Some(mut executor) = self.executor.take() {
            executor.drain().await;
        }
        self.state = State::Destroyed;
        Ok(())
    }

    /// Proxies an opaque request to the named node's control channel.
    pub fn query(&self, node: &str, request: &[u8]) -> Result<Vec<u8>> {
        let Some(found) = self.nodes.get(node) else {
            return Err(Error::NotFound(format!("node {node}")));
        };
        let Some(router) = found.as_router() else {
            return Err(Error::Unsupported(format!(
                "node {node} has no control surface"
            )));
        };
        let Some(supervisor) = router.daemon.as_ref() else {
            return Err(Error::Unsupported(format!("router {node} runs no daemon")));
        };
        supervisor.query(request)
    }
}

fn require_config(name: &str, kind: &str, config: Option<PathBuf>) -> Result<PathBuf> {
    config.ok_or_else(|| {
        Error::InvariantViolation(vec![format!("{kind} router {name} requires a config file")])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_router(topology: &mut Topology, name: &str) {
        topology
            .add_router(name, RouterKind::Plain, None)
            .unwrap();
    }

    #[test]
    fn rejects_duplicate_node_names() {
        let mut topology = Topology::new();
        plain_router(&mut topology, "r1");
        let err = topology.add_router("r1", RouterKind::Plain, None).unwrap_err();
        assert!(matches!(err, Error::NameCollision(_)));
    }

    #[test]
    fn node_name_length_boundary() {
        let mut topology = Topology::new();
        topology
            .add_router("abcdefghijklmno", RouterKind::Plain, None)
            .unwrap();
        let err = topology
            .add_router("abcdefghijklmnop", RouterKind::Plain, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn daemon_router_requires_config() {
        let mut topology = Topology::new();
        let err = topology
            .add_router("r1", RouterKind::Bird, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn interface_requires_registered_router() {
        let mut topology = Topology::new();
        let err = topology
            .add_interface("r9", "eth0", None, None)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn interface_on_switch_is_unsupported() {
        let mut topology = Topology::new();
        topology.add_switch("sw0").unwrap();
        let err = topology
            .add_interface("sw0", "eth0", None, None)
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn switch_is_registered_on_first_reference() {
        let mut topology = Topology::new();
        plain_router(&mut topology, "r1");
        topology
            .add_interface("r1", "eth0", None, Some("sw0"))
            .unwrap();
        assert!(topology.get_node("sw0").and_then(|n| n.as_switch()).is_some());
    }

    #[test]
    fn peer_names_are_unique_across_routers() {
        let mut topology = Topology::new();
        plain_router(&mut topology, "r1");
        plain_router(&mut topology, "r2");
        topology.add_interface("r1", "eth0", None, None).unwrap();
        topology.add_interface("r2", "eth0", None, None).unwrap();
        let peer1 = &topology.get_node("r1").unwrap().as_router().unwrap().interfaces[0].peer_name;
        let peer2 = &topology.get_node("r2").unwrap().as_router().unwrap().interfaces[0].peer_name;
        assert_eq!(peer1, "r1-eth0");
        assert_eq!(peer2, "r2-eth0");
    }

    #[test]
    fn ill_formed_address_fails_before_any_kernel_call() {
        let mut topology = Topology::new();
        plain_router(&mut topology, "r1");
        topology.add_interface("r1", "eth0", None, None).unwrap();
        let err = topology
            .apply(Record::AddAddress {
                router: String::from("r1"),
                iface: String::from("eth0"),
                address: String::from("10.0.0.300"),
                prefix_len: 24,
                family: AddressFamily::V4,
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn address_family_must_match() {
        let mut topology = Topology::new();
        plain_router(&mut topology, "r1");
        topology.add_interface("r1", "eth0", None, None).unwrap();
        let err = topology
            .add_address("r1", "eth0", "2001:db8::1", 64, AddressFamily::V4)
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));

        topology
            .add_address("r1", "eth0", "2001:db8::1", 64, AddressFamily::V6)
            .unwrap();
        topology
            .add_address("r1", "eth0", "10.0.0.1", 24, AddressFamily::V4)
            .unwrap();
    }

    #[test]
    fn accepted_addresses_round_trip() {
        let mut topology = Topology::new();
        plain_router(&mut topology, "r1");
        topology.add_interface("r1", "eth0", None, None).unwrap();
        topology
            .add_address("r1", "eth0", "10.0.0.1", 24, AddressFamily::V4)
            .unwrap();
        let stored =
            topology.get_node("r1").unwrap().as_router().unwrap().interfaces[0].addresses[0];
        assert_eq!(stored.to_string(), "10.0.0.1/24");
    }

    #[test]
    fn route_gateway_family_must_match_destination() {
        let mut topology = Topology::new();
        plain_router(&mut topology, "r1");
        let err = topology
            .add_route("r1", "10.1.0.0/24", "2001:db8::1")
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn validation_batches_all_offenders() {
        let mut topology = Topology::new();
        plain_router(&mut topology, "r1");
        // device route with no matching interface
        topology.add_route("r1", "10.1.0.0/24", "eth7").unwrap();
        // interface whose root-namespace transit name shadows a bridge
        topology.add_switch("sw0").unwrap();
        topology.add_interface("r1", "sw0", None, None).unwrap();

        let err = topology.validate().unwrap_err();
        let Error::InvariantViolation(violations) = err else {
            panic!("expected InvariantViolation");
        };
        assert_eq!(violations.len(), 2);
        assert!(violations.iter().any(|v| v.contains("eth7")));
        assert!(violations.iter().any(|v| v.contains("sw0")));
    }

    #[test]
    fn zero_interface_router_validates() {
        let mut topology = Topology::new();
        plain_router(&mut topology, "r1");
        topology.validate().unwrap();
    }

    #[tokio::test]
    async fn run_is_rejected_after_validation_failure() {
        let mut topology = Topology::new();
        plain_router(&mut topology, "r1");
        topology.add_route("r1", "10.1.0.0/24", "eth7").unwrap();

        let err = topology.run().await.unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
        assert_eq!(topology.state(), State::Destroyed);

        let err = topology.run().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let mut topology = Topology::new();
        plain_router(&mut topology, "r1");
        topology.destroy().await.unwrap();
        assert_eq!(topology.state(), State::Destroyed);
        topology.destroy().await.unwrap();

        let err = topology.run().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        let err = topology
            .add_router("r2", RouterKind::Plain, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn query_routes_by_node_and_capability() {
        let mut topology = Topology::new();
        plain_router(&mut topology, "r1");
        topology.add_switch("sw0").unwrap();

        let err = topology.query("r9", b"show route").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        let err = topology.query("sw0", b"show route").unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        let err = topology.query("r1", b"show route").unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }
}
