use crate::daemons::Supervisor;
use crate::error::Error;
use crate::executor::Executor;
use crate::{Index, Result, NAME_MAX};

use enum_as_inner::EnumAsInner;
use ipnetwork::IpNetwork;
use nix::net::if_::if_nametoindex;
use nix::sched::{setns, CloneFlags};
use nix::unistd::gettid;
use rtnetlink::{new_connection, LinkUnspec, RouteMessageBuilder, NETNS_PATH};
use std::collections::BTreeSet;
use std::fs::File;
use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::IpAddr;
use std::os::fd::AsFd;

/// Address family selector for the typed-record input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

/// Checks a node or interface name against the kernel's constraints:
/// 1-15 bytes of `[A-Za-z0-9_-]`.
pub(crate) fn validate_name(kind: &str, name: &str) -> std::result::Result<(), String> {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(format!(
            "{kind} name '{name}' must be 1-{NAME_MAX} bytes, got {}",
            name.len()
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(format!(
            "{kind} name '{name}' contains characters outside [A-Za-z0-9_-]"
        ));
    }
    Ok(())
}

pub(crate) fn parse_mac(mac: &str) -> std::result::Result<[u8; 6], String> {
    let mut out = [0u8; 6];
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return Err(format!(
            "mac address '{mac}' must have 6 colon-separated octets"
        ));
    }
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = u8::from_str_radix(part, 16)
            .map_err(|_| format!("mac address '{mac}' has invalid octet '{part}'"))?;
    }
    Ok(out)
}

/// Derives the host-side veth peer name for an interface. `<router>-<iface>`
/// when it fits and is free; otherwise a 9-byte prefix plus a 5-hex-digit
/// hash of the full name, re-salted until it clears `taken`. Deterministic
/// for a fixed insertion sequence.
pub(crate) fn derive_peer_name(router: &str, iface: &str, taken: &BTreeSet<String>) -> String {
    let full = format!("{router}-{iface}");
    if full.len() <= NAME_MAX && !taken.contains(&full) {
        return full;
    }
    let prefix: String = full.chars().take(NAME_MAX - 6).collect();
    let mut salt = 0u64;
    loop {
        let mut hasher = DefaultHasher::new();
        full.hash(&mut hasher);
        salt.hash(&mut hasher);
        let candidate = format!("{prefix}-{:05x}", hasher.finish() & 0xf_ffff);
        if !taken.contains(&candidate) {
            return candidate;
        }
        salt += 1;
    }
}

// ==== Interface ====

/// One router-owned end of a veth pair, plus the intent needed to wire it:
/// optional MAC, addresses in insertion order, optional switch membership
/// (held by name so the model stays cycle-free).
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub peer_name: String,
    pub mac: Option<[u8; 6]>,
    pub addresses: Vec<IpNetwork>,
    pub switch: Option<String>,
}

// ==== Route ====

#[derive(Debug, Clone)]
pub enum RouteVia {
    Gateway(IpAddr),
    Device(String),
}

/// A static route installed after the owning router's interfaces are up and
/// addressed. An unreachable next-hop is still handed to the kernel; its
/// refusal surfaces as `ExternalFailure`.
#[derive(Debug, Clone)]
pub struct Route {
    pub destination: IpNetwork,
    pub via: RouteVia,
}

// ==== Router ====

/// What kind of control plane a router carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterKind {
    Plain,
    Bird,
    ExaBgp,
}

impl std::str::FromStr for RouterKind {
    type Err = Error;

    fn from_str(kind: &str) -> Result<Self> {
        match kind {
            "plain" => Ok(Self::Plain),
            "bird" => Ok(Self::Bird),
            "exabgp" => Ok(Self::ExaBgp),
            other => Err(Error::Unsupported(format!(
                "router kind '{other}' (expected plain, bird or exabgp)"
            ))),
        }
    }
}

/// A router owns one named network namespace, an ordered set of interfaces,
/// static routes, and optionally a supervised routing daemon.
#[derive(Debug)]
pub struct Router {
    pub name: String,
    pub interfaces: Vec<Interface>,
    pub routes: Vec<Route>,
    pub daemon: Option<Supervisor>,
}

impl Router {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            interfaces: Vec::new(),
            routes: Vec::new(),
            daemon: None,
        }
    }

    /// Path of the router's netns; the netns name is the node name (both
    /// are capped at 15 bytes at insertion).
    pub(crate) fn netns_path(&self) -> String {
        format!("{}{}", NETNS_PATH, self.name)
    }

    /// Runs `f` with the current thread joined to the router's namespace,
    /// restoring the original namespace afterwards. Relies on the topology's
    /// current-thread scheduling: the future must not migrate threads while
    /// the window is open.
    pub async fn run<F, T, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Future<Output = R> + Send,
    {
        let current_thread_path = format!("/proc/self/task/{}/ns/net", gettid());
        let current_thread_file = File::open(&current_thread_path)
            .map_err(|err| Error::external("open current netns", err))?;
        let ns_file = File::open(self.netns_path())
            .map_err(|err| Error::from_io(format!("open netns of {}", self.name), err))?;

        setns(ns_file.as_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|errno| Error::from_errno(format!("enter netns of {}", self.name), errno))?;
        let result = f().await;
        setns(current_thread_file.as_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|errno| Error::from_errno("return to root netns", errno))?;
        Ok(result)
    }

    /// Creates the namespace and brings its loopback up.
    pub(crate) async fn create(&self, executor: &mut Executor) -> Result<()> {
        executor.create_netns(&self.name).await?;
        let name = self.name.clone();
        self.run(move || async move {
            let (connection, handle, _) = new_connection()
                .map_err(|err| Error::external(format!("open rtnetlink socket in {name}"), err))?;
            tokio::spawn(connection);
            handle
                .link()
                .set(LinkUnspec::new_with_name("lo").up().build())
                .execute()
                .await
                .map_err(|err| Error::from_rtnetlink(format!("set lo up in {name}"), err))
        })
        .await?
    }

    /// Brings one interface up end to end: veth pair in the root namespace,
    /// inner half moved into the router, peer attached to its bridge (when
    /// assigned) and set up, then inside the namespace: link up, MAC,
    /// addresses. The bridge must already exist and be up.
    pub(crate) async fn bring_up_interface(
        &self,
        iface: &Interface,
        bridge: Option<Index>,
        executor: &mut Executor,
    ) -> Result<()> {
        executor.create_veth(&iface.name, &iface.peer_name).await?;
        executor.move_into_netns(&iface.name, &self.name).await?;
        if let Some(bridge_index) = bridge {
            executor
                .attach_to_bridge(&iface.peer_name, bridge_index)
                .await?;
        }
        executor.set_link_up(&iface.peer_name).await?;

        let router = self.name.clone();
        let name = iface.name.clone();
        let mac = iface.mac;
        let addresses = iface.addresses.clone();
        self.run(move || async move {
            let (connection, handle, _) = new_connection()
                .map_err(|err| Error::external(format!("open rtnetlink socket in {router}"), err))?;
            tokio::spawn(connection);
            let index = if_nametoindex(name.as_str())
                .map_err(|errno| Error::from_errno(format!("{name} in {router}"), errno))?;
            handle
                .link()
                .set(LinkUnspec::new_with_index(index).up().build())
                .execute()
                .await
                .map_err(|err| Error::from_rtnetlink(format!("set {name} up in {router}"), err))?;
            if let Some(mac) = mac {
                handle
                    .link()
                    .set(
                        LinkUnspec::new_with_index(index)
                            .address(mac.to_vec())
                            .build(),
                    )
                    .execute()
                    .await
                    .map_err(|err| {
                        Error::from_rtnetlink(format!("set mac on {name} in {router}"), err)
                    })?;
            }
            for address in addresses {
                handle
                    .address()
                    .add(index, address.ip(), address.prefix())
                    .execute()
                    .await
                    .map_err(|err| {
                        Error::from_rtnetlink(
                            format!("add address {address} to {name} in {router}"),
                            err,
                        )
                    })?;
            }
            Ok(())
        })
        .await?
    }

    /// Installs the router's static routes, in insertion order, inside its
    /// namespace. Interfaces must already be up and addressed.
    pub(crate) async fn install_routes(&self) -> Result<()> {
        if self.routes.is_empty() {
            return Ok(());
        }
        let router = self.name.clone();
        let routes = self.routes.clone();
        self.run(move || async move {
            let (connection, handle, _) = new_connection()
                .map_err(|err| Error::external(format!("open rtnetlink socket in {router}"), err))?;
            tokio::spawn(connection);
            for route in routes {
                let what = format!("add route to {} in {router}", route.destination);
                let message = match route.destination {
                    IpNetwork::V4(dest) => {
                        let mut builder = RouteMessageBuilder::<std::net::Ipv4Addr>::new()
                            .destination_prefix(dest.network(), dest.prefix());
                        match &route.via {
                            RouteVia::Gateway(IpAddr::V4(gateway)) => {
                                builder = builder.gateway(*gateway);
                            }
                            RouteVia::Gateway(IpAddr::V6(_)) => {
                                return Err(Error::InvariantViolation(vec![format!(
                                    "route to {dest} in {router} has a v6 gateway"
                                )]));
                            }
                            RouteVia::Device(device) => {
                                let index = if_nametoindex(device.as_str()).map_err(|errno| {
                                    Error::from_errno(format!("{device} in {router}"), errno)
                                })?;
                                builder = builder.output_interface(index);
                            }
                        }
                        builder.build()
                    }
                    IpNetwork::V6(dest) => {
                        let mut builder = RouteMessageBuilder::<std::net::Ipv6Addr>::new()
                            .destination_prefix(dest.network(), dest.prefix());
                        match &route.via {
                            RouteVia::Gateway(IpAddr::V6(gateway)) => {
                                builder = builder.gateway(*gateway);
                            }
                            RouteVia::Gateway(IpAddr::V4(_)) => {
                                return Err(Error::InvariantViolation(vec![format!(
                                    "route to {dest} in {router} has a v4 gateway"
                                )]));
                            }
                            RouteVia::Device(device) => {
                                let index = if_nametoindex(device.as_str()).map_err(|errno| {
                                    Error::from_errno(format!("{device} in {router}"), errno)
                                })?;
                                builder = builder.output_interface(index);
                            }
                        }
                        builder.build()
                    }
                };
                handle
                    .route()
                    .add(message)
                    .execute()
                    .await
                    .map_err(|err| Error::from_rtnetlink(what, err))?;
            }
            Ok(())
        })
        .await?
    }
}

// ==== Switch ====

/// A switch owns one Linux bridge named after the node. It records intended
/// memberships for validation; the actual attaching happens during each
/// member interface's bringup.
#[derive(Debug)]
pub struct Switch {
    pub name: String,
    pub(crate) bridge_index: Option<Index>,
    pub(crate) members: BTreeSet<(String, String)>,
}

impl Switch {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            bridge_index: None,
            members: BTreeSet::new(),
        }
    }

    /// Creates the bridge and confirms it is up before any member attaches.
    pub(crate) async fn create(&mut self, executor: &mut Executor) -> Result<()> {
        let index = executor.create_bridge(&self.name).await?;
        self.bridge_index = Some(index);
        Ok(())
    }
}

// ==== Node ====

#[derive(Debug, EnumAsInner)]
pub enum Node {
    Router(Router),
    Switch(Switch),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Self::Router(router) => &router.name,
            Self::Switch(switch) => &switch.name,
        }
    }
}

/// Runs `f` with the current thread joined to the namespace at `ns_path`,
/// restoring the original namespace afterwards. Synchronous variant used
/// for process spawns: a child forked inside the window inherits the
/// namespace for its lifetime.
pub(crate) fn in_namespace<F, T>(ns_path: &str, f: F) -> Result<T>
where
    F: FnOnce() -> T,
{
    let current_thread_path = format!("/proc/self/task/{}/ns/net", gettid());
    let current_thread_file = File::open(&current_thread_path)
        .map_err(|err| Error::external("open current netns", err))?;
    let ns_file =
        File::open(ns_path).map_err(|err| Error::from_io(format!("open netns {ns_path}"), err))?;

    setns(ns_file.as_fd(), CloneFlags::CLONE_NEWNET)
        .map_err(|errno| Error::from_errno(format!("enter netns {ns_path}"), errno))?;
    let result = f();
    setns(current_thread_file.as_fd(), CloneFlags::CLONE_NEWNET)
        .map_err(|errno| Error::from_errno("return to root netns", errno))?;
    Ok(result)
}
