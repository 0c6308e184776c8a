use crate::error::Error;
use crate::{Index, Result};

use futures_util::TryStreamExt;
use netlink_packet_route::link::{LinkFlags, LinkMessage};
use rtnetlink::{new_connection, Handle, LinkBridge, LinkUnspec, LinkVeth, NetworkNamespace, NETNS_PATH};
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

/// Compensating action for one successful kernel mutation. Each record is a
/// small closed value so a drained stack can be reconstructed from logs.
#[derive(Debug)]
pub(crate) enum CleanupAction {
    DeleteNetns { name: String },
    DeleteLink { name: String },
    StopDaemon { node: String, pid: i32 },
    RemoveRunDir { path: PathBuf },
}

impl CleanupAction {
    /// Best-effort undo. Failures are logged and swallowed so one stuck
    /// resource cannot block the rest of the stack; a missing target counts
    /// as success.
    async fn undo(self, handle: &Handle) {
        match self {
            Self::DeleteNetns { name } => {
                tracing::debug!(%name, "deleting netns");
                if let Err(err) = NetworkNamespace::del(name.clone()).await {
                    match Error::from_rtnetlink(format!("delete netns {name}"), err) {
                        Error::NotFound(_) => tracing::debug!(%name, "netns already gone"),
                        err => tracing::warn!(%name, %err, "failed to delete netns"),
                    }
                }
            }
            Self::DeleteLink { name } => {
                tracing::debug!(%name, "deleting link");
                match find_link(handle, &name).await {
                    Ok(Some(link)) => {
                        if let Err(err) = handle.link().del(link.header.index).execute().await {
                            tracing::warn!(%name, %err, "failed to delete link");
                        }
                    }
                    Ok(None) => tracing::debug!(%name, "link already gone"),
                    Err(err) => tracing::warn!(%name, %err, "failed to look up link"),
                }
            }
            Self::StopDaemon { node, pid } => {
                tracing::debug!(%node, pid, "stopping daemon");
                crate::daemons::terminate(&node, pid).await;
            }
            Self::RemoveRunDir { path } => {
                tracing::debug!(path = %path.display(), "removing runtime directory");
                match std::fs::remove_dir_all(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        tracing::warn!(path = %path.display(), %err, "failed to remove runtime directory");
                    }
                }
            }
        }
    }
}

/// Sole owner of side effects on the host. Every mutating primitive pushes
/// its compensation onto the stack on success; `drain` pops and undoes them
/// in LIFO order.
pub(crate) struct Executor {
    handle: Handle,
    cleanup: Vec<CleanupAction>,
}

impl Executor {
    pub(crate) fn new() -> Result<Self> {
        let (connection, handle, _) =
            new_connection().map_err(|err| Error::external("open rtnetlink socket", err))?;
        tokio::spawn(connection);
        Ok(Self {
            handle,
            cleanup: Vec::new(),
        })
    }

    pub(crate) fn register(&mut self, action: CleanupAction) {
        self.cleanup.push(action);
    }

    /// Non-mutating link lookup in the root namespace.
    pub(crate) async fn find_link(&self, name: &str) -> Result<Option<LinkMessage>> {
        find_link(&self.handle, name).await
    }

    pub(crate) fn netns_exists(name: &str) -> bool {
        Path::new(NETNS_PATH).join(name).exists()
    }

    pub(crate) async fn create_netns(&mut self, name: &str) -> Result<()> {
        tracing::debug!(%name, "creating netns");
        NetworkNamespace::add(name.to_string())
            .await
            .map_err(|err| Error::from_rtnetlink(format!("create netns {name}"), err))?;
        self.register(CleanupAction::DeleteNetns {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Creates a bridge, confirms it is administratively up, and returns its
    /// ifindex. Members may only be attached once this has returned.
    pub(crate) async fn create_bridge(&mut self, name: &str) -> Result<Index> {
        tracing::debug!(%name, "creating bridge");
        self.handle
            .link()
            .add(LinkBridge::new(name).up().build())
            .execute()
            .await
            .map_err(|err| Error::from_rtnetlink(format!("create bridge {name}"), err))?;
        self.register(CleanupAction::DeleteLink {
            name: name.to_string(),
        });

        let link = self
            .find_link(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("bridge {name} after creation")))?;
        if !link.header.flags.contains(LinkFlags::Up) {
            self.handle
                .link()
                .set(LinkUnspec::new_with_index(link.header.index).up().build())
                .execute()
                .await
                .map_err(|err| Error::from_rtnetlink(format!("set bridge {name} up"), err))?;
        }
        Ok(link.header.index)
    }

    /// Creates a veth pair in the root namespace. The compensation is keyed
    /// on the peer: it stays in the root namespace for the pair's lifetime,
    /// and deleting it removes both halves.
    pub(crate) async fn create_veth(&mut self, name: &str, peer: &str) -> Result<()> {
        tracing::debug!(%name, %peer, "creating veth pair");
        self.handle
            .link()
            .add(LinkVeth::new(name, peer).build())
            .execute()
            .await
            .map_err(|err| {
                Error::from_rtnetlink(format!("create veth pair {name}/{peer}"), err)
            })?;
        self.register(CleanupAction::DeleteLink {
            name: peer.to_string(),
        });
        Ok(())
    }

    pub(crate) async fn move_into_netns(&mut self, link: &str, netns: &str) -> Result<()> {
        tracing::debug!(%link, %netns, "moving link into netns");
        let ns_file = File::open(Path::new(NETNS_PATH).join(netns))
            .map_err(|err| Error::external(format!("open netns {netns}"), err))?;
        let index = self
            .find_link(link)
            .await?
            .ok_or_else(|| Error::NotFound(format!("link {link}")))?
            .header
            .index;
        self.handle
            .link()
            .set(
                LinkUnspec::new_with_index(index)
                    .setns_by_fd(ns_file.as_raw_fd())
                    .build(),
            )
            .execute()
            .await
            .map_err(|err| {
                Error::from_rtnetlink(format!("move link {link} into netns {netns}"), err)
            })
    }

    pub(crate) async fn attach_to_bridge(&mut self, link: &str, bridge_index: Index) -> Result<()> {
        tracing::debug!(%link, bridge_index, "attaching link to bridge");
        self.handle
            .link()
            .set(
                LinkUnspec::new_with_name(link)
                    .controller(bridge_index)
                    .build(),
            )
            .execute()
            .await
            .map_err(|err| Error::from_rtnetlink(format!("attach {link} to bridge"), err))
    }

    pub(crate) async fn set_link_up(&mut self, link: &str) -> Result<()> {
        tracing::debug!(%link, "setting link up");
        self.handle
            .link()
            .set(LinkUnspec::new_with_name(link).up().build())
            .execute()
            .await
            .map_err(|err| Error::from_rtnetlink(format!("set link {link} up"), err))
    }

    /// Pops and undoes every registered compensation. Unconditional: each
    /// entry is attempted even if earlier ones fail.
    pub(crate) async fn drain(&mut self) {
        while let Some(action) = self.cleanup.pop() {
            action.undo(&self.handle).await;
        }
    }
}

async fn find_link(handle: &Handle, name: &str) -> Result<Option<LinkMessage>> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(link) => Ok(link),
        // the kernel answers a name miss with an error, not an empty dump
        Err(rtnetlink::Error::NetlinkError(msg))
            if matches!(msg.raw_code().abs(), libc::ENODEV | libc::ENOENT) =>
        {
            Ok(None)
        }
        Err(err) => Err(Error::from_rtnetlink(format!("look up link {name}"), err)),
    }
}
