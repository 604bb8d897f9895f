//! Best-effort attribution of a connection endpoint to its owning process.
//!
//! The socket table gives the inode and owner uid of the local socket; the
//! pid is found by scanning `/proc/<pid>/fd` for a `socket:[inode]` link.
//! Processes routinely exit or close the socket before this completes, so a
//! miss is an ordinary outcome and is never reported as an error.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use conntrail_common::config::ResolverConfig;
use conntrail_common::types::{ConnectionTuple, ProcessAttribution, Protocol};
use nix::unistd::{Uid, User};
use procfs::ProcError;
use procfs::process::{FDTarget, Process};

use crate::bounded::BoundedMap;
use crate::socket_table::{SocketEntry, SocketTable};

/// Outcome of resolving one endpoint. Both fields are optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Inode of the matched socket.
    pub inode: Option<u64>,
    /// Owning process, when it could be found.
    pub attribution: Option<ProcessAttribution>,
}

impl Resolution {
    /// A resolution that found nothing.
    pub const fn unresolved() -> Self {
        Self {
            inode: None,
            attribution: None,
        }
    }

    /// Returns whether a process was attributed.
    pub const fn is_attributed(&self) -> bool {
        self.attribution.is_some()
    }
}

/// Resolves connection endpoints to processes under a proc root.
#[derive(Debug)]
pub struct ProcessResolver {
    proc_root: PathBuf,
    config: ResolverConfig,
    pid_cache: BoundedMap<u64, i32>,
    usernames: HashMap<u32, Option<String>>,
    permission_warned: bool,
}

impl ProcessResolver {
    /// Creates a resolver reading from `proc_root`.
    pub fn new(proc_root: impl Into<PathBuf>, config: ResolverConfig) -> Self {
        let pid_cache = BoundedMap::new(config.pid_cache_capacity);
        Self {
            proc_root: proc_root.into(),
            config,
            pid_cache,
            usernames: HashMap::new(),
            permission_warned: false,
        }
    }

    /// Resolves a connection, trying its source endpoint first and then its
    /// destination (the local side of an inbound connection).
    ///
    /// The socket tables are read once and shared by both lookups. A side is
    /// only matched against wildcard-bound sockets when its address belongs
    /// to this host, so a remote endpoint never lands on a local listener.
    pub fn resolve_tuple(&mut self, tuple: &ConnectionTuple) -> Resolution {
        let Some(mut table) = self.read_table(tuple.protocol) else {
            return Resolution::unresolved();
        };
        let source = SocketAddr::new(tuple.source_address, tuple.source_port);
        let destination = SocketAddr::new(tuple.destination_address, tuple.destination_port);
        let outbound = self.resolve_in(&mut table, source, Some(destination));
        if outbound.is_attributed() {
            return outbound;
        }
        let inbound = self.resolve_in(&mut table, destination, Some(source));
        if inbound.is_attributed() || outbound.inode.is_none() {
            inbound
        } else {
            outbound
        }
    }

    /// Resolves the socket bound to `local`, an address of this host, for
    /// `protocol`.
    pub fn resolve(&mut self, protocol: Protocol, local: SocketAddr) -> Resolution {
        match self.read_table(protocol) {
            Some(mut table) => self.resolve_in(&mut table, local, None),
            None => Resolution::unresolved(),
        }
    }

    fn resolve_in(&mut self, table: &mut SocketTable, local: SocketAddr, peer: Option<SocketAddr>) -> Resolution {
        let protocol = table.protocol();
        let Some(socket) = self.find_socket(table, local, peer) else {
            tracing::trace!(%protocol, %local, "no socket for endpoint");
            return Resolution::unresolved();
        };
        if socket.inode == 0 {
            return Resolution::unresolved();
        }
        let attribution = self
            .find_pid(socket.inode)
            .and_then(|pid| self.describe(pid, socket.uid));
        if attribution.is_none() {
            tracing::trace!(%protocol, %local, inode = socket.inode, "socket owner not found");
        }
        Resolution {
            inode: Some(socket.inode),
            attribution,
        }
    }

    fn read_table(&self, protocol: Protocol) -> Option<SocketTable> {
        match SocketTable::read(&self.proc_root, protocol) {
            Ok(table) => Some(table),
            Err(e) => {
                tracing::debug!(error = %e, %protocol, "failed to read socket table");
                None
            }
        }
    }

    // Re-reads the table while the socket reports inode 0.
    fn find_socket(&self, table: &mut SocketTable, local: SocketAddr, peer: Option<SocketAddr>) -> Option<SocketEntry> {
        let mut attempt = 0;
        loop {
            let found = table.find(local, peer)?;
            if found.inode != 0 || attempt >= self.config.socket_retry_attempts {
                return Some(found);
            }
            attempt += 1;
            std::thread::sleep(self.config.socket_retry_delay());
            *table = self.read_table(table.protocol())?;
        }
    }

    fn find_pid(&mut self, inode: u64) -> Option<i32> {
        if let Some(&pid) = self.pid_cache.get(&inode) {
            if self.process_holds(pid, inode) {
                return Some(pid);
            }
            let _ = self.pid_cache.remove(&inode);
        }
        let pid = self.scan_for(inode)?;
        let _ = self.pid_cache.insert(inode, pid);
        Some(pid)
    }

    fn process_dir(&self, pid: i32) -> PathBuf {
        self.proc_root.join(pid.to_string())
    }

    fn process_holds(&mut self, pid: i32, inode: u64) -> bool {
        Process::new_with_root(self.process_dir(pid))
            .and_then(|process| self.fd_holds(&process, inode))
            .unwrap_or(false)
    }

    fn fd_holds(&mut self, process: &Process, inode: u64) -> Result<bool, ProcError> {
        let fds = match process.fd() {
            Ok(fds) => fds,
            Err(e) => {
                self.note_error(&e);
                return Err(e);
            }
        };
        Ok(fds
            .flatten()
            .any(|fd| matches!(fd.target, FDTarget::Socket(found) if found == inode)))
    }

    fn scan_for(&mut self, inode: u64) -> Option<i32> {
        let processes = match procfs::process::all_processes_with_root(&self.proc_root) {
            Ok(processes) => processes,
            Err(e) => {
                self.note_error(&e);
                return None;
            }
        };
        for process in processes.take(self.config.max_scan_processes).flatten() {
            if self.fd_holds(&process, inode).unwrap_or(false) {
                return Some(process.pid());
            }
        }
        None
    }

    fn note_error(&mut self, error: &ProcError) {
        if matches!(error, ProcError::PermissionDenied(_)) && !self.permission_warned {
            self.permission_warned = true;
            tracing::warn!(
                error = %error,
                "cannot read other processes' descriptors; grant CAP_SYS_PTRACE or CAP_DAC_READ_SEARCH for full attribution"
            );
        }
    }

    fn describe(&mut self, pid: i32, uid: u32) -> Option<ProcessAttribution> {
        let process = Process::new_with_root(self.process_dir(pid)).ok()?;
        let process_name = process.stat().ok()?.comm;
        let command_line = process.cmdline().unwrap_or_default();
        Some(ProcessAttribution {
            pid: u32::try_from(pid).ok()?,
            process_name,
            command_line,
            uid,
            username: self.username(uid),
        })
    }

    fn username(&mut self, uid: u32) -> Option<String> {
        self.usernames
            .entry(uid)
            .or_insert_with(|| match User::from_uid(Uid::from_raw(uid)) {
                Ok(user) => user.map(|u| u.name),
                Err(e) => {
                    tracing::debug!(uid, error = %e, "user lookup failed");
                    None
                }
            })
            .clone()
    }
}
