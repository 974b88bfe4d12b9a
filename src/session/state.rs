//! Module `state`
//!
//! Defines the `Session` struct holding everything the command handlers
//! mutate for one control connection: login state, domain and working
//! directory, transfer type, resume offset and the pending data channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};

use crate::storage::validation::join_root;
use crate::transfer::data_channel::DataChannel;
use crate::transfer::framing::DataSocket;
use crate::transfer::modes::TransferType;

/// MD5 bookkeeping for the `OPTS MD5*` extensions.
#[derive(Debug, Default)]
pub struct ChecksumState {
    /// Digest every transfer while set.
    pub enabled: bool,
    /// Value given with `OPTS MD5SET`, consumed by the next `MD5DUMP`.
    pub expected: Option<String>,
    /// Digest of the last completed transfer.
    pub last: Option<String>,
    /// Checksums recorded with `OPTS MD5DUMP`, by virtual path.
    pub recorded: HashMap<String, String>,
}

/// Domain the session is working in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainContext {
    pub name: String,
    /// Virtual root of the domain below the server root.
    pub root: String,
    /// User selected with `DOMAIN name[user]`.
    pub user: Option<String>,
}

/// Per-connection state of an FTP session.
pub struct Session {
    id: u64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    username: Option<String>,
    logged_in: bool,
    login_attempts: u32,
    domain: Option<DomainContext>,
    paths: HashMap<String, String>,
    transfer_type: TransferType,
    rest_offset: u64,
    rename_from: Option<String>,
    data_channel: Option<DataChannel>,
    data_socket: Option<DataSocket>,
    data_alive: bool,
    mkdirs: bool,
    checksum: ChecksumState,
    aliases: HashMap<String, HashMap<String, String>>,
    buffer_size: usize,
    last_command: Option<String>,
    closed: AtomicBool,
}

impl Session {
    pub fn new(id: u64, peer_addr: SocketAddr, local_addr: SocketAddr, buffer_size: usize) -> Self {
        Self {
            id,
            peer_addr,
            local_addr,
            username: None,
            logged_in: false,
            login_attempts: 0,
            domain: None,
            paths: HashMap::new(),
            transfer_type: TransferType::default(),
            rest_offset: 0,
            rename_from: None,
            data_channel: None,
            data_socket: None,
            data_alive: false,
            mkdirs: false,
            checksum: ChecksumState::default(),
            aliases: HashMap::new(),
            buffer_size,
            last_command: None,
            closed: AtomicBool::new(false),
        }
    }

    // --------------------
    // Getter methods
    // --------------------

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    pub fn login_attempts(&self) -> u32 {
        self.login_attempts
    }

    pub fn domain(&self) -> Option<&DomainContext> {
        self.domain.as_ref()
    }

    pub fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    /// Pending resume offset, left untouched.
    pub fn rest_offset(&self) -> u64 {
        self.rest_offset
    }

    pub fn is_data_alive(&self) -> bool {
        self.data_alive
    }

    pub fn mkdirs(&self) -> bool {
        self.mkdirs
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn last_command(&self) -> Option<&str> {
        self.last_command.as_deref()
    }

    pub fn checksum(&self) -> &ChecksumState {
        &self.checksum
    }

    pub fn checksum_mut(&mut self) -> &mut ChecksumState {
        &mut self.checksum
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // --------------------
    // Setter methods
    // --------------------

    pub fn set_username(&mut self, username: Option<String>) {
        self.username = username;
    }

    pub fn set_logged_in(&mut self, logged_in: bool) {
        self.logged_in = logged_in;
    }

    /// Records a failed `PASS` and returns the number of failures so far.
    pub fn record_failed_login(&mut self) -> u32 {
        self.login_attempts += 1;
        self.login_attempts
    }

    pub fn set_transfer_type(&mut self, transfer_type: TransferType) {
        self.transfer_type = transfer_type;
    }

    pub fn set_rest_offset(&mut self, offset: u64) {
        self.rest_offset = offset;
    }

    /// Returns the pending resume offset and resets it, so it applies to
    /// exactly one transfer.
    pub fn take_rest_offset(&mut self) -> u64 {
        std::mem::take(&mut self.rest_offset)
    }

    pub fn set_rename_from(&mut self, path: Option<String>) {
        self.rename_from = path;
    }

    pub fn take_rename_from(&mut self) -> Option<String> {
        self.rename_from.take()
    }

    pub fn set_data_alive(&mut self, data_alive: bool) {
        self.data_alive = data_alive;
    }

    pub fn set_mkdirs(&mut self, mkdirs: bool) {
        self.mkdirs = mkdirs;
    }

    pub fn set_last_command(&mut self, command: &str) {
        self.last_command = Some(command.to_string());
    }

    // --------------------
    // Domain and paths
    // --------------------

    fn domain_key(&self) -> String {
        self.domain
            .as_ref()
            .map(|d| d.name.clone())
            .unwrap_or_default()
    }

    /// Switches domain; the working directory of each domain is remembered.
    pub fn set_domain(&mut self, domain: Option<DomainContext>) {
        self.domain = domain;
    }

    /// Working directory relative to the domain root.
    pub fn current_path(&self) -> String {
        self.paths
            .get(&self.domain_key())
            .cloned()
            .unwrap_or_else(|| "/".to_string())
    }

    pub fn set_current_path(&mut self, path: String) {
        let key = self.domain_key();
        self.paths.insert(key, path);
    }

    /// Storage path for a virtual path of the current domain.
    pub fn storage_path(&self, virtual_path: &str) -> String {
        match &self.domain {
            Some(domain) => join_root(&domain.root, virtual_path),
            None => join_root("/", virtual_path),
        }
    }

    // --------------------
    // Aliases
    // --------------------

    pub fn set_alias(&mut self, source: &str, target: &str) {
        let key = self.domain_key();
        self.aliases
            .entry(key)
            .or_default()
            .insert(source.to_ascii_uppercase(), target.to_string());
    }

    pub fn remove_alias(&mut self, source: &str) -> bool {
        let key = self.domain_key();
        self.aliases
            .get_mut(&key)
            .map(|map| map.remove(&source.to_ascii_uppercase()).is_some())
            .unwrap_or(false)
    }

    pub fn alias(&self, verb: &str) -> Option<&str> {
        self.aliases
            .get(&self.domain_key())
            .and_then(|map| map.get(verb))
            .map(String::as_str)
    }

    pub fn aliases(&self) -> Vec<(String, String)> {
        let mut list: Vec<(String, String)> = self
            .aliases
            .get(&self.domain_key())
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        list.sort();
        list
    }

    // --------------------
    // Data channel
    // --------------------

    pub fn data_channel(&self) -> Option<&DataChannel> {
        self.data_channel.as_ref()
    }

    pub fn set_data_channel(&mut self, channel: Option<DataChannel>) {
        self.data_channel = channel;
    }

    pub fn take_data_channel(&mut self) -> Option<DataChannel> {
        self.data_channel.take()
    }

    pub fn data_socket_mut(&mut self) -> Option<&mut DataSocket> {
        self.data_socket.as_mut()
    }

    pub fn set_data_socket(&mut self, socket: Option<DataSocket>) {
        self.data_socket = socket;
    }

    pub fn has_open_data_socket(&self) -> bool {
        self.data_socket.as_ref().is_some_and(DataSocket::is_open)
    }

    /// Drops the data channel after a transfer. A data-alive socket is kept
    /// for the next transfer unless `force` is set.
    pub async fn release_data_channel(&mut self, force: bool) {
        if !force && self.data_alive && self.has_open_data_socket() {
            debug!("Client {} keeps its data socket open", self.peer_addr);
            return;
        }
        if let Some(mut socket) = self.data_socket.take() {
            socket.close().await;
        }
        if self.data_channel.take().is_some() {
            debug!("Client {} released its pending data channel", self.peer_addr);
        }
    }

    /// Closes the session and its data channel. Only the first call does
    /// anything; it returns whether this call performed the cleanup.
    pub async fn close(&mut self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("Session {} already closed", self.id);
            return false;
        }
        self.release_data_channel(true).await;
        if self.logged_in {
            info!(
                "Client {} logged out ({})",
                self.peer_addr,
                self.username.as_deref().unwrap_or("-")
            );
        }
        self.logged_in = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            1,
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:2121".parse().unwrap(),
            8192,
        )
    }

    #[test]
    fn rest_offset_is_consumed_once() {
        let mut s = session();
        s.set_rest_offset(100);
        assert_eq!(s.take_rest_offset(), 100);
        assert_eq!(s.take_rest_offset(), 0);
    }

    #[test]
    fn working_directory_is_kept_per_domain() {
        let mut s = session();
        s.set_current_path("/a".into());
        s.set_domain(Some(DomainContext {
            name: "ops".into(),
            root: "/ops".into(),
            user: None,
        }));
        assert_eq!(s.current_path(), "/");
        assert_eq!(s.storage_path("/x"), "/ops/x");
        s.set_domain(None);
        assert_eq!(s.current_path(), "/a");
    }

    #[test]
    fn aliases_are_scoped_to_the_domain() {
        let mut s = session();
        s.set_alias("ls", "LIST");
        assert_eq!(s.alias("LS"), Some("LIST"));
        s.set_domain(Some(DomainContext {
            name: "ops".into(),
            root: "/ops".into(),
            user: None,
        }));
        assert_eq!(s.alias("LS"), None);
    }

    #[tokio::test]
    async fn close_runs_cleanup_once() {
        let mut s = session();
        s.set_logged_in(true);
        assert!(s.close().await);
        assert!(!s.close().await);
        assert!(s.is_closed());
    }
}
