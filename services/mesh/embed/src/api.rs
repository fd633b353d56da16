//! Flat call surface for language bindings.
//!
//! Every function takes primitive values, returns a [`Status`] (plus out
//! values on the side) and never panics across the boundary. The outcome of
//! every call is recorded so that [`Api::err_msg`] can explain the last
//! failure on a handle.

use crate::error::{MeshError, Result, Status};
use crate::handle::Handle;
use crate::runtime::MeshRuntime;
use crate::server::Setting;
use std::path::PathBuf;

/// Version of the embedding surface
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Integer/string/status wrapper around a [`MeshRuntime`]
pub struct Api {
    runtime: MeshRuntime,
}

impl Api {
    /// Surface over a runtime with environment configuration
    pub fn new() -> Result<Self> {
        Ok(Self::with_runtime(MeshRuntime::new()?))
    }

    /// Surface over an existing runtime
    pub fn with_runtime(runtime: MeshRuntime) -> Self {
        Self { runtime }
    }

    /// Typed runtime underneath
    pub fn runtime(&self) -> &MeshRuntime {
        &self.runtime
    }

    fn record<T>(&self, handle: Handle, op: &str, result: &Result<T>) {
        let reporter = self.runtime.reporter();
        match result {
            Err(MeshError::Handle(_)) => reporter.record_global(op, result),
            _ => {
                reporter.record(handle, op, result);
                // The handle may have been closed by another thread meanwhile.
                if !self.runtime.is_live(handle) {
                    reporter.forget(handle);
                }
            }
        }
    }

    fn status<T>(&self, raw: u64, op: &str, result: Result<T>) -> (Option<T>, Status) {
        self.record(Handle::from_raw(raw), op, &result);
        let status = Status::from(&result);
        (result.ok(), status)
    }

    fn configure(&self, server: u64, setting: Setting) -> Status {
        let op = setting.name();
        let result = self.runtime.configure(Handle::from_raw(server), setting);
        self.status(server, op, result).1
    }

    /// Create a server; never fails
    pub fn new_server(&self) -> u64 {
        self.runtime.new_server().raw()
    }

    /// Set the state directory
    pub fn set_dir(&self, server: u64, dir: &str) -> Status {
        self.configure(server, Setting::Dir(PathBuf::from(dir)))
    }

    /// Set the requested hostname
    pub fn set_hostname(&self, server: u64, hostname: &str) -> Status {
        self.configure(server, Setting::Hostname(hostname.to_string()))
    }

    /// Set the auth key
    pub fn set_authkey(&self, server: u64, key: &str) -> Status {
        self.configure(server, Setting::AuthKey(key.to_string()))
    }

    /// Set the control URL
    pub fn set_control_url(&self, server: u64, url: &str) -> Status {
        self.configure(server, Setting::ControlUrl(url.to_string()))
    }

    /// Set ephemeral membership
    pub fn set_ephemeral(&self, server: u64, ephemeral: bool) -> Status {
        self.configure(server, Setting::Ephemeral(ephemeral))
    }

    /// Send engine logs to `fd`; `-1` discards them
    pub fn set_log_fd(&self, server: u64, fd: i32) -> Status {
        self.configure(server, Setting::LogFd(fd))
    }

    /// Start the server
    pub fn start(&self, server: u64) -> Status {
        let result = self.runtime.start(Handle::from_raw(server));
        self.status(server, "start", result).1
    }

    /// Block until the server is up
    pub fn up(&self, server: u64) -> Status {
        let result = self.runtime.up(Handle::from_raw(server));
        self.status(server, "up", result).1
    }

    /// Close a server, listener or connection
    pub fn close(&self, handle: u64) -> Status {
        let result = self.runtime.close(Handle::from_raw(handle));
        self.status(handle, "close", result).1
    }

    /// Bind a listener; the handle is 0 on failure
    pub fn listen(&self, server: u64, network: &str, addr: &str) -> (u64, Status) {
        let result = self.runtime.listen(Handle::from_raw(server), network, addr);
        let (handle, status) = self.status(server, "listen", result);
        (handle.map(Handle::raw).unwrap_or(0), status)
    }

    /// Block for the next inbound connection; the handle is 0 on failure
    pub fn accept(&self, listener: u64) -> (u64, Status) {
        let result = self.runtime.accept(Handle::from_raw(listener));
        let (handle, status) = self.status(listener, "accept", result);
        (handle.map(Handle::raw).unwrap_or(0), status)
    }

    /// Open an outbound connection; the handle is 0 on failure
    pub fn dial(&self, server: u64, network: &str, addr: &str) -> (u64, Status) {
        let result = self.runtime.dial(Handle::from_raw(server), network, addr);
        let (handle, status) = self.status(server, "dial", result);
        (handle.map(Handle::raw).unwrap_or(0), status)
    }

    /// Proxy address and credential; both empty on failure
    pub fn loopback(&self, server: u64) -> (String, String, Status) {
        let result = self.runtime.loopback(Handle::from_raw(server));
        match self.status(server, "loopback", result) {
            (Some(info), status) => (info.addr, info.credential, status),
            (None, status) => (String::new(), String::new(), status),
        }
    }

    /// `"<ipv4>,<ipv6>"` of an up server
    pub fn getips(&self, server: u64) -> (String, Status) {
        let result = self.runtime.ips(Handle::from_raw(server));
        let (ips, status) = self.status(server, "getips", result);
        (ips.unwrap_or_default(), status)
    }

    /// Address a listener is bound to
    pub fn listener_addr(&self, listener: u64) -> (String, Status) {
        let result = self.runtime.listener_addr(Handle::from_raw(listener));
        let (addr, status) = self.status(listener, "listener_addr", result);
        (addr.unwrap_or_default(), status)
    }

    /// Far address of a connection
    pub fn remote_addr(&self, connection: u64) -> (String, Status) {
        let result = self.runtime.remote_addr(Handle::from_raw(connection));
        let (addr, status) = self.status(connection, "remote_addr", result);
        (addr.unwrap_or_default(), status)
    }

    /// Near address of a connection
    pub fn local_addr(&self, connection: u64) -> (String, Status) {
        let result = self.runtime.local_addr(Handle::from_raw(connection));
        let (addr, status) = self.status(connection, "local_addr", result);
        (addr.unwrap_or_default(), status)
    }

    /// Read into `buf`; 0 bytes with `Status::Ok` means end of stream
    pub fn read(&self, connection: u64, buf: &mut [u8]) -> (usize, Status) {
        let result = self.runtime.read(Handle::from_raw(connection), buf);
        let (n, status) = self.status(connection, "read", result);
        (n.unwrap_or(0), status)
    }

    /// Write all of `buf`
    pub fn write(&self, connection: u64, buf: &[u8]) -> (usize, Status) {
        let result = self.runtime.write(Handle::from_raw(connection), buf);
        let (n, status) = self.status(connection, "write", result);
        (n.unwrap_or(0), status)
    }

    /// Message of the last failed call on `handle`; empty after a success
    ///
    /// Handles that are not live report the global slot.
    pub fn err_msg(&self, handle: u64) -> String {
        let handle = Handle::from_raw(handle);
        let reporter = self.runtime.reporter();
        if self.runtime.is_live(handle) {
            reporter.message(handle)
        } else {
            reporter.global_message()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn api() -> Api {
        let config = RuntimeConfig {
            worker_threads: Some(2),
            ..RuntimeConfig::default()
        };
        Api::with_runtime(MeshRuntime::with_config(config).unwrap())
    }

    #[test]
    fn test_version_exposed() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_setter_failure_is_reported_on_the_handle() {
        let api = api();
        let server = api.new_server();
        assert_ne!(server, 0);

        assert_eq!(api.set_control_url(server, "ftp://nope"), Status::ConfigError);
        assert!(api.err_msg(server).starts_with("set_control_url: "));

        assert_eq!(api.set_hostname(server, "alpha"), Status::Ok);
        assert_eq!(api.err_msg(server), "");
    }

    #[test]
    fn test_unknown_handles_use_global_slot() {
        let api = api();
        assert_eq!(api.start(12345), Status::HandleError);
        assert!(api.err_msg(12345).starts_with("start: "));
        assert_eq!(api.close(0), Status::HandleError);
        assert!(api.err_msg(0).starts_with("close: invalid handle"));
    }

    #[test]
    fn test_ops_before_up_are_state_errors() {
        let api = api();
        let server = api.new_server();
        assert_eq!(api.up(server), Status::StateError);
        assert_eq!(api.listen(server, "tcp", ":80"), (0, Status::StateError));
        assert_eq!(api.dial(server, "tcp", "peer:80").1, Status::StateError);
        assert_eq!(api.getips(server), (String::new(), Status::StateError));
        assert_eq!(api.loopback(server).2, Status::StateError);
        assert!(api.err_msg(server).starts_with("loopback: "));
    }
}
