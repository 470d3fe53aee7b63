//! Built-in `va.*` methods for the guest and host agents.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use vagent_bridge::FrameLimits;

use super::{DeferredMethod, MethodTable, string_param};
use crate::client::{AgentHandle, CallError};
use crate::codec::{Fault, Reply};
use crate::config::Role;
use crate::version::VersionInfo;

pub const PING: &str = "va.ping";
pub const HELLO: &str = "va.hello";
pub const CAPABILITIES: &str = "va.capabilities";
pub const GETFILE: &str = "va.getfile";
pub const GETDMESG: &str = "va.getdmesg";
pub const SHUTDOWN: &str = "va.shutdown";

/// Largest file `va.getfile` will return, before base64, whatever the
/// frame limit.
pub const GETFILE_MAX: u64 = 1 << 30;

/// Room left in a reply body for `{"result":"..."}` around the base64.
const REPLY_ENVELOPE: usize = 64;

/// Kernel log buffer size requested from dmesg, and the reply cap.
pub const DMESG_LEN: usize = 16384;

pub const SHUTDOWN_COMMAND: &str = "/sbin/shutdown";
pub const SHUTDOWN_DELAY: Duration = Duration::from_secs(5);

/// Methods served by the agent inside the guest.
///
/// `limits` must match the channel's framer so `va.getfile` refuses files
/// whose reply could not be sent.
pub fn guest_methods(limits: FrameLimits) -> MethodTable {
    let mut table = MethodTable::new();
    table
        .register_deferred(GETFILE, GetFile::for_frame_limit(limits.max_content_len))
        .register_deferred(GETDMESG, GetDmesg::default())
        .register_deferred(SHUTDOWN, Shutdown::default())
        .register(PING, ping);
    with_capabilities(table, Role::Guest)
}

/// Methods served by the host side.
///
/// With a `peer` handle, a guest's `va.hello` triggers a capabilities query
/// back to the guest.
pub fn host_methods(peer: Option<AgentHandle>) -> MethodTable {
    let mut table = MethodTable::new();
    table
        .register(PING, ping)
        .register_deferred(HELLO, Hello { peer });
    with_capabilities(table, Role::Host)
}

#[derive(Debug, Clone, Serialize)]
struct Capabilities {
    #[serde(flatten)]
    version: VersionInfo,
    methods: Vec<String>,
}

fn with_capabilities(mut table: MethodTable, role: Role) -> MethodTable {
    let mut methods: Vec<String> = table.names().map(str::to_string).collect();
    methods.push(CAPABILITIES.to_string());
    let caps = Capabilities {
        version: VersionInfo::new().with_role(role.as_str()),
        methods,
    };
    table.register(CAPABILITIES, move |_| {
        serde_json::to_value(&caps).map_err(|e| Fault::internal(e.to_string()))
    });
    table
}

fn ping(_params: Value) -> Reply {
    Ok(json!("ok"))
}

/// `va.getfile`: base64 contents of a file.
#[derive(Debug, Clone)]
pub struct GetFile {
    pub max_len: u64,
}

impl GetFile {
    /// Cap file size so the base64 reply fits a body of `max_content_len`.
    pub fn for_frame_limit(max_content_len: usize) -> Self {
        let encoded = max_content_len.saturating_sub(REPLY_ENVELOPE);
        let raw = (encoded / 4 * 3) as u64;
        Self {
            max_len: raw.min(GETFILE_MAX),
        }
    }

    fn too_large(&self) -> Fault {
        Fault::internal(format!("max file size ({} bytes) exceeded", self.max_len))
    }
}

impl Default for GetFile {
    fn default() -> Self {
        Self::for_frame_limit(FrameLimits::DEFAULT_MAX_CONTENT_LEN)
    }
}

#[async_trait]
impl DeferredMethod for GetFile {
    async fn call(&self, params: Value) -> Reply {
        let path = string_param(&params, "path")?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Fault::internal(format!("open failed: {e}")))?;
        let meta = file
            .metadata()
            .await
            .map_err(|e| Fault::internal(format!("stat failed: {e}")))?;
        if meta.len() > self.max_len {
            tracing::debug!(path = %path, len = meta.len(), max = self.max_len, "File too large");
            return Err(self.too_large());
        }

        // The file may grow between stat and read.
        let mut contents = Vec::new();
        file.take(self.max_len + 1)
            .read_to_end(&mut contents)
            .await
            .map_err(|e| Fault::internal(format!("read failed: {e}")))?;
        if contents.len() as u64 > self.max_len {
            return Err(self.too_large());
        }
        tracing::debug!(path = %path, len = contents.len(), "File read");
        Ok(Value::String(BASE64.encode(&contents)))
    }
}

/// `va.getdmesg`: the tail of the kernel log.
#[derive(Debug, Clone)]
pub struct GetDmesg {
    pub program: PathBuf,
    pub len: usize,
}

impl Default for GetDmesg {
    fn default() -> Self {
        Self {
            program: PathBuf::from("dmesg"),
            len: DMESG_LEN,
        }
    }
}

#[async_trait]
impl DeferredMethod for GetDmesg {
    async fn call(&self, _params: Value) -> Reply {
        let output = Command::new(&self.program)
            .arg("-s")
            .arg(self.len.to_string())
            .output()
            .await
            .map_err(|e| Fault::internal(format!("failed to run dmesg: {e}")))?;
        if !output.status.success() {
            return Err(Fault::internal(format!("dmesg failed: {}", output.status)));
        }
        let mut log = output.stdout;
        log.truncate(self.len);
        Ok(Value::String(String::from_utf8_lossy(&log).into_owned()))
    }
}

/// Map a shutdown mode to the flag passed to the shutdown command.
pub fn shutdown_flag(mode: &str) -> Option<&'static str> {
    match mode {
        "halt" => Some("-H"),
        "powerdown" => Some("-P"),
        "reboot" => Some("-r"),
        _ => None,
    }
}

/// `va.shutdown`: halt, power down or reboot the guest.
///
/// Replies first. The shutdown command runs after `delay`, so the reply has
/// time to reach the host.
#[derive(Debug, Clone)]
pub struct Shutdown {
    pub command: PathBuf,
    pub delay: Duration,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self {
            command: PathBuf::from(SHUTDOWN_COMMAND),
            delay: SHUTDOWN_DELAY,
        }
    }
}

#[async_trait]
impl DeferredMethod for Shutdown {
    async fn call(&self, params: Value) -> Reply {
        let mode = string_param(&params, "mode")?;
        let flag = shutdown_flag(&mode)
            .ok_or_else(|| Fault::invalid_params(format!("invalid shutdown type: {mode}")))?;

        tracing::info!(%mode, delay_secs = self.delay.as_secs(), "Shutdown requested");
        let command = self.command.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let status = Command::new(&command)
                .args([flag, "+0", "hypervisor initiated shutdown"])
                .status()
                .await;
            match status {
                Ok(s) if s.success() => {}
                Ok(s) => tracing::error!(status = %s, "Shutdown command failed"),
                Err(e) => tracing::error!(error = %e, command = %command.display(), "Failed to run shutdown command"),
            }
        });
        Ok(json!("ok"))
    }
}

/// `va.hello`: the guest agent announces it has started.
pub struct Hello {
    peer: Option<AgentHandle>,
}

#[async_trait]
impl DeferredMethod for Hello {
    async fn call(&self, _params: Value) -> Reply {
        tracing::info!("Guest agent started");
        if let Some(peer) = self.peer.clone() {
            tokio::spawn(async move {
                match peer.call(CAPABILITIES, Value::Null).await {
                    Ok(caps) => tracing::info!(capabilities = %caps, "Guest capabilities"),
                    Err(e) => tracing::warn!(error = %e, "Failed to query guest capabilities"),
                }
            });
        }
        Ok(json!("ok"))
    }
}

/// Host-side calls into the guest's methods.
impl AgentHandle {
    pub async fn ping(&self) -> Result<(), CallError> {
        self.call(PING, json!({})).await.map(|_| ())
    }

    /// Fetch a file from the peer with `va.getfile`.
    pub async fn view_file(&self, path: &str) -> Result<Vec<u8>, CallError> {
        let reply = self.call(GETFILE, json!({ "path": path })).await?;
        let encoded = reply
            .as_str()
            .ok_or_else(|| CallError::BadReply(format!("{GETFILE} returned {reply}")))?;
        BASE64
            .decode(encoded)
            .map_err(|e| CallError::BadReply(format!("{GETFILE}: {e}")))
    }

    /// The peer's kernel log, via `va.getdmesg`.
    pub async fn view_dmesg(&self) -> Result<String, CallError> {
        match self.call(GETDMESG, json!({})).await? {
            Value::String(log) => Ok(log),
            other => Err(CallError::BadReply(format!("{GETDMESG} returned {other}"))),
        }
    }

    /// Ask the guest to halt, power down or reboot.
    pub async fn shutdown(&self, mode: &str) -> Result<(), CallError> {
        if shutdown_flag(mode).is_none() {
            return Err(CallError::Fault(Fault::invalid_params(format!(
                "invalid shutdown type: {mode}"
            ))));
        }
        self.call(SHUTDOWN, json!({ "mode": mode })).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::methods::Method;
    use std::io::Write;

    fn call_immediate(table: &MethodTable, name: &str, params: Value) -> Reply {
        match table.lookup(name) {
            Some(Method::Immediate(h)) => h(params),
            other => panic!("{name} is not immediate: {other:?}"),
        }
    }

    #[test]
    fn guest_capabilities_list_every_method() {
        let table = guest_methods(FrameLimits::default());
        let caps = call_immediate(&table, CAPABILITIES, Value::Null).unwrap();
        assert_eq!(caps["role"], "guest");
        assert_eq!(caps["version"], crate::version::VAGENT_VERSION);
        assert_eq!(
            caps["methods"],
            json!([GETFILE, GETDMESG, SHUTDOWN, PING, CAPABILITIES])
        );
    }

    #[test]
    fn host_methods_set() {
        let table = host_methods(None);
        assert_eq!(
            table.names().collect::<Vec<_>>(),
            vec![PING, HELLO, CAPABILITIES]
        );
        assert_eq!(call_immediate(&table, PING, Value::Null), Ok(json!("ok")));
    }

    #[tokio::test]
    async fn getfile_returns_base64() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let reply = GetFile::default().call(json!({ "path": path })).await;
        assert_eq!(reply, Ok(json!("aGVsbG8=")));
    }

    #[tokio::test]
    async fn getfile_enforces_size_cap() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let reply = GetFile { max_len: 4 }.call(json!([path])).await;
        assert!(reply.unwrap_err().message.contains("max file size"));
    }

    #[test]
    fn getfile_cap_follows_frame_limit() {
        assert_eq!(GetFile::for_frame_limit(4096).max_len, 3024);
        assert_eq!(GetFile::for_frame_limit(10).max_len, 0);
        assert_eq!(GetFile::for_frame_limit(usize::MAX).max_len, GETFILE_MAX);
    }

    #[tokio::test]
    async fn getfile_reply_at_cap_fits_in_a_frame() {
        use crate::codec::{JsonRpcCodec, PayloadCodec};

        let method = GetFile::for_frame_limit(4096);
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(method.max_len).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let reply = method.call(json!({ "path": path })).await;
        assert!(reply.is_ok());
        let body = JsonRpcCodec.encode_reply(&reply).unwrap();
        assert!(body.len() <= 4096, "reply body is {} bytes", body.len());
    }

    #[tokio::test]
    async fn getfile_rejects_oversized_file_before_reading() {
        let method = GetFile::for_frame_limit(4096);
        // Sparse: stat says 1 GiB, so reading it would be slow and large.
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(1 << 30).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let fault = method.call(json!({ "path": path })).await.unwrap_err();
        assert_eq!(fault.message, "max file size (3024 bytes) exceeded");

        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(method.max_len + 1).unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let fault = method.call(json!({ "path": path })).await.unwrap_err();
        assert!(fault.message.contains("max file size"));
    }

    #[tokio::test]
    async fn getfile_missing_file_faults() {
        let reply = GetFile::default()
            .call(json!({"path": "/nonexistent/vagent/file"}))
            .await;
        assert!(reply.unwrap_err().message.starts_with("open failed"));
    }

    #[tokio::test]
    async fn getdmesg_truncates_output() {
        // echo stands in for dmesg and prints its arguments: "-s 4\n".
        let method = GetDmesg {
            program: PathBuf::from("echo"),
            len: 4,
        };
        assert_eq!(method.call(Value::Null).await, Ok(json!("-s 4")));
    }

    #[test]
    fn shutdown_modes() {
        assert_eq!(shutdown_flag("halt"), Some("-H"));
        assert_eq!(shutdown_flag("powerdown"), Some("-P"));
        assert_eq!(shutdown_flag("reboot"), Some("-r"));
        assert_eq!(shutdown_flag("suspend"), None);
    }

    #[tokio::test]
    async fn shutdown_rejects_unknown_mode() {
        let reply = Shutdown::default().call(json!({"mode": "suspend"})).await;
        assert_eq!(reply.unwrap_err().code, Fault::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn shutdown_replies_before_running_command() {
        let method = Shutdown {
            command: PathBuf::from("/nonexistent/shutdown"),
            delay: Duration::from_secs(3600),
        };
        assert_eq!(method.call(json!({"mode": "reboot"})).await, Ok(json!("ok")));
    }
}
