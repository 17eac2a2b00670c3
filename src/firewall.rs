//! Enforcement gateway
//!
//! Tracks which IPs are blocked and issues the OS firewall commands through a
//! pluggable backend. The registry is only changed after a command pair
//! succeeds; a half-applied block or unblock is rolled back.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::error::FirewallError;

/// Firewall backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// netsh on Windows, iptables elsewhere
    #[default]
    Auto,
    Iptables,
    Netsh,
    /// Log commands without touching the host firewall
    DryRun,
}

/// Firewall configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Prefix iptables commands with sudo
    #[serde(default)]
    pub use_sudo: bool,

    /// Upper bound for a single firewall command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Rule name prefix (netsh)
    #[serde(default = "default_rule_prefix")]
    pub rule_prefix: String,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            use_sudo: false,
            command_timeout_secs: default_command_timeout(),
            rule_prefix: default_rule_prefix(),
        }
    }
}

fn default_command_timeout() -> u64 {
    10
}

fn default_rule_prefix() -> String {
    "NGFW_Block".to_string()
}

/// Traffic direction of a deny rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// OS-level firewall operations
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Install a rule dropping traffic from (inbound) or to (outbound) `ip`
    async fn deny(&self, ip: IpAddr, direction: Direction) -> Result<(), FirewallError>;

    /// Remove the rule installed by `deny`
    async fn allow(&self, ip: IpAddr, direction: Direction) -> Result<(), FirewallError>;
}

/// Run an external command, failing on non-zero exit or timeout
async fn run_command(program: &str, args: &[String], timeout: Duration) -> Result<(), FirewallError> {
    let command = format!("{} {}", program, args.join(" "));
    debug!("Running: {}", command);

    let output = Command::new(program).args(args).kill_on_drop(true).output();

    let output = match tokio::time::timeout(timeout, output).await {
        Ok(result) => result.map_err(|source| FirewallError::Spawn {
            command: command.clone(),
            source,
        })?,
        Err(_) => {
            return Err(FirewallError::Timeout {
                command,
                secs: timeout.as_secs(),
            })
        }
    };

    if !output.status.success() {
        return Err(FirewallError::CommandFailed {
            command,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}

/// Linux iptables/ip6tables backend
pub struct IptablesBackend {
    use_sudo: bool,
    timeout: Duration,
}

impl IptablesBackend {
    pub fn new(use_sudo: bool, timeout: Duration) -> Self {
        Self { use_sudo, timeout }
    }

    fn command(&self, action: &str, ip: IpAddr, direction: Direction) -> (String, Vec<String>) {
        let binary = match ip {
            IpAddr::V4(_) => "iptables",
            IpAddr::V6(_) => "ip6tables",
        };
        let (chain, flag) = match direction {
            Direction::Inbound => ("INPUT", "-s"),
            Direction::Outbound => ("OUTPUT", "-d"),
        };

        let ip = ip.to_string();
        let mut args: Vec<String> = [action, chain, flag, ip.as_str(), "-j", "DROP"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        if self.use_sudo {
            args.insert(0, binary.to_string());
            ("sudo".to_string(), args)
        } else {
            (binary.to_string(), args)
        }
    }
}

#[async_trait]
impl FirewallBackend for IptablesBackend {
    fn name(&self) -> &str {
        "iptables"
    }

    async fn deny(&self, ip: IpAddr, direction: Direction) -> Result<(), FirewallError> {
        let (program, args) = self.command("-A", ip, direction);
        run_command(&program, &args, self.timeout).await
    }

    async fn allow(&self, ip: IpAddr, direction: Direction) -> Result<(), FirewallError> {
        let (program, args) = self.command("-D", ip, direction);
        run_command(&program, &args, self.timeout).await
    }
}

/// Windows advfirewall backend
pub struct NetshBackend {
    rule_prefix: String,
    timeout: Duration,
}

impl NetshBackend {
    pub fn new(rule_prefix: impl Into<String>, timeout: Duration) -> Self {
        Self {
            rule_prefix: rule_prefix.into(),
            timeout,
        }
    }

    /// e.g. `NGFW_Block_203_0_113_5_IN`
    fn rule_name(&self, ip: IpAddr, direction: Direction) -> String {
        let ip = ip.to_string().replace(['.', ':'], "_");
        let suffix = match direction {
            Direction::Inbound => "IN",
            Direction::Outbound => "OUT",
        };
        format!("{}_{}_{}", self.rule_prefix, ip, suffix)
    }
}

#[async_trait]
impl FirewallBackend for NetshBackend {
    fn name(&self) -> &str {
        "netsh"
    }

    async fn deny(&self, ip: IpAddr, direction: Direction) -> Result<(), FirewallError> {
        let dir = match direction {
            Direction::Inbound => "dir=in",
            Direction::Outbound => "dir=out",
        };
        let args = vec![
            "advfirewall".to_string(),
            "firewall".to_string(),
            "add".to_string(),
            "rule".to_string(),
            format!("name={}", self.rule_name(ip, direction)),
            dir.to_string(),
            "action=block".to_string(),
            format!("remoteip={}", ip),
        ];
        run_command("netsh", &args, self.timeout).await
    }

    async fn allow(&self, ip: IpAddr, direction: Direction) -> Result<(), FirewallError> {
        let args = vec![
            "advfirewall".to_string(),
            "firewall".to_string(),
            "delete".to_string(),
            "rule".to_string(),
            format!("name={}", self.rule_name(ip, direction)),
        ];
        run_command("netsh", &args, self.timeout).await
    }
}

/// Backend that only logs
#[derive(Default)]
pub struct DryRunBackend {
    commands_issued: AtomicU64,
}

impl DryRunBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands_issued(&self) -> u64 {
        self.commands_issued.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FirewallBackend for DryRunBackend {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn deny(&self, ip: IpAddr, direction: Direction) -> Result<(), FirewallError> {
        self.commands_issued.fetch_add(1, Ordering::Relaxed);
        info!("[dry-run] deny {} {}", direction, ip);
        Ok(())
    }

    async fn allow(&self, ip: IpAddr, direction: Direction) -> Result<(), FirewallError> {
        self.commands_issued.fetch_add(1, Ordering::Relaxed);
        info!("[dry-run] allow {} {}", direction, ip);
        Ok(())
    }
}

/// Build the configured backend
pub fn backend_from_config(config: &FirewallConfig) -> Arc<dyn FirewallBackend> {
    let timeout = Duration::from_secs(config.command_timeout_secs.max(1));

    let kind = match config.backend {
        BackendKind::Auto if cfg!(windows) => BackendKind::Netsh,
        BackendKind::Auto => BackendKind::Iptables,
        other => other,
    };

    match kind {
        BackendKind::Netsh => Arc::new(NetshBackend::new(config.rule_prefix.clone(), timeout)),
        BackendKind::DryRun => Arc::new(DryRunBackend::new()),
        _ => Arc::new(IptablesBackend::new(config.use_sudo, timeout)),
    }
}

/// Result of a block request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    Blocked,
    AlreadyBlocked,
    Failed(String),
}

/// Result of an unblock request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnblockOutcome {
    Unblocked,
    NotBlocked,
    Failed(String),
}

#[derive(Default)]
struct Registry {
    blocked: HashSet<IpAddr>,
    /// IPs with a command pair currently running
    pending: HashSet<IpAddr>,
}

/// Clears the pending mark when an operation finishes or is cancelled
struct PendingGuard<'a> {
    registry: &'a Mutex<Registry>,
    ip: IpAddr,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.registry.lock().pending.remove(&self.ip);
    }
}

/// Idempotent block/unblock state machine over a firewall backend
pub struct EnforcementGateway {
    backend: Arc<dyn FirewallBackend>,
    registry: Mutex<Registry>,
}

impl EnforcementGateway {
    pub fn new(backend: Arc<dyn FirewallBackend>) -> Self {
        Self {
            backend,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        self.registry.lock().blocked.contains(ip)
    }

    /// Currently blocked IPs, sorted
    pub fn list_blocked(&self) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = self.registry.lock().blocked.iter().copied().collect();
        ips.sort();
        ips
    }

    pub fn blocked_count(&self) -> usize {
        self.registry.lock().blocked.len()
    }

    /// Record an IP blocked by an earlier process without issuing commands
    pub fn adopt(&self, ip: IpAddr) -> bool {
        self.registry.lock().blocked.insert(ip)
    }

    /// Block an IP in both directions
    pub async fn block(&self, ip: IpAddr) -> BlockOutcome {
        let _guard = {
            let mut registry = self.registry.lock();
            if registry.blocked.contains(&ip) || registry.pending.contains(&ip) {
                debug!("{} already blocked", ip);
                return BlockOutcome::AlreadyBlocked;
            }
            registry.pending.insert(ip);
            PendingGuard {
                registry: &self.registry,
                ip,
            }
        };

        if let Err(e) = self.backend.deny(ip, Direction::Inbound).await {
            error!("Failed to block {} (inbound): {}", ip, e);
            return BlockOutcome::Failed(e.to_string());
        }

        if let Err(e) = self.backend.deny(ip, Direction::Outbound).await {
            error!("Failed to block {} (outbound): {}", ip, e);
            if let Err(rollback) = self.backend.allow(ip, Direction::Inbound).await {
                warn!("Rollback of inbound rule for {} failed: {}", ip, rollback);
            }
            return BlockOutcome::Failed(e.to_string());
        }

        self.registry.lock().blocked.insert(ip);
        info!("Blocked {} via {}", ip, self.backend.name());
        BlockOutcome::Blocked
    }

    /// Remove both deny rules for an IP
    pub async fn unblock(&self, ip: IpAddr) -> UnblockOutcome {
        let _guard = {
            let mut registry = self.registry.lock();
            if !registry.blocked.contains(&ip) {
                debug!("{} is not blocked", ip);
                return UnblockOutcome::NotBlocked;
            }
            if registry.pending.contains(&ip) {
                return UnblockOutcome::Failed(format!(
                    "another firewall operation for {} is in progress",
                    ip
                ));
            }
            registry.pending.insert(ip);
            PendingGuard {
                registry: &self.registry,
                ip,
            }
        };

        if let Err(e) = self.backend.allow(ip, Direction::Inbound).await {
            error!("Failed to unblock {} (inbound): {}", ip, e);
            return UnblockOutcome::Failed(e.to_string());
        }

        if let Err(e) = self.backend.allow(ip, Direction::Outbound).await {
            error!("Failed to unblock {} (outbound): {}", ip, e);
            if let Err(rollback) = self.backend.deny(ip, Direction::Inbound).await {
                warn!("Rollback of inbound rule for {} failed: {}", ip, rollback);
            }
            return UnblockOutcome::Failed(e.to_string());
        }

        self.registry.lock().blocked.remove(&ip);
        info!("Unblocked {} via {}", ip, self.backend.name());
        UnblockOutcome::Unblocked
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Op {
        Deny,
        Allow,
    }

    /// Records every call; can fail one (op, direction) pair or delay calls
    #[derive(Default)]
    pub(crate) struct RecordingBackend {
        pub calls: Mutex<Vec<(Op, IpAddr, Direction)>>,
        pub fail_on: Option<(Op, Direction)>,
        pub delay: Option<Duration>,
    }

    impl RecordingBackend {
        pub fn failing(op: Op, direction: Direction) -> Self {
            Self {
                fail_on: Some((op, direction)),
                ..Self::default()
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        async fn call(&self, op: Op, ip: IpAddr, direction: Direction) -> Result<(), FirewallError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.calls.lock().push((op, ip, direction));
            if self.fail_on == Some((op, direction)) {
                return Err(FirewallError::CommandFailed {
                    command: format!("{:?} {} {}", op, direction, ip),
                    code: Some(1),
                    stderr: "rejected".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl FirewallBackend for RecordingBackend {
        fn name(&self) -> &str {
            "recording"
        }

        async fn deny(&self, ip: IpAddr, direction: Direction) -> Result<(), FirewallError> {
            self.call(Op::Deny, ip, direction).await
        }

        async fn allow(&self, ip: IpAddr, direction: Direction) -> Result<(), FirewallError> {
            self.call(Op::Allow, ip, direction).await
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_block_is_idempotent() {
        let backend = Arc::new(RecordingBackend::default());
        let gateway = EnforcementGateway::new(backend.clone());

        assert_eq!(gateway.block(ip("203.0.113.5")).await, BlockOutcome::Blocked);
        assert_eq!(backend.call_count(), 2);

        assert_eq!(gateway.block(ip("203.0.113.5")).await, BlockOutcome::AlreadyBlocked);
        assert_eq!(backend.call_count(), 2);

        assert!(gateway.is_blocked(&ip("203.0.113.5")));
        assert_eq!(gateway.list_blocked(), vec![ip("203.0.113.5")]);
    }

    #[tokio::test]
    async fn test_unblock_is_idempotent() {
        let backend = Arc::new(RecordingBackend::default());
        let gateway = EnforcementGateway::new(backend.clone());

        assert_eq!(gateway.unblock(ip("203.0.113.5")).await, UnblockOutcome::NotBlocked);
        assert_eq!(backend.call_count(), 0);

        gateway.block(ip("203.0.113.5")).await;
        assert_eq!(gateway.unblock(ip("203.0.113.5")).await, UnblockOutcome::Unblocked);
        assert_eq!(gateway.unblock(ip("203.0.113.5")).await, UnblockOutcome::NotBlocked);
        assert_eq!(backend.call_count(), 4);
        assert!(gateway.list_blocked().is_empty());
    }

    #[tokio::test]
    async fn test_block_partial_failure_rolls_back() {
        let backend = Arc::new(RecordingBackend::failing(Op::Deny, Direction::Outbound));
        let gateway = EnforcementGateway::new(backend.clone());
        let target = ip("198.51.100.20");

        let outcome = gateway.block(target).await;
        assert!(matches!(outcome, BlockOutcome::Failed(_)));
        assert!(!gateway.is_blocked(&target));

        let calls = backend.calls.lock().clone();
        assert_eq!(
            calls,
            vec![
                (Op::Deny, target, Direction::Inbound),
                (Op::Deny, target, Direction::Outbound),
                (Op::Allow, target, Direction::Inbound),
            ]
        );
    }

    #[tokio::test]
    async fn test_block_first_command_failure() {
        let backend = Arc::new(RecordingBackend::failing(Op::Deny, Direction::Inbound));
        let gateway = EnforcementGateway::new(backend.clone());

        assert!(matches!(gateway.block(ip("198.51.100.20")).await, BlockOutcome::Failed(_)));
        assert_eq!(backend.call_count(), 1);
        assert!(gateway.list_blocked().is_empty());

        // Registry untouched, so a retry issues commands again
        gateway.block(ip("198.51.100.20")).await;
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_unblock_partial_failure_keeps_registry() {
        let backend = Arc::new(RecordingBackend::failing(Op::Allow, Direction::Outbound));
        let gateway = EnforcementGateway::new(backend.clone());
        let target = ip("198.51.100.21");

        assert_eq!(gateway.block(target).await, BlockOutcome::Blocked);
        assert!(matches!(gateway.unblock(target).await, UnblockOutcome::Failed(_)));
        assert!(gateway.is_blocked(&target));

        let last = *backend.calls.lock().last().unwrap();
        assert_eq!(last, (Op::Deny, target, Direction::Inbound));
    }

    #[tokio::test]
    async fn test_concurrent_block_issues_one_pair() {
        let backend = Arc::new(RecordingBackend {
            delay: Some(Duration::from_millis(50)),
            ..RecordingBackend::default()
        });
        let gateway = EnforcementGateway::new(backend.clone());
        let target = ip("203.0.113.9");

        let (a, b) = tokio::join!(gateway.block(target), gateway.block(target));
        let mut outcomes = vec![a, b];
        outcomes.sort_by_key(|o| matches!(o, BlockOutcome::AlreadyBlocked));

        assert_eq!(outcomes, vec![BlockOutcome::Blocked, BlockOutcome::AlreadyBlocked]);
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_adopt_allows_unblock() {
        let backend = Arc::new(RecordingBackend::default());
        let gateway = EnforcementGateway::new(backend.clone());

        assert!(gateway.adopt(ip("203.0.113.5")));
        assert!(!gateway.adopt(ip("203.0.113.5")));
        assert_eq!(gateway.unblock(ip("203.0.113.5")).await, UnblockOutcome::Unblocked);
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_backend() {
        let backend = Arc::new(DryRunBackend::new());
        let gateway = EnforcementGateway::new(backend.clone());

        assert_eq!(gateway.block(ip("2001:db8::1")).await, BlockOutcome::Blocked);
        assert_eq!(backend.commands_issued(), 2);
        assert_eq!(gateway.backend_name(), "dry-run");
    }

    #[test]
    fn test_iptables_commands() {
        let plain = IptablesBackend::new(false, Duration::from_secs(1));
        let (program, args) = plain.command("-A", ip("203.0.113.5"), Direction::Inbound);
        assert_eq!(program, "iptables");
        assert_eq!(args, vec!["-A", "INPUT", "-s", "203.0.113.5", "-j", "DROP"]);

        let sudo = IptablesBackend::new(true, Duration::from_secs(1));
        let (program, args) = sudo.command("-D", ip("2001:db8::1"), Direction::Outbound);
        assert_eq!(program, "sudo");
        assert_eq!(args, vec!["ip6tables", "-D", "OUTPUT", "-d", "2001:db8::1", "-j", "DROP"]);
    }

    #[test]
    fn test_netsh_rule_name() {
        let backend = NetshBackend::new("NGFW_Block", Duration::from_secs(1));
        assert_eq!(
            backend.rule_name(ip("203.0.113.5"), Direction::Inbound),
            "NGFW_Block_203_0_113_5_IN"
        );
        assert_eq!(
            backend.rule_name(ip("2001:db8::1"), Direction::Outbound),
            "NGFW_Block_2001_db8__1_OUT"
        );
    }

    #[test]
    fn test_backend_from_config() {
        let config = FirewallConfig {
            backend: BackendKind::DryRun,
            ..FirewallConfig::default()
        };
        assert_eq!(backend_from_config(&config).name(), "dry-run");

        let config = FirewallConfig {
            backend: BackendKind::Netsh,
            ..FirewallConfig::default()
        };
        assert_eq!(backend_from_config(&config).name(), "netsh");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_errors() {
        let err = run_command("sleep", &["5".to_string()], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, FirewallError::Timeout { .. }));

        let err = run_command("false", &[], Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, FirewallError::CommandFailed { .. }));

        let err = run_command("ngfw-no-such-binary", &[], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, FirewallError::Spawn { .. }));

        assert!(run_command("true", &[], Duration::from_secs(5)).await.is_ok());
    }
}
