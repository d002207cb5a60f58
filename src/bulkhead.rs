//! Firewall rules for the recording namespace
//!
//! Uses iptables(8) in the `nat` table. Every rule is owned by a handle that
//! deletes it on drop, so the host is left as it was found however the
//! session ends.

use crate::error::{Error, Result};
use crate::network::tool;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Table holding every rule we install
const NAT_TABLE: &str = "nat";

/// One iptables rule
#[derive(Debug)]
pub struct IptablesRule {
    /// Absolute path of iptables(8)
    iptables: PathBuf,
    /// Chain in the nat table
    chain: &'static str,
    /// Match and target arguments
    spec: Vec<String>,
    /// Whether the rule is currently in the kernel
    installed: bool,
}

impl IptablesRule {
    /// Describe a rule without installing it
    pub fn new(iptables: &Path, chain: &'static str, spec: Vec<String>) -> Self {
        Self {
            iptables: iptables.to_path_buf(),
            chain,
            spec,
            installed: false,
        }
    }

    /// Arguments for appending (`-A`) or deleting (`-D`) this rule
    pub fn args(&self, action: &str) -> Vec<String> {
        let mut args: Vec<String> = ["-w", "-t", NAT_TABLE, action, self.chain]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(self.spec.iter().cloned());
        args
    }

    /// Append the rule to its chain
    pub fn install(&mut self) -> Result<()> {
        if self.installed {
            return Ok(());
        }

        let args = self.args("-A");
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        tool::run(&self.iptables, &args)?;

        self.installed = true;
        debug!(chain = self.chain, rule = %self.spec.join(" "), "Installed firewall rule");
        Ok(())
    }

    /// Delete the rule
    ///
    /// Idempotent: removing twice, or removing a rule someone else already
    /// flushed, succeeds.
    pub fn remove(&mut self) -> Result<()> {
        if !self.is_installed() {
            return Ok(());
        }

        let args = self.args("-D");
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = tool::output(&self.iptables, &args)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !is_missing_rule(&stderr) {
                return Err(Error::privileged(
                    tool::describe(&self.iptables, &args),
                    stderr.trim(),
                ));
            }
            debug!(chain = self.chain, "Firewall rule already gone");
        }

        self.installed = false;
        debug!(chain = self.chain, rule = %self.spec.join(" "), "Removed firewall rule");
        Ok(())
    }

    /// Check whether the rule is installed
    pub fn is_installed(&self) -> bool {
        self.installed
    }
}

impl Drop for IptablesRule {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!(chain = self.chain, error = %e, "Failed to remove firewall rule");
        }
    }
}

fn is_missing_rule(stderr: &str) -> bool {
    stderr.contains("does a matching rule exist") || stderr.contains("Bad rule")
}

/// Source NAT for traffic leaving the container
///
/// Connections from the ingress address are marked with the session mark on
/// the way in and masqueraded on the way out, so only this session's traffic
/// is rewritten.
#[derive(Debug)]
pub struct Nat {
    // Declared first so it is removed first
    masquerade: IptablesRule,
    mark: IptablesRule,
}

impl Nat {
    /// Install NAT for traffic sourced from `ingress`
    pub fn install(iptables: &Path, ingress: Ipv4Addr, session_mark: u32) -> Result<Self> {
        let (mark_spec, masquerade_spec) = nat_specs(ingress, session_mark);

        let mut mark = IptablesRule::new(iptables, "PREROUTING", mark_spec);
        mark.install()?;
        let mut masquerade = IptablesRule::new(iptables, "POSTROUTING", masquerade_spec);
        masquerade.install()?;

        Ok(Self { masquerade, mark })
    }

    /// Remove both rules
    pub fn remove(&mut self) -> Result<()> {
        self.masquerade.remove()?;
        self.mark.remove()
    }
}

fn nat_specs(ingress: Ipv4Addr, session_mark: u32) -> (Vec<String>, Vec<String>) {
    let mark = session_mark.to_string();
    let mark_spec = vec![
        "-s".to_string(),
        ingress.to_string(),
        "-j".to_string(),
        "CONNMARK".to_string(),
        "--set-mark".to_string(),
        mark.clone(),
    ];
    let masquerade_spec = vec![
        "-j".to_string(),
        "MASQUERADE".to_string(),
        "-m".to_string(),
        "connmark".to_string(),
        "--mark".to_string(),
        mark,
    ];
    (mark_spec, masquerade_spec)
}

/// Destination NAT steering the container's TCP into a local listener
///
/// Traffic addressed to the listener's own host is left alone, so the
/// container can still reach other services bound there.
#[derive(Debug)]
pub struct Dnat {
    rule: IptablesRule,
}

impl Dnat {
    /// Redirect TCP arriving on `device` to `listener`
    pub fn install(iptables: &Path, listener: SocketAddrV4, device: &str) -> Result<Self> {
        let mut rule = IptablesRule::new(iptables, "PREROUTING", dnat_spec(listener, device));
        rule.install()?;
        Ok(Self { rule })
    }

    /// Remove the rule
    pub fn remove(&mut self) -> Result<()> {
        self.rule.remove()
    }
}

fn dnat_spec(listener: SocketAddrV4, device: &str) -> Vec<String> {
    [
        "-p",
        "TCP",
        "-i",
        device,
        "!",
        "-d",
        &listener.ip().to_string(),
        "-j",
        "DNAT",
        "--to-destination",
        &listener.to_string(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    /// A stand-in for iptables(8): logs every call, and fails deletions
    /// with `delete_reply` when given
    fn fake_iptables(dir: &Path, delete_reply: Option<&str>) -> (PathBuf, PathBuf) {
        let log = dir.join("calls");
        let path = dir.join("iptables");
        let on_delete = match delete_reply {
            Some(reply) => format!("[ \"$4\" = -D ] && {{ echo '{}' >&2; exit 1; }}", reply),
            None => String::new(),
        };
        fs::write(
            &path,
            format!("#!/bin/sh\necho \"$@\" >> {}\n{}\nexit 0\n", log.display(), on_delete),
        )
        .unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        (path, log)
    }

    fn calls(log: &Path) -> Vec<String> {
        fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_rule_args() {
        let rule = IptablesRule::new(
            Path::new("/sbin/iptables"),
            "POSTROUTING",
            vec!["-j".into(), "MASQUERADE".into()],
        );
        assert_eq!(
            rule.args("-A"),
            vec!["-w", "-t", "nat", "-A", "POSTROUTING", "-j", "MASQUERADE"]
        );
    }

    #[test]
    fn test_nat_specs() {
        let (mark, masquerade) = nat_specs(Ipv4Addr::new(100, 64, 0, 2), 4242);
        assert_eq!(
            mark,
            vec!["-s", "100.64.0.2", "-j", "CONNMARK", "--set-mark", "4242"]
        );
        assert_eq!(
            masquerade,
            vec!["-j", "MASQUERADE", "-m", "connmark", "--mark", "4242"]
        );
    }

    #[test]
    fn test_dnat_spec() {
        let spec = dnat_spec("100.64.0.1:38123".parse().unwrap(), "veth-4242");
        assert_eq!(
            spec.join(" "),
            "-p TCP -i veth-4242 ! -d 100.64.0.1 -j DNAT --to-destination 100.64.0.1:38123"
        );
    }

    #[test]
    fn test_nat_install_and_drop() {
        let dir = tempfile::tempdir().unwrap();
        let (iptables, log) = fake_iptables(dir.path(), None);

        {
            let _nat = Nat::install(&iptables, Ipv4Addr::new(100, 64, 0, 2), 7).unwrap();
            assert_eq!(calls(&log).len(), 2);
        }

        let calls = calls(&log);
        assert_eq!(calls.len(), 4);
        assert!(calls[0].starts_with("-w -t nat -A PREROUTING -s 100.64.0.2"));
        assert!(calls[1].starts_with("-w -t nat -A POSTROUTING -j MASQUERADE"));
        // Removed in reverse order
        assert!(calls[2].starts_with("-w -t nat -D POSTROUTING"));
        assert!(calls[3].starts_with("-w -t nat -D PREROUTING"));
    }

    #[test]
    fn test_double_removal_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (iptables, log) = fake_iptables(dir.path(), None);

        let mut dnat =
            Dnat::install(&iptables, "100.64.0.1:8080".parse().unwrap(), "veth-7").unwrap();
        dnat.remove().unwrap();
        dnat.remove().unwrap();
        drop(dnat);

        let deletions = calls(&log).iter().filter(|c| c.contains(" -D ")).count();
        assert_eq!(deletions, 1);
    }

    #[test]
    fn test_removal_of_flushed_rule_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let (iptables, _log) = fake_iptables(
            dir.path(),
            Some("iptables: Bad rule (does a matching rule exist in that chain?)."),
        );

        let mut rule = IptablesRule::new(&iptables, "PREROUTING", vec!["-j".into(), "ACCEPT".into()]);
        rule.install().unwrap();
        assert!(rule.is_installed());
        rule.remove().unwrap();
        assert!(!rule.is_installed());
    }

    #[test]
    fn test_removal_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (iptables, _log) = fake_iptables(dir.path(), Some("iptables: Permission denied"));

        let mut rule = IptablesRule::new(&iptables, "PREROUTING", vec!["-j".into(), "ACCEPT".into()]);
        rule.install().unwrap();
        let err = rule.remove().unwrap_err();
        assert!(err.to_string().contains("Permission denied"));
        assert!(rule.is_installed());
    }

    #[test]
    fn test_failed_install_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls");
        let iptables = dir.path().join("iptables");
        // Accept the first rule, refuse the second
        fs::write(
            &iptables,
            format!(
                "#!/bin/sh\necho \"$@\" >> {log}\n[ \"$5\" = POSTROUTING ] && [ \"$4\" = -A ] && exit 1\nexit 0\n",
                log = log.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&iptables, fs::Permissions::from_mode(0o755)).unwrap();

        assert!(Nat::install(&iptables, Ipv4Addr::new(100, 64, 0, 2), 7).is_err());

        let calls = calls(&log);
        assert_eq!(calls.len(), 3);
        assert!(calls[2].starts_with("-w -t nat -D PREROUTING"));
    }
}
