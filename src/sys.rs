//! Host checks and process-wide helpers
//!
//! Provides:
//! - Startup requirement checks (setuid root, non-root caller, IP forwarding)
//! - Permanent privilege drop
//! - Login shell discovery and the recorded shell's environment
//! - Storage folder preparation
//! - First configured nameserver lookup

use crate::error::{Error, Result};
use nix::unistd::{self, Gid, Uid, User};
use std::ffi::{CString, OsStr, OsString};
use std::fs;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";
const RESOLV_CONF: &str = "/etc/resolv.conf";
const DEFAULT_SHELL: &str = "/bin/sh";
const SHELL_PREFIX_VAR: &str = "MAHIMAHI_SHELL_PREFIX";

/// Verify the process was started the way the recorder requires
///
/// The checks run in order and the first violation is fatal:
/// argv[0] present, standard descriptors open, effective uid root,
/// real ids not root, IPv4 forwarding enabled.
pub fn check_requirements(argv0: Option<&str>) -> Result<()> {
    let program = argv0.ok_or_else(|| Error::Usage("missing argv[0]".to_string()))?;

    // If stdin/stdout/stderr were closed, /dev/null would take one of their slots
    let devnull = fs::File::open("/dev/null")?;
    if devnull.as_raw_fd() <= 2 {
        return Err(Error::Environment(format!(
            "{}: standard file descriptors must be open",
            program
        )));
    }

    check_ids(
        program,
        unistd::geteuid(),
        unistd::getuid(),
        unistd::getgid(),
    )?;

    check_ip_forward(program, Path::new(IP_FORWARD))
}

/// The binary must be setuid root but invoked by a regular user
fn check_ids(program: &str, euid: Uid, ruid: Uid, rgid: Gid) -> Result<()> {
    if !euid.is_root() {
        return Err(Error::Privilege(format!(
            "{}: needs to be installed setuid root",
            program
        )));
    }

    if ruid.is_root() || rgid.as_raw() == 0 {
        return Err(Error::Privilege(format!("{}: please run as non-root", program)));
    }

    Ok(())
}

fn check_ip_forward(program: &str, path: &Path) -> Result<()> {
    let value = fs::read_to_string(path).map_err(|e| {
        Error::Environment(format!("{}: cannot read {}: {}", program, path.display(), e))
    })?;

    if value.trim_end() != "1" {
        return Err(Error::Environment(format!(
            "{}: Please run \"sudo sysctl -w net.ipv4.ip_forward=1\" to enable IP forwarding",
            program
        )));
    }

    Ok(())
}

/// Permanently drop root privileges back to the invoking user
///
/// Clears supplementary groups, sets real, effective and saved ids to the
/// real ids, then verifies the old effective ids can no longer be regained.
pub fn drop_privileges() -> Result<()> {
    let real_gid = unistd::getgid();
    let eff_gid = unistd::getegid();
    let real_uid = unistd::getuid();
    let eff_uid = unistd::geteuid();

    // Eliminate ancillary groups
    if eff_uid.is_root() {
        unistd::setgroups(&[real_gid]).map_err(|e| Error::privileged("setgroups", e))?;
    }

    if real_gid != eff_gid {
        unistd::setresgid(real_gid, real_gid, real_gid)
            .map_err(|e| Error::privileged("setresgid", e))?;
    }

    if real_uid != eff_uid {
        unistd::setresuid(real_uid, real_uid, real_uid)
            .map_err(|e| Error::privileged("setresuid", e))?;
    }

    if real_gid != eff_gid && (unistd::setegid(eff_gid).is_ok() || unistd::getegid() != real_gid)
    {
        return Err(Error::Privilege("drop_privileges: dropping gid failed".to_string()));
    }

    if real_uid != eff_uid && (unistd::seteuid(eff_uid).is_ok() || unistd::geteuid() != real_uid)
    {
        return Err(Error::Privilege("drop_privileges: dropping uid failed".to_string()));
    }

    debug!(uid = real_uid.as_raw(), gid = real_gid.as_raw(), "Dropped privileges");
    Ok(())
}

/// Login shell of the real user
pub fn shell_path() -> Result<PathBuf> {
    let uid = unistd::getuid();
    let user = User::from_uid(uid)
        .map_err(|e| Error::privileged("getpwuid", e))?
        .ok_or_else(|| Error::Environment(format!("getpwuid: no passwd entry for uid {}", uid)))?;

    Ok(login_shell(&user.shell))
}

/// An empty passwd shell means the Bourne shell
fn login_shell(shell: &Path) -> PathBuf {
    if shell.as_os_str().is_empty() {
        PathBuf::from(DEFAULT_SHELL)
    } else {
        shell.to_path_buf()
    }
}

/// Make sure the folder for recorded content exists
///
/// A missing folder is created with full access for the owning group (the
/// invoking user's group), so the unprivileged recorder can write into it.
pub fn check_storage_folder(folder: &Path) -> Result<PathBuf> {
    match fs::metadata(folder) {
        Ok(meta) if meta.is_dir() => {
            debug!(folder = %folder.display(), "Storage folder exists");
        }
        Ok(_) => {
            return Err(Error::Usage(format!(
                "{} exists and is not a directory",
                folder.display()
            )));
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            fs::create_dir(folder)?;
            // Applied explicitly so the umask cannot strip group write
            fs::set_permissions(folder, fs::Permissions::from_mode(0o070))?;
            unistd::chown(folder, None, Some(unistd::getgid()))?;
            info!(folder = %folder.display(), "Created storage folder");
        }
        Err(e) => return Err(e.into()),
    }

    Ok(folder.to_path_buf())
}

/// First nameserver configured in resolv.conf
pub fn first_nameserver() -> Result<SocketAddrV4> {
    let content = fs::read_to_string(RESOLV_CONF).map_err(|e| {
        Error::Config(format!("cannot read {}: {}", RESOLV_CONF, e))
    })?;

    parse_nameserver(&content)
        .ok_or_else(|| Error::Config(format!("no IPv4 nameserver configured in {}", RESOLV_CONF)))
}

fn parse_nameserver(content: &str) -> Option<SocketAddrV4> {
    content
        .lines()
        .map(|line| line.split(['#', ';']).next().unwrap_or(""))
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            match words.next() {
                Some("nameserver") => words.next()?.parse::<Ipv4Addr>().ok(),
                _ => None,
            }
        })
        .map(|ip| SocketAddrV4::new(ip, 53))
        .next()
}

/// Snapshot of the caller's environment
///
/// The snapshot is taken once at startup. Privileged helpers are run with an
/// empty environment; only the recorded shell gets this snapshot back.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: Vec<(OsString, OsString)>,
}

impl Environment {
    /// Capture the current process environment
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars_os().collect(),
        }
    }

    /// Look up a variable
    pub fn get(&self, key: &str) -> Option<&OsStr> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_os_str())
    }

    /// Set a variable, replacing an existing value
    pub fn set(&mut self, key: &str, value: impl Into<OsString>) {
        let value = value.into();
        match self.vars.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.vars.push((key.into(), value)),
        }
    }

    /// Tag bash-like shells: extend `MAHIMAHI_SHELL_PREFIX` and splice it into the prompt
    pub fn with_shell_prefix(mut self, prefix: &str) -> Self {
        let mut value = self.get(SHELL_PREFIX_VAR).map(OsStr::to_os_string).unwrap_or_default();
        value.push(prefix);

        self.set(SHELL_PREFIX_VAR, value);
        self.set(
            "PROMPT_COMMAND",
            "PS1=\"$MAHIMAHI_SHELL_PREFIX$PS1\" PROMPT_COMMAND=",
        );
        self
    }

    /// `KEY=value` strings for execve(2)
    pub fn to_cstrings(&self) -> Result<Vec<CString>> {
        self.vars
            .iter()
            .map(|(k, v)| {
                let mut entry = k.as_bytes().to_vec();
                entry.push(b'=');
                entry.extend_from_slice(v.as_bytes());
                CString::new(entry).map_err(|e| Error::Environment(format!("invalid environment entry: {}", e)))
            })
            .collect()
    }
}
