//! Hardware probe: the one genuinely asynchronous interaction in the
//! configurator.
//!
//! A probe runs the configured command template against a host and parses
//! the JSON reply (ram, cores, uname, directories, network identity). Each
//! request carries the host's bumped generation token; a reply is applied
//! only if no newer request was issued in the meantime, which is the sole
//! ordering/cancellation mechanism. Failures are recorded on the host record
//! and degrade to unknown-platform defaults — they never abort anything.

use crate::config::ProbeConf;
use crate::models::{ProbeStatus, RecordId};
use crate::params::{self, DataMemoryLimits};
use crate::platform::{self, PlatformFamily};
use crate::store::{DeploymentStore, StoreError};
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("no probe command configured")]
    NotConfigured,
    #[error("host {0} not found")]
    UnknownHost(RecordId),
    #[error("probe command failed: {0}")]
    CommandFailed(String),
    #[error("probe timed out after {0}s")]
    TimedOut(u64),
    #[error("malformed probe reply: {0}")]
    BadReply(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Wire format of a probe reply. Numeric facts arrive as strings and are
/// parsed defensively; everything is optional.
#[derive(Debug, Default, Deserialize)]
pub struct ProbeReply {
    pub ram: Option<String>,
    pub cores: Option<String>,
    pub uname: Option<String>,
    pub installdir: Option<String>,
    pub datadir: Option<String>,
    pub diskfree: Option<String>,
    pub osflavor: Option<String>,
    pub osver: Option<String>,
    pub docker_info: Option<String>,
    /// Newline-delimited string or array of candidate addresses.
    pub intip: Option<serde_json::Value>,
    pub fqdn: Option<String>,
}

/// Defensive parse of the internal-ip field: candidates may arrive as an
/// array or newline-delimited, possibly with junk. Accept only if exactly
/// one entry parses as a non-loopback IP address.
pub fn parse_intip(raw: &serde_json::Value) -> Option<String> {
    let candidates: Vec<String> = match raw {
        serde_json::Value::String(s) => s.lines().map(|l| l.trim().to_string()).collect(),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .collect(),
        _ => return None,
    };
    let valid: Vec<String> = candidates
        .into_iter()
        .filter(|s| !s.is_empty())
        .filter(|s| match s.parse::<IpAddr>() {
            Ok(ip) => !ip.is_loopback(),
            Err(_) => false,
        })
        .collect();
    if valid.len() == 1 {
        valid.into_iter().next()
    } else {
        None
    }
}

fn parse_numeric<T: std::str::FromStr>(raw: &Option<String>) -> Option<T> {
    raw.as_deref().and_then(|s| s.trim().parse().ok())
}

/// Issue a probe for a host and apply the reply. Meant to be spawned; the
/// returned error is also recorded on the host record.
pub async fn run_probe(
    store: &DeploymentStore,
    probe_conf: &ProbeConf,
    limits: &DataMemoryLimits,
    host_id: RecordId,
) -> Result<(), ProbeError> {
    let template = probe_conf.command.clone().ok_or(ProbeError::NotConfigured)?;

    // Bump the generation token and mark the probe in flight.
    let (hostname, seq) = {
        let mut dep = store.lock();
        let host = dep.hosts.get_mut(host_id).ok_or(ProbeError::UnknownHost(host_id))?;
        host.probe_seq_issued += 1;
        host.probe_status = ProbeStatus::Pending;
        (host.name.clone(), host.probe_seq_issued)
    };

    debug!(host = %hostname, seq, "issuing hardware probe");
    let outcome = execute(&template, &hostname, probe_conf.timeout_secs).await;

    {
        let mut dep = store.lock();
        let Some(host) = dep.hosts.get_mut(host_id) else {
            return Err(ProbeError::UnknownHost(host_id));
        };
        // A newer probe superseded this one while it was in flight: drop the
        // reply, whatever it was.
        if host.probe_seq_issued != seq {
            debug!(host = %hostname, seq, newest = host.probe_seq_issued, "discarding stale probe reply");
            return Ok(());
        }
        match &outcome {
            Ok(reply) => {
                apply_reply(host, reply, seq);
                info!(host = %hostname, "probe reply applied");
            }
            Err(e) => {
                host.probe_status = ProbeStatus::Failed;
                host.err_msg = Some(e.to_string());
                // degrade to unknown-platform directory conventions
                let (install, data) = platform::default_dirs(PlatformFamily::Unknown);
                host.install_dir.set_default(install.to_string());
                host.data_dir.set_default(data.to_string());
                warn!(host = %hostname, "probe failed: {e}");
            }
        }
        params::derive_defaults(&mut dep, limits);
    }

    store.save().await?;
    outcome.map(|_| ())
}

fn apply_reply(host: &mut crate::models::Host, reply: &ProbeReply, seq: u64) {
    host.ram_mb = parse_numeric(&reply.ram);
    host.cores = parse_numeric(&reply.cores);
    if let Some(uname) = &reply.uname {
        host.platform = PlatformFamily::from_uname(uname);
    }
    host.os_flavor = reply.osflavor.clone();
    host.os_version = reply.osver.clone();
    host.diskfree = reply.diskfree.clone();
    host.docker_info = reply.docker_info.clone();
    host.fqdn = reply.fqdn.clone();
    host.internal_ip = reply.intip.as_ref().and_then(parse_intip);

    let (install_default, data_default) = platform::default_dirs(host.platform);
    let install = reply
        .installdir
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| install_default.to_string());
    let data = reply
        .datadir
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| data_default.to_string());
    host.install_dir.set_default(install);
    host.data_dir.set_default(data);

    host.probe_status = ProbeStatus::Ok;
    host.err_msg = None;
    host.probe_seq_applied = seq;
    host.last_probed = OffsetDateTime::now_utc().format(&Rfc3339).ok();
}

/// Run the probe command with the `{host}` placeholder substituted, under a
/// timeout, and parse its stdout as a reply.
async fn execute(template: &str, hostname: &str, timeout_secs: u64) -> Result<ProbeReply, ProbeError> {
    let argv: Vec<String> = shell_words::split(template)
        .map_err(|e| ProbeError::CommandFailed(format!("bad command template: {e}")))?
        .into_iter()
        .map(|arg| arg.replace("{host}", hostname))
        .collect();
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| ProbeError::CommandFailed("empty command template".into()))?;

    let output = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        tokio::process::Command::new(program).args(args).output(),
    )
    .await
    .map_err(|_| ProbeError::TimedOut(timeout_secs))?
    .map_err(|e| ProbeError::CommandFailed(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::CommandFailed(format!(
            "exit {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(serde_json::from_slice(&output.stdout)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Host;
    use serde_json::json;

    #[test]
    fn test_intip_single_candidate_accepted() {
        assert_eq!(
            parse_intip(&json!("192.168.1.10")),
            Some("192.168.1.10".to_string())
        );
        assert_eq!(
            parse_intip(&json!("garbage\n192.168.1.10\n\n")),
            Some("192.168.1.10".to_string())
        );
        assert_eq!(
            parse_intip(&json!(["fe80::1%eth0", "10.0.0.5"])),
            Some("10.0.0.5".to_string())
        );
    }

    #[test]
    fn test_intip_ambiguous_or_invalid_rejected() {
        // two valid candidates: ambiguous, reject
        assert_eq!(parse_intip(&json!("10.0.0.5\n10.0.0.6")), None);
        assert_eq!(parse_intip(&json!("not-an-ip")), None);
        assert_eq!(parse_intip(&json!("127.0.0.1")), None);
        assert_eq!(parse_intip(&json!(42)), None);
    }

    #[test]
    fn test_apply_reply_parses_numeric_strings() {
        let mut host = Host::new("alpha", false);
        let reply: ProbeReply = serde_json::from_value(json!({
            "ram": "16384",
            "cores": "8",
            "uname": "Linux",
            "intip": "10.1.2.3",
            "fqdn": "alpha.lan",
            "osflavor": "fedora",
            "osver": "38"
        }))
        .unwrap();
        apply_reply(&mut host, &reply, 1);
        assert_eq!(host.ram_mb, Some(16384));
        assert_eq!(host.cores, Some(8));
        assert_eq!(host.platform, PlatformFamily::Linux);
        assert_eq!(host.internal_ip.as_deref(), Some("10.1.2.3"));
        assert_eq!(host.probe_status, ProbeStatus::Ok);
        assert_eq!(host.probe_seq_applied, 1);
        // posix defaults filled in since the reply had no directories
        assert_eq!(host.install_dir.effective().map(String::as_str), Some("/usr/local/bin/"));
    }

    #[test]
    fn test_apply_reply_tolerates_junk_numbers() {
        let mut host = Host::new("alpha", false);
        let reply: ProbeReply =
            serde_json::from_value(json!({ "ram": "lots", "cores": "" })).unwrap();
        apply_reply(&mut host, &reply, 1);
        assert_eq!(host.ram_mb, None);
        assert_eq!(host.cores, None);
        assert_eq!(host.probe_status, ProbeStatus::Ok);
    }

    #[tokio::test]
    async fn test_stale_reply_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeploymentStore::new(dir.path().join("dep.json"));
        let host_id = {
            let mut dep = store.lock();
            dep.add_host("alpha", false)
        };
        // the command answers slowly enough that a newer request can be
        // issued while this one is in flight
        let conf = ProbeConf {
            command: Some("sh -c 'sleep 1; echo {}'".into()),
            timeout_secs: 5,
        };
        let task = {
            let store = store.clone();
            let conf = conf.clone();
            tokio::spawn(async move {
                run_probe(&store, &conf, &DataMemoryLimits::default(), host_id).await
            })
        };
        // give the probe time to record its generation token, then supersede it
        tokio::time::sleep(Duration::from_millis(200)).await;
        {
            let mut dep = store.lock();
            dep.hosts.get_mut(host_id).unwrap().probe_seq_issued += 1;
        }
        task.await.unwrap().unwrap();
        let dep = store.lock();
        let host = dep.hosts.get(host_id).unwrap();
        // the stale reply must not have been applied
        assert_eq!(host.ram_mb, None);
        assert_eq!(host.probe_seq_applied, 0);
    }

    #[tokio::test]
    async fn test_failed_probe_sets_error_and_fallback_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeploymentStore::new(dir.path().join("dep.json"));
        let host_id = {
            let mut dep = store.lock();
            dep.add_host("alpha", false)
        };
        let conf = ProbeConf { command: Some("false".into()), timeout_secs: 5 };
        let result = run_probe(&store, &conf, &DataMemoryLimits::default(), host_id).await;
        assert!(result.is_err());
        let dep = store.lock();
        let host = dep.hosts.get(host_id).unwrap();
        assert_eq!(host.probe_status, ProbeStatus::Failed);
        assert!(host.err_msg.is_some());
        assert_eq!(host.install_dir.effective().map(String::as_str), Some("/usr/local/bin/"));
    }
}
