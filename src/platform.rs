//! Platform tables: uname classification, default directory conventions,
//! package repository URL templating.
//!
//! These are fixed lookup tables, not detection logic — the probe reply tells
//! us what the remote host is, this module tells us what that implies.

use serde::{Deserialize, Serialize};

/// Coarse platform family as reported by `uname` on the probed host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlatformFamily {
    SunOs,
    Linux,
    Cygwin,
    Windows,
    #[default]
    Unknown,
}

impl PlatformFamily {
    /// Classify a raw `uname` string (ex: "Linux", "CYGWIN_NT-10.0", "SunOS").
    pub fn from_uname(uname: &str) -> Self {
        let u = uname.trim();
        if u.starts_with("SunOS") {
            PlatformFamily::SunOs
        } else if u.starts_with("CYGWIN") {
            PlatformFamily::Cygwin
        } else if u.starts_with("Windows") || u.starts_with("MINGW") {
            PlatformFamily::Windows
        } else if u.starts_with("Linux") {
            PlatformFamily::Linux
        } else {
            PlatformFamily::Unknown
        }
    }

    pub fn is_windows_like(self) -> bool {
        matches!(self, PlatformFamily::Cygwin | PlatformFamily::Windows)
    }
}

/// Default (install dir, data dir) conventions per platform family.
/// Unknown hosts get the POSIX layout.
pub fn default_dirs(family: PlatformFamily) -> (&'static str, &'static str) {
    if family.is_windows_like() {
        (
            "C:\\Program Files\\Cluster\\",
            "C:\\ProgramData\\Cluster\\data\\",
        )
    } else {
        ("/usr/local/bin/", "/var/lib/cluster-data/")
    }
}

const REPO_RPM_BASE: &str = "https://repo.example.com/get/cluster-community-release";
const REPO_APT_BOOTSTRAP: &str = "https://repo.example.com/apt/cluster-apt-config_all.deb";

/// Derive the download URL for the platform package from OS flavor + major
/// version. Pure string templating; Debian/Ubuntu share one fixed APT
/// bootstrap package.
pub fn repo_url(os_flavor: &str, os_major_version: &str) -> String {
    match os_flavor.trim().to_lowercase().as_str() {
        "fedora" => format!("{REPO_RPM_BASE}-fc{os_major_version}.rpm"),
        "sles" | "suse" | "opensuse" => format!("{REPO_RPM_BASE}-sles{os_major_version}.rpm"),
        "debian" | "ubuntu" => REPO_APT_BOOTSTRAP.to_string(),
        // el covers rhel, centos, ol and anything else rpm-ish
        _ => format!("{REPO_RPM_BASE}-el{os_major_version}.rpm"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uname_classification() {
        assert_eq!(PlatformFamily::from_uname("Linux"), PlatformFamily::Linux);
        assert_eq!(PlatformFamily::from_uname("SunOS"), PlatformFamily::SunOs);
        assert_eq!(
            PlatformFamily::from_uname("CYGWIN_NT-10.0"),
            PlatformFamily::Cygwin
        );
        assert_eq!(PlatformFamily::from_uname("BeOS"), PlatformFamily::Unknown);
    }

    #[test]
    fn test_default_dirs() {
        let (install, data) = default_dirs(PlatformFamily::Linux);
        assert!(install.starts_with('/'));
        assert!(data.starts_with('/'));
        let (install, _) = default_dirs(PlatformFamily::Cygwin);
        assert!(install.starts_with("C:\\"));
        // unknown falls back to posix conventions
        assert_eq!(
            default_dirs(PlatformFamily::Unknown),
            default_dirs(PlatformFamily::Linux)
        );
    }

    #[test]
    fn test_repo_url_templating() {
        assert!(repo_url("rhel", "9").ends_with("-el9.rpm"));
        assert!(repo_url("fedora", "38").ends_with("-fc38.rpm"));
        assert!(repo_url("sles", "15").ends_with("-sles15.rpm"));
        assert_eq!(repo_url("ubuntu", "22"), repo_url("debian", "12"));
    }
}
