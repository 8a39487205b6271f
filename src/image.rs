use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Console line printed by sysvinit once a legacy release reaches runlevel 2
pub const LEGACY_BOOT_SIGNATURE: &str = "INIT: Entering runlevel: 2";

/// Distribution banner printed above the login prompt on newer releases
pub const BANNER_BOOT_SIGNATURE: &str = "Debian GNU/Linux";

/// A bootstrapped disk image ready to be attached to a sandbox VM
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageDescriptor {
    /// Target architecture, e.g. `amd64`
    pub architecture: String,
    /// Target release, either a codename (`bullseye`) or a version (`11`)
    pub release: String,
    /// Disk image attached as the VM's hard disk
    pub medium: PathBuf,
}

impl ImageDescriptor {
    pub fn new(
        architecture: impl Into<String>,
        release: impl Into<String>,
        medium: impl Into<PathBuf>,
    ) -> Self {
        Self {
            architecture: architecture.into(),
            release: release.into(),
            medium: medium.into(),
        }
    }

    pub fn arch(&self) -> Result<Architecture> {
        self.architecture.parse()
    }

    pub fn codename(&self) -> Result<Codename> {
        self.release.parse()
    }

    /// Console text that marks the end of boot for this image's release
    pub fn termination_signature(&self) -> Result<&'static str> {
        Ok(self.codename()?.termination_signature())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86,
    Amd64,
}

impl Architecture {
    /// VirtualBox guest OS type for this architecture
    pub fn os_type(self) -> &'static str {
        match self {
            Architecture::X86 => "Debian",
            Architecture::Amd64 => "Debian_64",
        }
    }
}

impl FromStr for Architecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "x86" => Ok(Architecture::X86),
            "amd64" => Ok(Architecture::Amd64),
            other => Err(Error::UnsupportedArchitecture(other.to_string())),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Architecture::X86 => "x86",
            Architecture::Amd64 => "amd64",
        })
    }
}

/// Debian release codenames, oldest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Codename {
    Squeeze,
    Wheezy,
    Jessie,
    Stretch,
    Buster,
    Bullseye,
    Bookworm,
    Trixie,
    Sid,
}

const CODENAMES: &[(Codename, &str, Option<u32>)] = &[
    (Codename::Squeeze, "squeeze", Some(6)),
    (Codename::Wheezy, "wheezy", Some(7)),
    (Codename::Jessie, "jessie", Some(8)),
    (Codename::Stretch, "stretch", Some(9)),
    (Codename::Buster, "buster", Some(10)),
    (Codename::Bullseye, "bullseye", Some(11)),
    (Codename::Bookworm, "bookworm", Some(12)),
    (Codename::Trixie, "trixie", Some(13)),
    (Codename::Sid, "sid", None),
];

impl Codename {
    pub fn as_str(self) -> &'static str {
        match self {
            Codename::Squeeze => "squeeze",
            Codename::Wheezy => "wheezy",
            Codename::Jessie => "jessie",
            Codename::Stretch => "stretch",
            Codename::Buster => "buster",
            Codename::Bullseye => "bullseye",
            Codename::Bookworm => "bookworm",
            Codename::Trixie => "trixie",
            Codename::Sid => "sid",
        }
    }

    /// Releases that still boot with sysvinit and print a runlevel message
    pub fn is_sysvinit(self) -> bool {
        matches!(self, Codename::Squeeze | Codename::Wheezy)
    }

    pub fn termination_signature(self) -> &'static str {
        if self.is_sysvinit() {
            LEGACY_BOOT_SIGNATURE
        } else {
            BANNER_BOOT_SIGNATURE
        }
    }
}

impl FromStr for Codename {
    type Err = Error;

    /// Accepts a codename, `unstable`, or a version such as `8` or `8.2`.
    fn from_str(s: &str) -> Result<Self> {
        let release = s.trim().to_ascii_lowercase();
        if release == "unstable" {
            return Ok(Codename::Sid);
        }
        if let Some((codename, _, _)) = CODENAMES.iter().find(|(_, name, _)| *name == release) {
            return Ok(*codename);
        }
        let major = release
            .split('.')
            .next()
            .and_then(|m| m.parse::<u32>().ok());
        if let Some(major) = major {
            if let Some((codename, _, _)) =
                CODENAMES.iter().find(|(_, _, version)| *version == Some(major))
            {
                return Ok(*codename);
            }
        }
        Err(Error::UnsupportedRelease(s.to_string()))
    }
}

impl fmt::Display for Codename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
