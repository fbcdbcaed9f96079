//! Target architectures.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// The closed set of architectures images can be built for.
///
/// The string form uses the canonical Linux names. [`Arch::from_alias`]
/// additionally accepts the common container-ecosystem aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Arch {
    #[serde(rename = "aarch64")]
    Aarch64,
    #[serde(rename = "ppc64le")]
    Ppc64le,
    #[serde(rename = "s390x")]
    S390x,
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "riscv64")]
    Riscv64,
}

impl Arch {
    pub fn as_str(self) -> &'static str {
        match self {
            Arch::Aarch64 => "aarch64",
            Arch::Ppc64le => "ppc64le",
            Arch::S390x => "s390x",
            Arch::X86_64 => "x86_64",
            Arch::Riscv64 => "riscv64",
        }
    }

    /// Parse an architecture name, also accepting `amd64` and `arm64`.
    pub fn from_alias(name: &str) -> Result<Self, Error> {
        match name {
            "amd64" => Ok(Arch::X86_64),
            "arm64" => Ok(Arch::Aarch64),
            other => other.parse(),
        }
    }
}

impl Default for Arch {
    fn default() -> Self {
        Arch::X86_64
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aarch64" => Ok(Arch::Aarch64),
            "ppc64le" => Ok(Arch::Ppc64le),
            "s390x" => Ok(Arch::S390x),
            "x86_64" => Ok(Arch::X86_64),
            "riscv64" => Ok(Arch::Riscv64),
            other => bail!("unsupported architecture: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_round_trip() {
        for arch in [
            Arch::Aarch64,
            Arch::Ppc64le,
            Arch::S390x,
            Arch::X86_64,
            Arch::Riscv64,
        ] {
            assert_eq!(arch.as_str().parse::<Arch>().unwrap(), arch);
        }
    }

    #[test]
    fn test_arch_aliases() {
        assert_eq!(Arch::from_alias("amd64").unwrap(), Arch::X86_64);
        assert_eq!(Arch::from_alias("arm64").unwrap(), Arch::Aarch64);
        assert_eq!(Arch::from_alias("s390x").unwrap(), Arch::S390x);
        assert!(Arch::from_alias("i686").is_err());
        assert!("amd64".parse::<Arch>().is_err());
    }
}
