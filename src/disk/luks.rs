//! LUKS2 encrypted containers.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::Payload;
use crate::datasizes::MIB;

/// Parameters for the argon2id key derivation function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Argon2id {
    pub iterations: u64,
    /// Memory cost in KiB.
    pub memory: u64,
    /// Degree of parallelism, i.e. number of threads.
    pub parallelism: u64,
}

/// Bind the device to a clevis policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClevisBind {
    pub pin: String,
    pub policy: String,
    /// Remove the passphrase at the end of the build.
    #[serde(default)]
    pub remove_passphrase: bool,
}

/// A LUKS2 encrypted volume wrapping another payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LuksContainer {
    pub passphrase: String,
    pub uuid: String,
    pub cipher: String,
    pub label: String,
    pub subsystem: String,
    pub sector_size: u64,
    pub pbkdf: Argon2id,
    pub clevis: Option<ClevisBind>,
    pub payload: Option<Box<Payload>>,
}

impl LuksContainer {
    /// Size of the LUKS2 header.
    pub fn metadata_size(&self) -> u64 {
        16 * MIB
    }
}

#[derive(Serialize, Deserialize, Default)]
struct LuksWire {
    #[serde(default)]
    passphrase: String,
    #[serde(default)]
    uuid: String,
    #[serde(default)]
    cipher: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    subsystem: String,
    #[serde(default, with = "crate::datasizes::bytes")]
    sector_size: u64,
    #[serde(default)]
    pbkdf: Argon2id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    clevis: Option<ClevisBind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
}

impl Serialize for LuksContainer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = LuksWire {
            passphrase: self.passphrase.clone(),
            uuid: self.uuid.clone(),
            cipher: self.cipher.clone(),
            label: self.label.clone(),
            subsystem: self.subsystem.clone(),
            sector_size: self.sector_size,
            pbkdf: self.pbkdf.clone(),
            clevis: self.clevis.clone(),
            payload_type: self.payload.as_ref().map(|p| p.payload_type().to_string()),
            payload: self.payload.as_ref().map(|p| p.to_wire_value()),
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LuksContainer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = LuksWire::deserialize(deserializer)?;
        let tag = wire.payload_type.unwrap_or_default();
        let payload = Payload::from_wire(&tag, wire.payload.unwrap_or(serde_json::Value::Null))
            .map_err(D::Error::custom)?;
        Ok(LuksContainer {
            passphrase: wire.passphrase,
            uuid: wire.uuid,
            cipher: wire.cipher,
            label: wire.label,
            subsystem: wire.subsystem,
            sector_size: wire.sector_size,
            pbkdf: wire.pbkdf,
            clevis: wire.clevis,
            payload: payload.map(Box::new),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{Filesystem, FilesystemType};

    #[test]
    fn test_luks_round_trip() {
        let luks = LuksContainer {
            label: "crypt_root".to_string(),
            cipher: "aes-xts-plain64".to_string(),
            pbkdf: Argon2id {
                iterations: 4,
                memory: 32,
                parallelism: 1,
            },
            clevis: Some(ClevisBind {
                pin: "tpm2".to_string(),
                policy: "{}".to_string(),
                remove_passphrase: true,
            }),
            payload: Some(Box::new(Payload::Filesystem(Filesystem {
                fs_type: FilesystemType::Xfs,
                mountpoint: "/".to_string(),
                ..Filesystem::default()
            }))),
            ..LuksContainer::default()
        };
        let json = serde_json::to_string(&luks).unwrap();
        let parsed: LuksContainer = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, luks);
    }

    #[test]
    fn test_luks_metadata_size() {
        assert_eq!(LuksContainer::default().metadata_size(), 16 * MIB);
    }
}
