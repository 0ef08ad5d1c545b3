use super::cloud_config;
use super::types::{Identity, InstanceId, NetworkSpec, PackageSet, SeedFile};
use super::vfat::{MAX_SEED_BYTES, build_vfat};
use scratchvm_shared::errors::{ScratchError, ScratchResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Everything the guest's first-boot agent needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigBundle {
    pub instance_id: InstanceId,
    pub identity: Identity,
    pub packages: PackageSet,
    pub network: NetworkSpec,
    /// Executed once after first boot, in order.
    pub run_commands: Vec<String>,
    /// Written before `run_commands` execute.
    pub files: Vec<SeedFile>,
}

impl ConfigBundle {
    /// Validate inputs and assemble a bundle.
    ///
    /// Rejects an identity that could never log in: no SSH key and no
    /// password hash.
    pub fn build(
        instance_id: InstanceId,
        identity: Identity,
        packages: PackageSet,
        network: NetworkSpec,
        run_commands: Vec<String>,
    ) -> ScratchResult<Self> {
        if identity.hostname.trim().is_empty() {
            return Err(ScratchError::Validation("hostname must not be empty".into()));
        }
        if identity.user.trim().is_empty() {
            return Err(ScratchError::Validation("user must not be empty".into()));
        }
        if !identity.has_auth_method() {
            return Err(ScratchError::Validation(format!(
                "user '{}' has neither an SSH key nor a password",
                identity.user
            )));
        }
        if network.interface.trim().is_empty() {
            return Err(ScratchError::Validation(
                "network interface must not be empty".into(),
            ));
        }

        Ok(Self {
            instance_id,
            identity,
            packages,
            network,
            run_commands,
            files: Vec::new(),
        })
    }

    /// Attach a file to be written on first boot.
    pub fn with_file(mut self, file: SeedFile) -> ScratchResult<Self> {
        if !file.path.starts_with('/') {
            return Err(ScratchError::Validation(format!(
                "seed file path must be absolute: {}",
                file.path
            )));
        }
        if self.files.iter().any(|f| f.path == file.path) {
            return Err(ScratchError::Validation(format!(
                "seed file {} given twice",
                file.path
            )));
        }
        self.files.push(file);
        Ok(self)
    }

    /// Render the three NoCloud documents and pack them into a `cidata`
    /// volume. Equal bundles produce equal bytes.
    pub fn serialize(&self) -> ScratchResult<SeedArtifact> {
        let meta_data = cloud_config::meta_data(self)?;
        let user_data = cloud_config::user_data(self)?;
        let network_config = cloud_config::network_config(self)?;

        let total = meta_data.len() + user_data.len() + network_config.len();
        if total > MAX_SEED_BYTES {
            return Err(ScratchError::Validation(format!(
                "first-boot configuration is {} bytes, limit is {}",
                total, MAX_SEED_BYTES
            )));
        }

        let bytes = build_vfat(
            volume_id(&self.instance_id),
            &[
                ("meta-data", meta_data.as_bytes()),
                ("user-data", user_data.as_bytes()),
                ("network-config", network_config.as_bytes()),
            ],
        )
        .map_err(|e| ScratchError::Internal(format!("failed to create cidata volume: {}", e)))?;

        Ok(SeedArtifact {
            instance_id: self.instance_id.clone(),
            user_data,
            bytes,
        })
    }
}

fn volume_id(instance_id: &InstanceId) -> u32 {
    let digest = Sha256::digest(instance_id.as_str().as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// A serialized seed volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedArtifact {
    pub instance_id: InstanceId,
    /// Rendered `user-data`, kept for inspection.
    pub user_data: String,
    pub bytes: Vec<u8>,
}

impl SeedArtifact {
    /// Write the volume to `path`.
    ///
    /// Returns `false` when the file already holds exactly these bytes and
    /// was left untouched.
    pub fn write_to(&self, path: &Path) -> ScratchResult<bool> {
        if let Ok(existing) = std::fs::read(path)
            && existing == self.bytes
        {
            tracing::debug!(path = %path.display(), "Seed volume unchanged");
            return Ok(false);
        }

        let dir = path.parent().ok_or_else(|| {
            ScratchError::Storage(format!("seed path has no parent: {}", path.display()))
        })?;
        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
            ScratchError::Storage(format!(
                "Failed to create temp file in {}: {}",
                dir.display(),
                e
            ))
        })?;
        std::io::Write::write_all(&mut temp, &self.bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| {
            ScratchError::Storage(format!(
                "Failed to write seed volume {}: {}",
                path.display(),
                e.error
            ))
        })?;

        tracing::debug!(path = %path.display(), bytes = self.bytes.len(), "Wrote seed volume");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed::AddressPolicy;
    use fatfs::{FileSystem, FsOptions};
    use proptest::prelude::*;
    use std::io::{Cursor, Read};

    fn identity(keys: Vec<String>, password_hash: Option<String>) -> Identity {
        Identity {
            hostname: "scratch".into(),
            user: "dev".into(),
            shell: "/bin/bash".into(),
            ssh_authorized_keys: keys,
            password_hash,
            sudo: true,
        }
    }

    fn bundle() -> ConfigBundle {
        ConfigBundle::build(
            InstanceId::for_instance("scratch"),
            identity(vec!["ssh-ed25519 AAAAC3Nza dev@host".into()], None),
            PackageSet::new(vec!["docker.io".into()]),
            NetworkSpec::dhcp("ens3"),
            vec!["systemctl enable --now docker".into(), "echo done".into()],
        )
        .unwrap()
    }

    fn read_file(bytes: &[u8], name: &str) -> String {
        let mut cursor = Cursor::new(bytes.to_vec());
        let fs = FileSystem::new(&mut cursor, FsOptions::new()).unwrap();
        let mut text = String::new();
        fs.root_dir()
            .open_file(name)
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        text
    }

    #[test]
    fn test_build_rejects_missing_auth() {
        let err = ConfigBundle::build(
            InstanceId::for_instance("scratch"),
            identity(vec!["   ".into()], Some(String::new())),
            PackageSet::default(),
            NetworkSpec::dhcp("ens3"),
            Vec::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[test]
    fn test_build_accepts_password_only() {
        let bundle = ConfigBundle::build(
            InstanceId::for_instance("scratch"),
            identity(Vec::new(), Some("$6$salt$hash".into())),
            PackageSet::default(),
            NetworkSpec::dhcp("ens3"),
            Vec::new(),
        )
        .unwrap();
        let user_data = bundle.serialize().unwrap().user_data;
        assert!(user_data.contains("ssh_pwauth: true"));
        assert!(user_data.contains("lock_passwd: false"));
    }

    #[test]
    fn test_build_rejects_empty_hostname() {
        let mut id = identity(vec!["ssh-ed25519 AAAA".into()], None);
        id.hostname = String::new();
        let err = ConfigBundle::build(
            InstanceId::for_instance("scratch"),
            id,
            PackageSet::default(),
            NetworkSpec::dhcp("ens3"),
            Vec::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[test]
    fn test_user_data_layout() {
        let bundle = bundle()
            .with_file(SeedFile::new("/etc/scratchvm/bridge.rules", "*filter\nCOMMIT\n"))
            .unwrap();
        let user_data = bundle.serialize().unwrap().user_data;

        assert!(user_data.starts_with("#cloud-config\n"));
        assert!(user_data.contains("hostname: scratch"));
        assert!(user_data.contains("- ssh-ed25519 AAAAC3Nza dev@host"));
        assert!(user_data.contains("- docker.io"));
        assert!(user_data.contains("path: /etc/scratchvm/bridge.rules"));

        let first = user_data.find("systemctl enable --now docker").unwrap();
        let second = user_data.find("echo done").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_with_file_rejects_duplicates_and_relative_paths() {
        let bundle = bundle()
            .with_file(SeedFile::new("/etc/a", "a"))
            .unwrap();
        assert!(bundle.clone().with_file(SeedFile::new("/etc/a", "b")).is_err());
        assert!(bundle.with_file(SeedFile::new("etc/b", "b")).is_err());
    }

    #[test]
    fn test_volume_contains_documents() {
        let artifact = bundle().serialize().unwrap();

        let meta = read_file(&artifact.bytes, "meta-data");
        assert!(meta.contains(&format!("instance-id: {}", artifact.instance_id)));
        assert!(meta.contains("local-hostname: scratch"));

        let network = read_file(&artifact.bytes, "network-config");
        assert!(network.contains("version: 2"));
        assert!(network.contains("ens3:"));
        assert!(network.contains("dhcp4: true"));

        assert_eq!(read_file(&artifact.bytes, "user-data"), artifact.user_data);
    }

    #[test]
    fn test_static_network_config() {
        let mut bundle = bundle();
        bundle.network.policy = AddressPolicy::Static {
            address: "10.0.2.15/24".parse().unwrap(),
            gateway: "10.0.2.2".parse().unwrap(),
            nameservers: vec!["10.0.2.3".parse().unwrap()],
        };
        let artifact = bundle.serialize().unwrap();
        let network = read_file(&artifact.bytes, "network-config");
        assert!(network.contains("dhcp4: false"));
        assert!(network.contains("10.0.2.15/24"));
        assert!(network.contains("via: 10.0.2.2"));
        assert!(network.contains("10.0.2.3"));
    }

    #[test]
    fn test_oversized_bundle_is_rejected() {
        let mut bundle = bundle();
        bundle.run_commands = vec!["x".repeat(MAX_SEED_BYTES)];
        assert_eq!(bundle.serialize().unwrap_err().kind(), "ValidationError");
    }

    #[test]
    fn test_write_to_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.img");
        let artifact = bundle().serialize().unwrap();

        assert!(artifact.write_to(&path).unwrap());
        assert!(!artifact.write_to(&path).unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), artifact.bytes);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_build_requires_auth(
            keys in proptest::collection::vec("[ \t]{0,3}|ssh-ed25519 [A-Za-z0-9]{4,16}", 0..3),
            password in proptest::option::of("[ ]{0,2}|\\$6\\$[a-z]{4}"),
        ) {
            let candidate = identity(keys, password);
            let expected_ok = candidate.has_auth_method();
            let result = ConfigBundle::build(
                InstanceId::for_instance("p"),
                candidate,
                PackageSet::default(),
                NetworkSpec::dhcp("ens3"),
                Vec::new(),
            );
            prop_assert_eq!(result.is_ok(), expected_ok);
        }

        #[test]
        fn prop_serialize_is_deterministic(
            name in "[a-z][a-z0-9-]{0,20}",
            commands in proptest::collection::vec("[a-z ]{1,40}", 0..5),
        ) {
            let make = || {
                let mut id = identity(vec!["ssh-ed25519 AAAA".into()], None);
                id.hostname = name.clone();
                ConfigBundle::build(
                    InstanceId::for_instance(&name),
                    id,
                    PackageSet::new(vec!["docker.io".into()]),
                    NetworkSpec::dhcp("ens3"),
                    commands.clone(),
                )
                .unwrap()
                .serialize()
                .unwrap()
            };
            prop_assert_eq!(make().bytes, make().bytes);
        }
    }
}
