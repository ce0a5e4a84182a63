//! Cloud-init NoCloud seed images.
//!
//! A [`CloudInit`] renders `meta-data`, `user-data` and `network-config`
//! and packs them into an ISO9660 volume labelled `cidata`, which the guest
//! picks up when the image is attached as a read-only disk.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::{fs, io};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::{DiskConfig, parse_mac};
use crate::error::{Error, Result};
use crate::iso9660;

/// Volume label cloud-init looks for.
pub const VOLUME_LABEL: &str = "cidata";

/// Name the guest interface is given.
const INTERFACE: &str = "eth0";

/// Guest identity, network, and login for a NoCloud seed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudInit {
    /// Guest hostname.
    pub hostname: String,
    /// Instance id. Derived from hostname and MAC when unset.
    pub instance_id: Option<String>,
    /// MAC of the interface to configure.
    pub mac: String,
    /// Guest address with prefix length, e.g. `10.0.5.2/24`.
    pub cidr: String,
    /// Default gateway.
    pub gateway: String,
    /// Login user. Without one, keys go to the image's default user.
    pub username: Option<String>,
    /// crypt(3) password hash. Enables password SSH login.
    pub password_hash: Option<String>,
    /// Public keys authorised for the login user.
    pub ssh_authorized_keys: Vec<String>,
    /// DNS servers.
    pub nameservers: Vec<String>,
    /// Complete user-data document used verbatim instead of the rendered one.
    pub user_data: Option<String>,
}

impl CloudInit {
    /// Seed for `hostname` with a static address on the interface `mac`.
    pub fn new(
        hostname: impl Into<String>,
        mac: impl Into<String>,
        cidr: impl Into<String>,
        gateway: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            mac: mac.into(),
            cidr: cidr.into(),
            gateway: gateway.into(),
            ..Self::default()
        }
    }

    /// Sets the login user.
    #[must_use]
    pub fn user(mut self, name: impl Into<String>) -> Self {
        self.username = Some(name.into());
        self
    }

    /// Sets the login password hash.
    #[must_use]
    pub fn password_hash(mut self, hash: impl Into<String>) -> Self {
        self.password_hash = Some(hash.into());
        self
    }

    /// Authorises an SSH public key.
    #[must_use]
    pub fn ssh_key(mut self, key: impl Into<String>) -> Self {
        self.ssh_authorized_keys.push(key.into());
        self
    }

    /// Adds a DNS server.
    #[must_use]
    pub fn nameserver(mut self, addr: impl Into<String>) -> Self {
        self.nameservers.push(addr.into());
        self
    }

    /// The configured instance id, or `iid-` followed by 16 hex digits of
    /// SHA-256 over hostname and lower-cased MAC.
    pub fn instance_id(&self) -> String {
        if let Some(id) = &self.instance_id {
            return id.clone();
        }
        let mut hasher = Sha256::new();
        hasher.update(self.hostname.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.mac.to_ascii_lowercase().as_bytes());
        let digest = hasher.finalize();
        digest.as_slice()[..8].iter().fold(String::from("iid-"), |mut id, b| {
            let _ = write!(id, "{b:02x}");
            id
        })
    }

    /// Renders `meta-data`.
    pub fn meta_data(&self) -> Result<String> {
        yaml(&MetaData {
            instance_id: self.instance_id(),
            local_hostname: &self.hostname,
        })
    }

    /// Renders `user-data`: the raw override if set, else a `#cloud-config`
    /// document.
    pub fn user_data(&self) -> Result<String> {
        if let Some(raw) = &self.user_data {
            return Ok(raw.clone());
        }

        let keys: Vec<&str> = self.ssh_authorized_keys.iter().map(String::as_str).collect();
        let (users, default_keys) = match &self.username {
            Some(name) => (
                vec![User {
                    name,
                    sudo: "ALL=(ALL) NOPASSWD:ALL",
                    shell: "/bin/bash",
                    lock_passwd: self.password_hash.is_none(),
                    passwd: self.password_hash.as_deref(),
                    ssh_authorized_keys: keys,
                }],
                Vec::new(),
            ),
            None => (Vec::new(), keys),
        };
        let doc = yaml(&UserData {
            hostname: &self.hostname,
            manage_etc_hosts: true,
            users,
            ssh_authorized_keys: default_keys,
            ssh_pwauth: self.password_hash.is_some(),
        })?;
        Ok(format!("#cloud-config\n{doc}"))
    }

    /// Renders `network-config` (netplan v2).
    pub fn network_config(&self) -> Result<String> {
        let ethernet = Ethernet {
            matches: MacMatch {
                macaddress: self.mac.to_ascii_lowercase(),
            },
            set_name: INTERFACE,
            addresses: vec![&self.cidr],
            routes: vec![Route {
                to: "default",
                via: &self.gateway,
            }],
            nameservers: (!self.nameservers.is_empty()).then(|| Nameservers {
                addresses: self.nameservers.iter().map(String::as_str).collect(),
            }),
        };
        yaml(&NetworkDoc {
            version: 2,
            ethernets: BTreeMap::from([(INTERFACE, ethernet)]),
        })
    }

    /// Checks that every field renders to valid configuration.
    pub fn validate(&self) -> Result<()> {
        self.check().map_err(Error::DiskBuildFailed)
    }

    /// Renders the seed files into a scratch directory and packs them into
    /// an image at `dest`. Returns `dest`.
    pub fn build(&self, dest: impl AsRef<Path>) -> Result<PathBuf> {
        let dest = dest.as_ref();
        self.validate()?;
        let files = [
            ("meta-data", self.meta_data()?),
            ("user-data", self.user_data()?),
            ("network-config", self.network_config()?),
        ];
        let size = pack(&files, dest).map_err(Error::DiskBuildFailed)?;
        info!(path = %dest.display(), size, "built cloud-init seed");
        Ok(dest.to_path_buf())
    }

    /// Read-only disk entry attaching the image at `path`.
    pub fn disk_config(path: impl AsRef<Path>) -> DiskConfig {
        DiskConfig::new(path.as_ref().to_string_lossy()).readonly()
    }

    fn check(&self) -> io::Result<()> {
        if !is_hostname(&self.hostname) {
            return Err(bad(format!("invalid hostname {:?}", self.hostname)));
        }
        if parse_mac(&self.mac).is_none() {
            return Err(bad(format!("invalid MAC address {:?}", self.mac)));
        }
        if !is_cidr(&self.cidr) {
            return Err(bad(format!("invalid CIDR {:?}", self.cidr)));
        }
        if self.gateway.parse::<IpAddr>().is_err() {
            return Err(bad(format!("invalid gateway {:?}", self.gateway)));
        }
        if let Some(ns) = self.nameservers.iter().find(|ns| ns.parse::<IpAddr>().is_err()) {
            return Err(bad(format!("invalid nameserver {ns:?}")));
        }
        if let Some(name) = &self.username {
            let valid = name.chars().next().is_some_and(|c| c.is_ascii_lowercase() || c == '_')
                && name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
            if !valid {
                return Err(bad(format!("invalid user name {name:?}")));
            }
        }
        let multiline = self
            .password_hash
            .iter()
            .chain(&self.ssh_authorized_keys)
            .chain(&self.instance_id)
            .any(|s| s.contains(['\n', '\r']));
        if multiline {
            return Err(bad("credentials and instance id must be single-line"));
        }
        Ok(())
    }
}

fn bad(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.into())
}

/// RFC 1123 hostname: dot-separated labels of 1-63 alphanumerics or `-`.
fn is_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

fn is_cidr(cidr: &str) -> bool {
    let Some((addr, prefix)) = cidr.split_once('/') else {
        return false;
    };
    let Ok(prefix) = prefix.parse::<u8>() else {
        return false;
    };
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => prefix <= 32,
        Ok(IpAddr::V6(_)) => prefix <= 128,
        Err(_) => false,
    }
}

/// Stages `files` in a scratch directory and packs them into `dest`.
fn pack(files: &[(&str, String)], dest: &Path) -> io::Result<u64> {
    let staging = tempfile::Builder::new().prefix("chv-cidata-").tempdir()?;
    for (name, contents) in files {
        fs::write(staging.path().join(name), contents)?;
    }
    debug!(staging = %staging.path().display(), "rendered cloud-init files");
    iso9660::create_from_dir(staging.path(), VOLUME_LABEL, dest)
}

fn yaml(doc: &impl Serialize) -> Result<String> {
    serde_yaml::to_string(doc)
        .map_err(|e| Error::DiskBuildFailed(io::Error::new(io::ErrorKind::InvalidData, e)))
}

/// `meta-data` document.
#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct MetaData<'a> {
    instance_id: String,
    local_hostname: &'a str,
}

/// `#cloud-config` body.
#[derive(Serialize)]
struct UserData<'a> {
    hostname: &'a str,
    manage_etc_hosts: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    users: Vec<User<'a>>,
    /// Keys for the image's default user.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_authorized_keys: Vec<&'a str>,
    ssh_pwauth: bool,
}

#[derive(Serialize)]
struct User<'a> {
    name: &'a str,
    sudo: &'static str,
    shell: &'static str,
    lock_passwd: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    passwd: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_authorized_keys: Vec<&'a str>,
}

/// netplan v2 `network-config`.
#[derive(Serialize)]
struct NetworkDoc<'a> {
    version: u8,
    ethernets: BTreeMap<&'static str, Ethernet<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct Ethernet<'a> {
    #[serde(rename = "match")]
    matches: MacMatch,
    set_name: &'static str,
    addresses: Vec<&'a str>,
    routes: Vec<Route<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nameservers: Option<Nameservers<'a>>,
}

#[derive(Serialize)]
struct MacMatch {
    macaddress: String,
}

#[derive(Serialize)]
struct Route<'a> {
    to: &'static str,
    via: &'a str,
}

#[derive(Serialize)]
struct Nameservers<'a> {
    addresses: Vec<&'a str>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_yaml::Value;

    use super::*;
    use crate::iso9660::tests::{joliet_files, volume_label};

    const HASH: &str = "$6$2XC6sDcIdykdJMyp$j0IIMBPLavRisH.bkFbetP18R.a4IyKctUZ6.84Qw/6ADUMQ074Dp01VZIbYVPwe7SmaPEWmuQKM2UCp.I2At.";

    fn seed() -> CloudInit {
        CloudInit::new("microvm", "12:34:56:78:90:01", "10.0.5.2/24", "10.0.5.1")
            .user("chv")
            .password_hash(HASH)
            .ssh_key("ssh-ed25519 AAAAC3Nza chv@host")
            .nameserver("1.1.1.1")
    }

    fn parse(doc: &str) -> Value {
        serde_yaml::from_str(doc).unwrap()
    }

    #[test]
    fn instance_id_is_stable_and_mac_sensitive() {
        let a = seed();
        assert_eq!(a.instance_id(), seed().instance_id());
        assert!(a.instance_id().starts_with("iid-"));
        assert_eq!(a.instance_id().len(), 4 + 16);

        let mut b = seed();
        b.mac = "12:34:56:78:90:02".into();
        assert_ne!(a.instance_id(), b.instance_id());

        let mut upper = seed();
        upper.mac = upper.mac.to_ascii_uppercase();
        assert_eq!(a.instance_id(), upper.instance_id());
    }

    #[test]
    fn meta_data_names_instance_and_host() {
        let mut s = seed();
        s.instance_id = Some("i-0001".into());
        let meta = parse(&s.meta_data().unwrap());
        assert_eq!(meta["instance-id"], "i-0001");
        assert_eq!(meta["local-hostname"], "microvm");
    }

    #[test]
    fn network_config_matches_mac_and_routes_via_gateway() {
        let net = parse(&seed().network_config().unwrap());
        assert_eq!(net["version"], 2);
        let eth = &net["ethernets"]["eth0"];
        assert_eq!(eth["match"]["macaddress"], "12:34:56:78:90:01");
        assert_eq!(eth["set-name"], "eth0");
        assert_eq!(eth["addresses"][0], "10.0.5.2/24");
        assert_eq!(eth["routes"][0]["to"], "default");
        assert_eq!(eth["routes"][0]["via"], "10.0.5.1");
        assert_eq!(eth["nameservers"]["addresses"][0], "1.1.1.1");

        let bare = CloudInit::new("vm", "12:34:56:78:90:01", "10.0.5.2/24", "10.0.5.1");
        let net = parse(&bare.network_config().unwrap());
        assert!(net["ethernets"]["eth0"].get("nameservers").is_none());
    }

    #[test]
    fn user_data_with_password_unlocks_login() {
        let raw = seed().user_data().unwrap();
        assert!(raw.starts_with("#cloud-config\n"));
        let user = parse(&raw);
        let entry = &user["users"][0];
        assert_eq!(entry["name"], "chv");
        assert_eq!(entry["sudo"], "ALL=(ALL) NOPASSWD:ALL");
        assert_eq!(entry["lock_passwd"], false);
        assert_eq!(entry["passwd"], HASH);
        assert_eq!(entry["ssh_authorized_keys"][0], "ssh-ed25519 AAAAC3Nza chv@host");
        assert_eq!(user["ssh_pwauth"], true);
        assert!(user.get("ssh_authorized_keys").is_none());
    }

    #[test]
    fn keys_without_user_go_to_default_user() {
        let s = CloudInit::new("vm", "12:34:56:78:90:01", "10.0.5.2/24", "10.0.5.1").ssh_key("k");
        let user = parse(&s.user_data().unwrap());
        assert!(user.get("users").is_none());
        assert_eq!(user["ssh_authorized_keys"][0], "k");
        assert_eq!(user["ssh_pwauth"], false);
    }

    #[test]
    fn control_characters_survive_as_valid_yaml() {
        let key = "ssh-ed25519 AAAA\u{7}bell";
        let hash = "x\u{1b}y";
        let s = seed().ssh_key(key).password_hash(hash);
        s.validate().unwrap();

        let user = parse(&s.user_data().unwrap());
        assert_eq!(user["users"][0]["ssh_authorized_keys"][1], key);
        assert_eq!(user["users"][0]["passwd"], hash);
    }

    #[test]
    fn yaml_special_values_stay_strings() {
        let s = CloudInit::new("yes", "12:34:56:78:90:01", "10.0.5.2/24", "10.0.5.1")
            .ssh_key("key: \"quoted\" # not a comment");
        let user = parse(&s.user_data().unwrap());
        assert_eq!(user["hostname"], "yes");
        assert_eq!(user["ssh_authorized_keys"][0], "key: \"quoted\" # not a comment");
    }

    #[test]
    fn raw_user_data_is_verbatim() {
        let mut s = seed();
        s.user_data = Some("#cloud-config\nruncmd: [reboot]\n".into());
        assert_eq!(s.user_data().unwrap(), "#cloud-config\nruncmd: [reboot]\n");
    }

    #[test]
    fn build_packs_three_files_into_minimum_sized_image() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("seed.iso");
        let s = seed();
        assert_eq!(s.build(&dest).unwrap(), dest);

        let img = fs::read(&dest).unwrap();
        assert_eq!(img.len() as u64, iso9660::MIN_IMAGE_SIZE);
        assert_eq!(volume_label(&img), VOLUME_LABEL);
        assert_eq!(
            joliet_files(&img),
            vec![
                ("meta-data".to_owned(), s.meta_data().unwrap().into_bytes()),
                ("network-config".to_owned(), s.network_config().unwrap().into_bytes()),
                ("user-data".to_owned(), s.user_data().unwrap().into_bytes()),
            ]
        );
    }

    #[test]
    fn build_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (dir.path().join("a.iso"), dir.path().join("b.iso"));
        seed().build(&a).unwrap();
        seed().build(&b).unwrap();
        assert_eq!(fs::read(a).unwrap(), fs::read(b).unwrap());
    }

    #[test]
    fn invalid_fields_fail_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("seed.iso");
        let cases = [
            CloudInit { hostname: "-bad".into(), ..seed() },
            CloudInit { mac: "12:34".into(), ..seed() },
            CloudInit { mac: "+1:+2:+3:+4:+5:+6".into(), ..seed() },
            CloudInit { cidr: "10.0.5.2".into(), ..seed() },
            CloudInit { cidr: "10.0.5.2/33".into(), ..seed() },
            CloudInit { gateway: "gw".into(), ..seed() },
            CloudInit { username: Some("Root".into()), ..seed() },
            CloudInit { ssh_authorized_keys: vec!["a\nb".into()], ..seed() },
        ];
        for case in cases {
            let err = case.build(&dest).unwrap_err();
            assert!(matches!(err, Error::DiskBuildFailed(ref e) if e.kind() == io::ErrorKind::InvalidInput), "{err}");
        }
        assert!(!dest.exists());
    }

    #[test]
    fn unwritable_destination_fails_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let err = seed().build(dir.path().join("missing/seed.iso")).unwrap_err();
        assert!(matches!(err, Error::DiskBuildFailed(_)));
    }

    #[test]
    fn disk_config_is_read_only() {
        let disk = CloudInit::disk_config("/run/chv/seed.iso");
        assert_eq!(disk.path, "/run/chv/seed.iso");
        assert_eq!(disk.readonly, Some(true));
    }
}
