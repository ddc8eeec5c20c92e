//! Certificate authorities and leaf certificates for Consul and Nomad TLS.
//!
//! Everything is generated once and then left alone. If a CA is missing it is created
//! and all of its leaf certificates are reissued, since leaves signed by the previous CA
//! would no longer verify.

use std::{
    fs::{self, Permissions},
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;

use super::secrets_dir;

const CA_VALIDITY_YEARS: i64 = 5;
const CERT_VALIDITY_YEARS: i64 = 1;

const KEY_PERMISSIONS: u32 = 0o600;
const CERT_PERMISSIONS: u32 = 0o644;

const ORGANIZATION: &str = "hshstack";

#[derive(Error, Debug)]
pub enum PkiError {
    #[error("Certificate file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Certificate generation failed: {0}")]
    Rcgen(#[from] rcgen::Error),
    #[error("Invalid DNS name '{0}'")]
    InvalidDnsName(String),
}

fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(years * 365);
    (now, not_after)
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

/// Location of a PEM encoded certificate and its private key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl CertificateFiles {
    fn new(dir: &Path, name: &str) -> Self {
        Self {
            cert: dir.join(format!("{name}.pem")),
            key: dir.join(format!("{name}-key.pem")),
        }
    }

    fn exist(&self) -> bool {
        self.cert.exists() && self.key.exists()
    }

    fn read(&self) -> Result<(String, String), PkiError> {
        Ok((read(&self.cert)?, read(&self.key)?))
    }

    fn write(&self, cert_pem: &str, key_pem: &str) -> Result<(), PkiError> {
        write(&self.cert, cert_pem, CERT_PERMISSIONS)?;
        write(&self.key, key_pem, KEY_PERMISSIONS)
    }
}

fn read(path: &Path) -> Result<String, PkiError> {
    fs::read_to_string(path).map_err(|source| PkiError::Io {
        path: path.to_owned(),
        source,
    })
}

fn write(path: &Path, contents: &str, mode: u32) -> Result<(), PkiError> {
    let io_error = |source| PkiError::Io {
        path: path.to_owned(),
        source,
    };

    fs::write(path, contents).map_err(io_error)?;
    fs::set_permissions(path, Permissions::from_mode(mode)).map_err(io_error)
}

struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
}

impl CertificateAuthority {
    fn generate(common_name: &str) -> Result<Self, PkiError> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Loads the CA from `files`, or generates and writes it. Returns whether it was generated.
    fn load_or_generate(
        files: &CertificateFiles,
        common_name: &str,
    ) -> Result<(Self, bool), PkiError> {
        if files.exist() {
            let (cert_pem, key_pem) = files.read()?;
            return Ok((Self { cert_pem, key_pem }, false));
        }

        tracing::info!("Generating certificate authority '{}'", common_name);
        let ca = Self::generate(common_name)?;
        files.write(&ca.cert_pem, &ca.key_pem)?;

        Ok((ca, true))
    }

    fn issue(&self, leaf: &Leaf) -> Result<(String, String), PkiError> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(&leaf.common_name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = leaf.usages.clone();

        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        params.subject_alt_names = leaf
            .sans
            .iter()
            .map(|san| {
                if let Ok(ip) = san.parse::<std::net::IpAddr>() {
                    Ok(SanType::IpAddress(ip))
                } else {
                    Ia5String::try_from(san.to_string())
                        .map(SanType::DnsName)
                        .map_err(|_| PkiError::InvalidDnsName(san.to_string()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let leaf_key = KeyPair::generate()?;

        let ca_key = KeyPair::from_pem(&self.key_pem)?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)?;
        let cert = params.signed_by(&leaf_key, &issuer)?;

        Ok((cert.pem(), leaf_key.serialize_pem()))
    }
}

struct Leaf {
    files: CertificateFiles,
    common_name: String,
    sans: Vec<String>,
    usages: Vec<ExtendedKeyUsagePurpose>,
}

impl Leaf {
    fn new(
        dir: &Path,
        name: &str,
        common_name: &str,
        usages: &[ExtendedKeyUsagePurpose],
    ) -> Self {
        Self {
            files: CertificateFiles::new(dir, name),
            common_name: common_name.to_string(),
            sans: vec![
                common_name.to_string(),
                "localhost".to_string(),
                "127.0.0.1".to_string(),
            ],
            usages: usages.to_vec(),
        }
    }
}

fn ensure_certificates(
    dir: &Path,
    ca_files: &CertificateFiles,
    ca_common_name: &str,
    leaves: &[Leaf],
) -> Result<(), PkiError> {
    fs::create_dir_all(dir).map_err(|source| PkiError::Io {
        path: dir.to_owned(),
        source,
    })?;

    let (ca, ca_generated) = CertificateAuthority::load_or_generate(ca_files, ca_common_name)?;

    for leaf in leaves {
        if leaf.files.exist() && !ca_generated {
            continue;
        }

        tracing::info!("Issuing certificate '{}'", leaf.common_name);
        let (cert_pem, key_pem) = ca.issue(leaf)?;
        leaf.files.write(&cert_pem, &key_pem)?;
    }

    Ok(())
}

/// TLS material of the Consul servers, plus the client identity the operator
/// uses for the HTTPS API, which requires client certificates.
#[derive(Clone, Debug)]
pub struct ConsulCertificates {
    pub ca: CertificateFiles,
    pub server: CertificateFiles,
    pub cli: CertificateFiles,
}

impl ConsulCertificates {
    pub fn new(base_dir: impl AsRef<Path>, dc_name: &str) -> Self {
        let dir = secrets_dir(base_dir).join("consul");

        Self {
            ca: CertificateFiles::new(&dir, "consul-agent-ca"),
            server: CertificateFiles::new(&dir, &format!("{dc_name}-server-consul-0")),
            cli: CertificateFiles::new(&dir, &format!("{dc_name}-cli-consul-0")),
        }
    }
}

pub fn ensure_consul_certificates(
    base_dir: impl AsRef<Path>,
    dc_name: &str,
) -> Result<ConsulCertificates, PkiError> {
    let base_dir = base_dir.as_ref();
    let certificates = ConsulCertificates::new(base_dir, dc_name);
    let dir = secrets_dir(base_dir).join("consul");

    let server = Leaf {
        files: certificates.server.clone(),
        ..Leaf::new(
            &dir,
            "server",
            &format!("server.{dc_name}.consul"),
            &[
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
        )
    };

    let cli = Leaf {
        files: certificates.cli.clone(),
        ..Leaf::new(
            &dir,
            "cli",
            &format!("cli.{dc_name}.consul"),
            &[ExtendedKeyUsagePurpose::ClientAuth],
        )
    };

    ensure_certificates(
        &dir,
        &certificates.ca,
        &format!("Consul Agent CA {dc_name}"),
        &[server, cli],
    )?;

    Ok(certificates)
}

/// TLS material of the Nomad servers, clients and the operator CLI.
#[derive(Clone, Debug)]
pub struct NomadCertificates {
    pub ca: CertificateFiles,
    pub server: CertificateFiles,
    pub client: CertificateFiles,
    pub cli: CertificateFiles,
}

pub fn ensure_nomad_certificates(
    base_dir: impl AsRef<Path>,
) -> Result<NomadCertificates, PkiError> {
    let dir = secrets_dir(base_dir).join("nomad");
    let both = [
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let leaves = [
        Leaf::new(&dir, "server", "server.global.nomad", &both),
        Leaf::new(&dir, "client", "client.global.nomad", &both),
        Leaf::new(
            &dir,
            "cli",
            "cli.global.nomad",
            &[ExtendedKeyUsagePurpose::ClientAuth],
        ),
    ];
    let ca = CertificateFiles::new(&dir, "nomad-ca");

    ensure_certificates(&dir, &ca, "Nomad CA", &leaves)?;

    let [server, client, cli] = leaves.map(|leaf| leaf.files);
    Ok(NomadCertificates {
        ca,
        server,
        client,
        cli,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn consul_certificates_are_generated_once() {
        let dir = tempdir().unwrap();

        let certificates = ensure_consul_certificates(dir.path(), "hetzner").unwrap();
        assert!(certificates.ca.exist());
        assert!(certificates.server.exist());
        assert!(certificates.cli.exist());
        assert!(certificates
            .server
            .cert
            .ends_with("secrets/consul/hetzner-server-consul-0.pem"));

        let key_mode = fs::metadata(&certificates.ca.key)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(key_mode & 0o777, 0o600);

        let ca_before = fs::read_to_string(&certificates.ca.cert).unwrap();
        let server_before = fs::read_to_string(&certificates.server.cert).unwrap();

        ensure_consul_certificates(dir.path(), "hetzner").unwrap();

        assert_eq!(fs::read_to_string(&certificates.ca.cert).unwrap(), ca_before);
        assert_eq!(
            fs::read_to_string(&certificates.server.cert).unwrap(),
            server_before
        );
    }

    #[test]
    fn leaves_are_reissued_when_ca_is_replaced() {
        let dir = tempdir().unwrap();

        let certificates = ensure_nomad_certificates(dir.path()).unwrap();
        let client_before = fs::read_to_string(&certificates.client.cert).unwrap();

        fs::remove_file(&certificates.ca.key).unwrap();
        ensure_nomad_certificates(dir.path()).unwrap();

        assert!(certificates.ca.exist());
        assert_ne!(
            fs::read_to_string(&certificates.client.cert).unwrap(),
            client_before
        );
    }

    #[test]
    fn missing_leaf_is_issued_from_existing_ca() {
        let dir = tempdir().unwrap();

        let certificates = ensure_nomad_certificates(dir.path()).unwrap();
        let ca_before = fs::read_to_string(&certificates.ca.cert).unwrap();
        let server_before = fs::read_to_string(&certificates.server.cert).unwrap();

        fs::remove_file(&certificates.cli.cert).unwrap();
        ensure_nomad_certificates(dir.path()).unwrap();

        assert!(certificates.cli.exist());
        assert_eq!(fs::read_to_string(&certificates.ca.cert).unwrap(), ca_before);
        assert_eq!(
            fs::read_to_string(&certificates.server.cert).unwrap(),
            server_before
        );
    }
}
