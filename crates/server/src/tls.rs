//! Server certificates and the QUIC crypto built from them

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::crypto::rustls::QuicServerConfig;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, Issuer, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::AuthSettings;

pub const ALPN_PROTOCOL: &[u8] = b"tether";

/// A private CA plus a server certificate signed by it, all PEM encoded.
pub struct CertificateBundle {
    pub ca_cert_pem: String,
    pub ca_key_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
}

impl CertificateBundle {
    /// The server certificate is valid for `host`, `localhost` and `127.0.0.1`.
    pub fn generate(host: &str) -> Result<Self> {
        let mut ca_params = CertificateParams::default();
        ca_params
            .distinguished_name
            .push(DnType::CommonName, format!("{} CA", host));
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        let ca_key = KeyPair::generate().context("Failed to generate CA key")?;
        let ca_cert = ca_params
            .self_signed(&ca_key)
            .context("Failed to self-sign CA certificate")?;
        let ca_key_pem = ca_key.serialize_pem();
        let issuer = Issuer::from_params(&ca_params, ca_key);

        let mut names = vec![host.to_string()];
        for extra in ["localhost", "127.0.0.1"] {
            if !names.iter().any(|n| n == extra) {
                names.push(extra.to_string());
            }
        }
        // IP literals become IP SANs, everything else a DNS name.
        let mut server_params = CertificateParams::new(names)
            .with_context(|| format!("Invalid server name {:?}", host))?;
        server_params
            .distinguished_name
            .push(DnType::CommonName, host.to_string());
        let server_key = KeyPair::generate().context("Failed to generate server key")?;
        let server_cert = server_params
            .signed_by(&server_key, &issuer)
            .context("Failed to sign server certificate")?;

        Ok(Self {
            ca_cert_pem: ca_cert.pem(),
            ca_key_pem,
            server_cert_pem: server_cert.pem(),
            server_key_pem: server_key.serialize_pem(),
        })
    }

    /// Writes `ca.crt`, `ca.key`, `server.crt` and `server.key` into `dir`.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {:?}", dir))?;

        write_pem(&dir.join("ca.crt"), &self.ca_cert_pem, false)?;
        write_pem(&dir.join("ca.key"), &self.ca_key_pem, true)?;
        write_pem(&dir.join("server.crt"), &self.server_cert_pem, false)?;
        write_pem(&dir.join("server.key"), &self.server_key_pem, true)?;
        Ok(())
    }
}

fn write_pem(path: &Path, pem: &str, private: bool) -> Result<()> {
    std::fs::write(path, pem).with_context(|| format!("Failed to write {:?}", path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if private {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to restrict {:?}", path))?;
        }
    }
    #[cfg(not(unix))]
    let _ = private;

    Ok(())
}

/// Reads the certificate chain and private key named in `auth`.
pub fn load_identity(
    auth: &AuthSettings,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_pem = std::fs::read(&auth.cert_path)
        .with_context(|| format!("Failed to read certificate: {:?}", auth.cert_path))?;
    let key_pem = std::fs::read(&auth.key_path)
        .with_context(|| format!("Failed to read private key: {:?}", auth.key_path))?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse {:?}", auth.cert_path))?;
    if certs.is_empty() {
        anyhow::bail!("No certificate found in {:?}", auth.cert_path);
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .with_context(|| format!("Failed to parse {:?}", auth.key_path))?
        .with_context(|| format!("No private key found in {:?}", auth.key_path))?;

    Ok((certs, key))
}

/// TLS 1.3 only, ring provider, `tether` ALPN.
pub fn quic_server_config(auth: &AuthSettings, idle_timeout: Duration) -> Result<quinn::ServerConfig> {
    let (certs, key) = load_identity(auth)?;

    let mut tls = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])
    .context("TLS 1.3 is unavailable")?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .context("Certificate and private key do not match")?;
    tls.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let crypto = QuicServerConfig::try_from(tls).context("Unsupported QUIC crypto setup")?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        idle_timeout.try_into().context("Idle timeout out of range")?,
    ));
    server_config.transport_config(Arc::new(transport));

    Ok(server_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(dir: &Path) -> AuthSettings {
        AuthSettings {
            key: None,
            cert_path: dir.join("server.crt"),
            key_path: dir.join("server.key"),
        }
    }

    #[test]
    fn test_generated_bundle_loads_into_quic_config() {
        let dir = TempDir::new().unwrap();
        let bundle = CertificateBundle::generate("tether.local").unwrap();
        bundle.write_to(dir.path()).unwrap();

        for name in ["ca.crt", "ca.key", "server.crt", "server.key"] {
            assert!(dir.path().join(name).is_file(), "{} missing", name);
        }

        let (certs, _) = load_identity(&settings(dir.path())).unwrap();
        assert_eq!(certs.len(), 1);
        quic_server_config(&settings(dir.path()), Duration::from_secs(30)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_private_keys_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        CertificateBundle::generate("localhost")
            .unwrap()
            .write_to(dir.path())
            .unwrap();

        let mode = |name: &str| {
            std::fs::metadata(dir.path().join(name)).unwrap().permissions().mode() & 0o777
        };
        assert_eq!(mode("server.key"), 0o600);
        assert_eq!(mode("ca.key"), 0o600);
    }

    #[test]
    fn test_missing_identity_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = quic_server_config(&settings(dir.path()), Duration::from_secs(30)).unwrap_err();
        assert!(err.to_string().contains("server.crt"));
    }
}
