//! TLS setup helpers: self-signed server identity, trust-on-first-use
//! clients, and stream wrapping onto the [`Socket`](crate::socket::Socket)
//! seam. Peer-identity policy beyond TOFU pinning belongs to the caller.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::{IpAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConnection, DigitallySignedStruct, ServerConnection, SignatureScheme, StreamOwned};
use sha2::{Digest, Sha256};

use crate::error::{Result, WireError};

pub fn config_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("framelink");
    }
    PathBuf::from(".framelink")
}

fn default_server_cert_paths() -> (PathBuf, PathBuf) {
    let dir = config_dir();
    (dir.join("server-cert.pem"), dir.join("server-key.pem"))
}

fn tls_err<E: std::fmt::Display>(what: &str, e: E) -> WireError {
    WireError::Tls(format!("{what}: {e}"))
}

/// Load the server certificate and key, generating and persisting a
/// self-signed pair on first use so TOFU clients can pin it.
pub fn load_or_generate_server_config(
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
) -> Result<rustls::ServerConfig> {
    let (cert_path, key_path) = match (cert, key) {
        (Some(c), Some(k)) => (c, k),
        (None, None) => default_server_cert_paths(),
        _ => {
            return Err(WireError::Tls(
                "a certificate path requires a key path".to_string(),
            ))
        }
    };

    if !cert_path.exists() || !key_path.exists() {
        let dir = cert_path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir).ok();
        let cert = rcgen::generate_simple_self_signed(vec!["framelink.local".to_string()])
            .map_err(|e| tls_err("generate self-signed cert", e))?;
        let pem = cert.serialize_pem().map_err(|e| tls_err("serialize cert", e))?;
        fs::write(&cert_path, pem).map_err(|e| tls_err("write cert pem", e))?;
        fs::write(&key_path, cert.serialize_private_key_pem())
            .map_err(|e| tls_err("write key pem", e))?;
    }

    let certs = {
        let mut rd =
            BufReader::new(fs::File::open(&cert_path).map_err(|e| tls_err("open cert", e))?);
        let mut out = Vec::new();
        for c in rustls_pemfile::certs(&mut rd) {
            out.push(c.map_err(|e| tls_err("read cert", e))?);
        }
        out
    };
    let key = {
        let mut rd = BufReader::new(fs::File::open(&key_path).map_err(|e| tls_err("open key", e))?);
        let pkcs8: Vec<_> = rustls_pemfile::pkcs8_private_keys(&mut rd).collect();
        if let Some(k) = pkcs8.into_iter().next() {
            PrivateKeyDer::from(k.map_err(|e| tls_err("pkcs8 key", e))?)
        } else {
            let mut rd2 =
                BufReader::new(fs::File::open(&key_path).map_err(|e| tls_err("reopen key", e))?);
            let rsa: Vec<_> = rustls_pemfile::rsa_private_keys(&mut rd2).collect();
            let k = rsa
                .into_iter()
                .next()
                .ok_or_else(|| WireError::Tls("no private key found".to_string()))?;
            PrivateKeyDer::from(k.map_err(|e| tls_err("rsa key", e))?)
        }
    };

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| tls_err("build server tls config", e))
}

pub fn known_hosts_path() -> PathBuf {
    config_dir().join("known_hosts")
}

fn read_known_hosts(path: &Path) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Ok(f) = fs::File::open(path) {
        for line in BufReader::new(f).lines().flatten() {
            if line.starts_with('#') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                map.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
    }
    map
}

fn write_known_hosts(path: &Path, map: &HashMap<String, String>) -> Result<()> {
    if let Some(p) = path.parent() {
        fs::create_dir_all(p).map_err(|e| tls_err("create known_hosts dir", e))?;
    }
    // Write-then-rename keeps concurrent readers from seeing a torn file.
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp).map_err(|e| tls_err("create temp known_hosts", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = f.metadata().map_err(|e| tls_err("stat known_hosts", e))?.permissions();
            perms.set_mode(0o600);
            f.set_permissions(perms).map_err(|e| tls_err("chmod known_hosts", e))?;
        }
        writeln!(f, "# framelink TOFU known_hosts - format version 1")
            .map_err(|e| tls_err("write known_hosts", e))?;
        for (k, v) in map.iter() {
            writeln!(f, "{}={}", k, v).map_err(|e| tls_err("write known_hosts", e))?;
        }
        f.sync_all().map_err(|e| tls_err("sync known_hosts", e))?;
    }
    fs::rename(&tmp, path).map_err(|e| tls_err("replace known_hosts", e))?;
    Ok(())
}

fn cert_fingerprint(cert: &CertificateDer<'_>) -> String {
    let mut h = Sha256::new();
    h.update(cert.as_ref());
    h.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

/// Pins the first certificate seen per host:port and refuses any change.
#[derive(Debug)]
struct TofuVerifier {
    hostport: String,
    known_path: PathBuf,
}

impl ServerCertVerifier for TofuVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let fp = cert_fingerprint(end_entity);
        let mut map = read_known_hosts(&self.known_path);
        match map.get(&self.hostport) {
            Some(saved) if saved == &fp => Ok(ServerCertVerified::assertion()),
            Some(_) => Err(rustls::Error::General(
                "server certificate changed; refusing connection (TOFU)".into(),
            )),
            None => {
                map.insert(self.hostport.clone(), fp);
                let _ = write_known_hosts(&self.known_path, &map);
                Ok(ServerCertVerified::assertion())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PKCS1_SHA256,
        ]
    }
}

pub fn client_config_tofu(host: &str, port: u16) -> rustls::ClientConfig {
    client_config_with_known_hosts(host, port, known_hosts_path())
}

/// TOFU client config pinning against an explicit known-hosts file.
pub fn client_config_with_known_hosts(
    host: &str,
    port: u16,
    known_path: PathBuf,
) -> rustls::ClientConfig {
    let verifier = TofuVerifier {
        hostport: format!("{}:{}", host, port),
        known_path,
    };
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth()
}

pub fn server_name_for(host: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string())
        .map_err(|e| WireError::Tls(format!("invalid server name {host:?}: {e}")))
}

/// Wrap a connected stream as the client side of a TOFU-verified TLS session.
pub fn wrap_client(
    stream: TcpStream,
    host: &str,
    port: u16,
) -> Result<StreamOwned<ClientConnection, TcpStream>> {
    let cfg = Arc::new(client_config_tofu(host, port));
    let conn = ClientConnection::new(cfg, server_name_for(host)?)
        .map_err(|e| tls_err("client tls session", e))?;
    Ok(StreamOwned::new(conn, stream))
}

/// Wrap an accepted stream as the server side of a TLS session.
pub fn wrap_server(
    stream: TcpStream,
    cfg: Arc<rustls::ServerConfig>,
) -> Result<StreamOwned<ServerConnection, TcpStream>> {
    let conn = ServerConnection::new(cfg).map_err(|e| tls_err("server tls session", e))?;
    Ok(StreamOwned::new(conn, stream))
}
