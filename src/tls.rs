//! TLS setup and client identity verification
//!
//! Two listener postures share one CA: the proxy front end *requests*
//! a client certificate but lets the handshake succeed without one
//! (validation is deferred to the request path), while the admin
//! endpoint *requires and verifies* at the handshake. The two
//! configurations are intentionally separate.

use std::io::BufReader;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig, SignatureScheme};
use tokio_rustls::TlsAcceptor;
use x509_parser::parse_x509_certificate;

use crate::config::Certificates;

/// Make the ring provider the process default. Called once at startup
/// before any TLS configuration is built.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open certificate file {}", path))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .with_context(|| format!("failed to parse certificates from {}", path))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path);
    }
    Ok(certs)
}

pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open key file {}", path))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))?
        .ok_or_else(|| anyhow!("no private key found in {}", path))
}

pub fn load_root_store(ca_path: &str) -> Result<Arc<RootCertStore>> {
    let certs = load_certs(ca_path)?;
    let mut roots = RootCertStore::empty();
    let (added, _) = roots.add_parsable_certificates(certs);
    if added == 0 {
        anyhow::bail!("failed to parse CA certificate from {}", ca_path);
    }
    Ok(Arc::new(roots))
}

/// Handshake-level verifier for the proxy front end: advertises the CA
/// so clients send their certificate, accepts any (or none) at the
/// handshake, and leaves chain validation to [`IdentityVerifier`].
#[derive(Debug)]
struct RequestOnlyVerifier {
    inner: Arc<dyn ClientCertVerifier>,
}

impl ClientCertVerifier for RequestOnlyVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        // Chain validation runs per request, after the handshake
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Acceptor for the proxy listener: client certificate requested, not
/// required.
pub fn proxy_acceptor(certs: &Certificates, roots: Arc<RootCertStore>) -> Result<TlsAcceptor> {
    let cert_chain = load_certs(&certs.cert_path)?;
    let key = load_private_key(&certs.key_path)?;

    let inner = WebPkiClientVerifier::builder(roots)
        .allow_unauthenticated()
        .build()
        .map_err(|e| anyhow!("invalid client CA: {}", e))?;
    let verifier = Arc::new(RequestOnlyVerifier { inner });

    let mut config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert_chain, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Acceptor for the admin listener: client certificate required and
/// verified against the CA during the handshake.
pub fn admin_acceptor(certs: &Certificates) -> Result<TlsAcceptor> {
    let cert_chain = load_certs(&certs.cert_path)?;
    let key = load_private_key(&certs.key_path)?;
    let roots = load_root_store(&certs.ca_path)?;

    let verifier = WebPkiClientVerifier::builder(roots)
        .build()
        .map_err(|e| anyhow!("invalid admin client CA: {}", e))?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert_chain, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Validates presented client certificates against the trusted roots
/// and extracts the Subject Common Name used as the user identifier.
pub struct IdentityVerifier {
    verifier: Arc<dyn ClientCertVerifier>,
}

impl IdentityVerifier {
    pub fn new(roots: Arc<RootCertStore>) -> Result<Self> {
        // webpki enforces the client-auth extended key usage
        let verifier = WebPkiClientVerifier::builder(roots)
            .build()
            .map_err(|e| anyhow!("invalid client CA: {}", e))?;
        Ok(Self { verifier })
    }

    /// Chain validation for a presented certificate list. An empty
    /// list is invalid.
    pub fn verify(&self, certs: &[CertificateDer<'static>]) -> bool {
        let Some((end_entity, intermediates)) = certs.split_first() else {
            return false;
        };
        match self
            .verifier
            .verify_client_cert(end_entity, intermediates, UnixTime::now())
        {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("Certificate verification failed: {}", e);
                false
            }
        }
    }
}

/// Subject Common Name of a certificate, or the empty string when the
/// subject carries none. An empty name is still a valid user.
pub fn common_name(cert: &CertificateDer<'_>) -> String {
    let Ok((_, parsed)) = parse_x509_certificate(cert.as_ref()) else {
        return String::new();
    };
    let name = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName as RcgenDn, DnType,
        ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
    };

    struct TestCa {
        issuer: Issuer<'static, KeyPair>,
        cert_der: CertificateDer<'static>,
    }

    fn make_ca(cn: &str) -> TestCa {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        let mut dn = RcgenDn::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        let cert = params.clone().self_signed(&key).unwrap();
        let cert_der = cert.der().clone();
        TestCa {
            issuer: Issuer::new(params, key),
            cert_der,
        }
    }

    fn make_client_cert(
        ca: &TestCa,
        cn: Option<&str>,
        eku: ExtendedKeyUsagePurpose,
    ) -> CertificateDer<'static> {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.extended_key_usages = vec![eku];
        if let Some(cn) = cn {
            let mut dn = RcgenDn::new();
            dn.push(DnType::CommonName, cn);
            params.distinguished_name = dn;
        } else {
            params.distinguished_name = RcgenDn::new();
        }
        params.signed_by(&key, &ca.issuer).unwrap().der().clone()
    }

    fn verifier_for(ca: &TestCa) -> IdentityVerifier {
        install_crypto_provider();
        let mut roots = RootCertStore::empty();
        roots.add(ca.cert_der.clone()).unwrap();
        IdentityVerifier::new(Arc::new(roots)).unwrap()
    }

    #[test]
    fn accepts_cert_from_trusted_ca() {
        let ca = make_ca("Test CA");
        let verifier = verifier_for(&ca);
        let cert = make_client_cert(&ca, Some("alice"), ExtendedKeyUsagePurpose::ClientAuth);
        assert!(verifier.verify(&[cert.clone()]));
        assert_eq!(common_name(&cert), "alice");
    }

    #[test]
    fn rejects_cert_from_unknown_ca() {
        let trusted = make_ca("Trusted CA");
        let rogue = make_ca("Rogue CA");
        let verifier = verifier_for(&trusted);
        let cert = make_client_cert(&rogue, Some("mallory"), ExtendedKeyUsagePurpose::ClientAuth);
        assert!(!verifier.verify(&[cert]));
    }

    #[test]
    fn rejects_empty_certificate_list() {
        let ca = make_ca("Test CA");
        let verifier = verifier_for(&ca);
        assert!(!verifier.verify(&[]));
    }

    #[test]
    fn rejects_server_auth_only_eku() {
        let ca = make_ca("Test CA");
        let verifier = verifier_for(&ca);
        let cert = make_client_cert(&ca, Some("alice"), ExtendedKeyUsagePurpose::ServerAuth);
        assert!(!verifier.verify(&[cert]));
    }

    #[test]
    fn empty_common_name_is_a_valid_user() {
        let ca = make_ca("Test CA");
        let verifier = verifier_for(&ca);
        let cert = make_client_cert(&ca, None, ExtendedKeyUsagePurpose::ClientAuth);
        assert!(verifier.verify(&[cert.clone()]));
        assert_eq!(common_name(&cert), "");
    }
}
