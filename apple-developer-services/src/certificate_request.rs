// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Certificate signing request generation for development certificates.
//!
//! Apple's certificate issuance endpoint accepts a PEM encoded PKCS#10 CSR
//! and returns a signed development certificate. The private key never
//! leaves this machine. Apple requires RSA keys here, which ring cannot
//! generate, so key material comes from the `rsa` crate and is re-imported
//! through PKCS#8 for signing the request.

use {
    crate::error::DeveloperServicesError,
    rsa::{pkcs8::EncodePrivateKey, RsaPrivateKey},
    x509_certificate::{InMemorySigningKeyPair, KeyAlgorithm, X509CertificateBuilder},
};

const RSA_KEY_BITS: usize = 2048;

/// A freshly generated signing request plus its private key.
pub struct CertificateSigningRequest {
    /// PEM encoded PKCS#10 certification request.
    pub csr_pem: String,

    /// PKCS#8 DER of the RSA private key backing the request.
    pub private_key_der: Vec<u8>,
}

impl CertificateSigningRequest {
    /// Generate an RSA-2048 key pair and a CSR with the given common name.
    pub fn generate(common_name: &str) -> Result<Self, DeveloperServicesError> {
        let mut rng = rand::thread_rng();

        let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| DeveloperServicesError::RsaKeyGeneration(e.to_string()))?;

        let private_key_der = private_key
            .to_pkcs8_der()
            .map_err(|e| DeveloperServicesError::RsaKeyGeneration(e.to_string()))?
            .as_ref()
            .to_vec();

        let key_pair = InMemorySigningKeyPair::from_pkcs8_der(&private_key_der)?;

        let mut builder = X509CertificateBuilder::new(KeyAlgorithm::Rsa);
        builder
            .subject()
            .append_common_name_utf8_string(common_name)
            .map_err(|e| {
                DeveloperServicesError::CertificateRequestBuild(format!("{:?}", e))
            })?;

        let csr_pem = builder
            .create_certificate_signing_request(&key_pair)?
            .encode_pem()?;

        Ok(Self {
            csr_pem,
            private_key_der,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generated_csr_is_pem_encoded() {
        let request = CertificateSigningRequest::generate("apple-developer-services").unwrap();

        assert!(request.csr_pem.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
        assert!(!request.private_key_der.is_empty());

        // The key must round-trip through PKCS#8 for later signing use.
        InMemorySigningKeyPair::from_pkcs8_der(&request.private_key_der).unwrap();
    }
}
