//! Certificate sanity check for generated TLS material.
//!
//! A certificate that does not decode is fatal for the file. One that
//! decodes but is outside its validity window only earns a warning, since
//! replacing it is still better than keeping the old one.

use x509_parser::prelude::{Pem, X509Certificate};
use x509_parser::time::ASN1Time;

const CERT_SUFFIXES: &[&str] = &[".cer", ".crt", ".pem"];

/// Whether a file should be treated as a certificate
pub fn is_certificate_file(name: &str) -> bool {
    CERT_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Whether a file's body has to pass `check_certificates`.
///
/// A `.pem` may hold only a key, so it is checked only when it carries a
/// certificate block.
pub fn needs_certificate_check(name: &str, body: &str) -> bool {
    if body.trim().is_empty() || !is_certificate_file(name) {
        return false;
    }
    !name.ends_with(".pem") || body.contains("-----BEGIN CERTIFICATE-----")
}

/// Validate every certificate in a PEM body.
///
/// `Ok` carries warnings for certificates outside their validity window.
pub fn check_certificates(body: &str) -> Result<Vec<String>, String> {
    let now = ASN1Time::now();
    let mut warnings = Vec::new();
    let mut count = 0;

    for pem in Pem::iter_from_buffer(body.as_bytes()) {
        let pem = pem.map_err(|e| format!("PEM decode failed: {}", e))?;
        if pem.label != "CERTIFICATE" {
            continue;
        }
        let cert: X509Certificate = pem
            .parse_x509()
            .map_err(|e| format!("X.509 parse failed: {}", e))?;
        count += 1;

        let validity = cert.validity();
        let subject = cert.subject().to_string();
        if validity.not_after < now {
            warnings.push(format!(
                "certificate '{}' expired at {}",
                subject, validity.not_after
            ));
        } else if validity.not_before > now {
            warnings.push(format!(
                "certificate '{}' is not valid before {}",
                subject, validity.not_before
            ));
        }
    }

    if count == 0 {
        return Err("no certificate found".to_string());
    }
    Ok(warnings)
}

/// Self-signed, valid 2020-01-01 to 2021-01-01
#[cfg(test)]
pub(crate) const EXPIRED_CERT: &str = "-----BEGIN CERTIFICATE-----
MIIBkjCCATegAwIBAgIULNgRRe+O4OlhiYcx8WPOLMzjH1QwCgYIKoZIzj0EAwIw
HjEcMBoGA1UEAwwTZXhwaXJlZC5leGFtcGxlLmNvbTAeFw0yMDAxMDEwMDAwMDBa
Fw0yMTAxMDEwMDAwMDBaMB4xHDAaBgNVBAMME2V4cGlyZWQuZXhhbXBsZS5jb20w
WTATBgcqhkjOPQIBBggqhkjOPQMBBwNCAATDmHkawS5/WIoaU+C2InGZQ1/+OYwf
9giCFLmKwN2/bmgR42DvCxT6kYXQQCIYxZb9L8tQrX8iwh0vTQgdWctdo1MwUTAd
BgNVHQ4EFgQUXlwS61WDHf6qHiO+TkVPF1GV3v0wHwYDVR0jBBgwFoAUXlwS61WD
Hf6qHiO+TkVPF1GV3v0wDwYDVR0TAQH/BAUwAwEB/zAKBggqhkjOPQQDAgNJADBG
AiEA61ezBXJU1SVCTTsnECUt7CTRnoVtmZEEZOR6toypz2MCIQDO+QLGC7Y9WyA6
A2GCU6StLO/qiEqN5rRtJeL1/jPrwg==
-----END CERTIFICATE-----
";
