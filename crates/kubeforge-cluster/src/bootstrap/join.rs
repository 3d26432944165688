//! Parsing of kubeadm join material

use kubeforge_common::types::JoinCredentials;
use kubeforge_common::{Error, Result};

/// Parse `kubeadm token create --print-join-command` output
pub fn parse_join_command(output: &str) -> Result<JoinCredentials> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("kubeadm join"))
        .ok_or_else(|| Error::serialization("no kubeadm join command in output"))?;

    let mut parts = line.split_whitespace().skip(2);
    let endpoint = parts
        .next()
        .filter(|e| !e.starts_with("--"))
        .ok_or_else(|| Error::serialization("join command has no endpoint"))?
        .to_string();

    let mut token = None;
    let mut ca_cert_hash = None;
    let mut certificate_key = None;
    while let Some(flag) = parts.next() {
        match flag {
            "--token" => token = parts.next().map(str::to_string),
            "--discovery-token-ca-cert-hash" => ca_cert_hash = parts.next().map(str::to_string),
            "--certificate-key" => certificate_key = parts.next().map(str::to_string),
            _ => {}
        }
    }

    let token = token.ok_or_else(|| Error::serialization("join command has no --token"))?;
    let ca_cert_hash = ca_cert_hash
        .filter(|h| h.starts_with("sha256:"))
        .ok_or_else(|| Error::serialization("join command has no sha256 CA cert hash"))?;

    Ok(JoinCredentials {
        endpoint,
        token,
        ca_cert_hash,
        certificate_key,
    })
}

/// Parse the certificate key from `kubeadm init phase upload-certs` output
///
/// The key is the last non-empty line: 64 hex characters.
pub fn parse_certificate_key(output: &str) -> Result<String> {
    let key = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| Error::serialization("empty upload-certs output"))?;

    if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::serialization(
            "upload-certs output does not end with a certificate key",
        ));
    }
    Ok(key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "2a1c8f5e4b9d7a6c3e0f1b2d4c6e8a0b1c3d5e7f9a1b3c5d7e9f0a2b4c6d8e0f";

    #[test]
    fn parses_print_join_command_output() {
        let output = "kubeadm join 10.0.1.10:6443 --token abcdef.0123456789abcdef \
                      --discovery-token-ca-cert-hash sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08 \n";
        let creds = parse_join_command(output).unwrap();
        assert_eq!(creds.endpoint, "10.0.1.10:6443");
        assert_eq!(creds.token, "abcdef.0123456789abcdef");
        assert!(creds.ca_cert_hash.starts_with("sha256:9f86"));
        assert!(creds.certificate_key.is_none());
    }

    #[test]
    fn rejects_output_without_hash() {
        assert!(parse_join_command("kubeadm join 10.0.1.10:6443 --token a.b").is_err());
        assert!(parse_join_command("error: token create failed").is_err());
    }

    #[test]
    fn certificate_key_is_last_line() {
        let output = format!(
            "[upload-certs] Storing the certificates in Secret \"kubeadm-certs\"\n\
             [upload-certs] Using certificate key:\n{}\n",
            KEY
        );
        assert_eq!(parse_certificate_key(&output).unwrap(), KEY);
        assert!(parse_certificate_key("[upload-certs] failed").is_err());
    }
}
