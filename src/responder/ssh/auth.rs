//! selection of the ssh authentication method
//!
//! Key material is read and parsed when an alert is handled, so a key that is
//! replaced on disk is picked up without a reload.

use std::{
	fmt,
	path::{Path, PathBuf},
};

use ssh2::Session;
use ssh_encoding::{Decode, Encode};
use ssh_key::{public::KeyData, Algorithm, PrivateKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("unable to read private key '{}': {source}", path.display())]
	ReadKey { path: PathBuf, source: std::io::Error },
	#[error("unable to parse private key '{}': {source}", path.display())]
	ParseKey { path: PathBuf, source: ssh_key::Error },
	#[error("private key '{}' is encrypted", path.display())]
	EncryptedKey { path: PathBuf },
	#[error("unable to read certificate file '{}': {source}", path.display())]
	ReadCertificate { path: PathBuf, source: std::io::Error },
	#[error("unable to parse certificate '{}': {source}", path.display())]
	ParseCertificate { path: PathBuf, source: ssh_key::Error },
	#[error("certificate '{}' needs a private key", path.display())]
	CertificateWithoutKey { path: PathBuf },
	#[error("certificate '{}' was not issued for private key '{}'", certificate.display(), key.display())]
	CertificateMismatch { certificate: PathBuf, key: PathBuf },
}

/// the single method used to authenticate an ssh session
pub enum AuthMethod {
	/// private key signed by a certificate authority
	Certificate { private_key: String, certificate: String },
	PrivateKey { private_key: String },
	Password(String),
	/// nothing configured, the server decides
	None,
}

impl fmt::Debug for AuthMethod {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

impl AuthMethod {
	/// Pick the authentication method.
	///
	/// A certificate takes precedence over a plain private key, which takes
	/// precedence over a password. Broken key material is an error, there is
	/// no fallback to the next method.
	pub fn resolve(
		key: Option<&Path>,
		certificate: Option<&Path>,
		password: Option<&str>,
	) -> Result<Self, AuthError> {
		if let Some(certificate_path) = certificate {
			let key_path = key.ok_or_else(|| AuthError::CertificateWithoutKey {
				path: certificate_path.to_owned(),
			})?;
			let (private_key, parsed_key) = read_private_key(key_path)?;

			let certificate = std::fs::read_to_string(certificate_path).map_err(|source| {
				AuthError::ReadCertificate { path: certificate_path.to_owned(), source }
			})?;
			let certified = certified_key(&certificate).map_err(|source| {
				AuthError::ParseCertificate { path: certificate_path.to_owned(), source }
			})?;

			if &certified != parsed_key.public_key().key_data() {
				return Err(AuthError::CertificateMismatch {
					certificate: certificate_path.to_owned(),
					key: key_path.to_owned(),
				});
			}

			return Ok(Self::Certificate { private_key, certificate: certificate.trim().to_owned() });
		}

		if let Some(key_path) = key {
			let (private_key, _) = read_private_key(key_path)?;
			return Ok(Self::PrivateKey { private_key });
		}

		match password {
			Some(password) => Ok(Self::Password(password.to_owned())),
			None => Ok(Self::None),
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			Self::Certificate { .. } => "certificate",
			Self::PrivateKey { .. } => "publickey",
			Self::Password(_) => "password",
			Self::None => "none",
		}
	}

	/// authenticate `session` as `user`, the session must have completed its handshake
	pub fn authenticate(&self, session: &Session, user: &str) -> Result<(), ssh2::Error> {
		match self {
			Self::Certificate { private_key, certificate } => {
				session.userauth_pubkey_memory(user, Some(certificate), private_key, None)
			}
			Self::PrivateKey { private_key } => {
				session.userauth_pubkey_memory(user, None, private_key, None)
			}
			Self::Password(password) => session.userauth_password(user, password),
			// asking for the available methods attempts the "none" method
			Self::None => session.auth_methods(user).map(|_| ()),
		}
	}
}

/// Public key an OpenSSH certificate line was issued for.
///
/// Only the leading fields of the certificate are decoded. Validity,
/// principals and the CA signature are checked by the server, and a validity
/// of "forever" does not fit a timestamp on every platform.
fn certified_key(line: &str) -> Result<KeyData, ssh_key::Error> {
	let mut fields = line.split_whitespace();
	let cert_type = fields.next().ok_or(ssh_key::Error::FormatEncoding)?;
	let blob = fields
		.next()
		.and_then(|blob| base64::decode(blob).ok())
		.ok_or(ssh_key::Error::FormatEncoding)?;

	let mut reader = blob.as_slice();
	let embedded_type = String::decode(&mut reader)?;
	if embedded_type != cert_type {
		return Err(ssh_key::Error::AlgorithmUnknown);
	}
	let algorithm = Algorithm::new_certificate(&embedded_type)?;
	// nonce
	Vec::<u8>::decode(&mut reader)?;

	// the key fields follow the nonce, prefix them with the plain algorithm name
	let mut key = Vec::new();
	algorithm.as_str().encode(&mut key)?;
	key.extend_from_slice(reader);
	KeyData::decode(&mut key.as_slice())
}

fn read_private_key(path: &Path) -> Result<(String, PrivateKey), AuthError> {
	let pem = std::fs::read_to_string(path)
		.map_err(|source| AuthError::ReadKey { path: path.to_owned(), source })?;
	let key = PrivateKey::from_openssh(&pem)
		.map_err(|source| AuthError::ParseKey { path: path.to_owned(), source })?;

	if key.is_encrypted() {
		return Err(AuthError::EncryptedKey { path: path.to_owned() });
	}

	Ok((pem, key))
}
