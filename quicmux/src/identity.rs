//! Self-signed peer identities.
//!
//! Every peer presents an ephemeral, self-signed ECDSA P-256 certificate in
//! both the dialing and the accepting role. The certificate is never checked
//! against a trust store; peers that need authentication compare the
//! [`fingerprint`] of the presented certificate against a value exchanged
//! out of band.

use rand::TryRngCore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use time::{Date, Month, OffsetDateTime};

/// Number of random bits in a certificate serial number.
const SERIAL_BITS: u32 = 130;

/// Length of the subject origin value in bytes.
pub const ORIGIN_LEN: usize = 16;

/// Errors that can occur while generating an identity.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// The operating system random source failed.
    #[error("randomness source failed: {0}")]
    Randomness(String),

    /// Key pair generation or certificate signing failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(#[from] rcgen::Error),

    /// The validity window could not be represented.
    #[error("certificate validity out of range: {0}")]
    Validity(#[from] time::error::ComponentRange),
}

/// Anonymous peer identifier carried as the certificate subject common name.
///
/// The default value is all zero bytes. Production callers should use
/// [`Origin::random`] so that distinct peers carry distinct subjects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Origin([u8; ORIGIN_LEN]);

impl Origin {
    /// Wrap raw origin bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; ORIGIN_LEN]) -> Self {
        Self(bytes)
    }

    /// Draw a fresh origin from the operating system random source.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Randomness`] if the random source fails.
    pub fn random() -> Result<Self, IdentityError> {
        let mut bytes = [0u8; ORIGIN_LEN];
        fill_random(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// Raw origin bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ORIGIN_LEN] {
        &self.0
    }

    /// Lowercase hex form used as the subject common name.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Generate a self-signed certificate and private key with an all-zero origin.
///
/// See [`generate_self_signed_with_origin`] for the certificate layout.
///
/// # Errors
///
/// Returns [`IdentityError`] if randomness or key generation fails.
pub fn generate_self_signed()
-> Result<(CertificateDer<'static>, PrivateKeyDer<'static>), IdentityError> {
    generate_self_signed_with_origin(&Origin::default())
}

/// Generate a self-signed certificate and private key for `origin`.
///
/// The certificate carries:
/// - an ECDSA P-256 key, signed with ECDSA-SHA256 by that same key;
/// - a serial number drawn uniformly from `[0, 2^130)`;
/// - validity from now until now plus one calendar month;
/// - key usage `digitalSignature | keyEncipherment`, extended key usage
///   `clientAuth, serverAuth`;
/// - basic constraints with `CA = true`;
/// - subject common name set to the hex form of `origin`.
///
/// The private key is returned in PKCS#8 form.
///
/// # Errors
///
/// Returns [`IdentityError`] if randomness or key generation fails.
pub fn generate_self_signed_with_origin(
    origin: &Origin,
) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>), IdentityError> {
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;

    let not_before = OffsetDateTime::now_utc().replace_nanosecond(0)?;
    let not_after = add_one_month(not_before)?;

    let mut distinguished_name = rcgen::DistinguishedName::new();
    distinguished_name.push(rcgen::DnType::CommonName, origin.to_hex());

    let mut params = rcgen::CertificateParams::default();
    params.not_before = not_before;
    params.not_after = not_after;
    params.serial_number = Some(rcgen::SerialNumber::from_slice(&random_serial()?));
    params.distinguished_name = distinguished_name;
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![
        rcgen::KeyUsagePurpose::KeyEncipherment,
        rcgen::KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![
        rcgen::ExtendedKeyUsagePurpose::ClientAuth,
        rcgen::ExtendedKeyUsagePurpose::ServerAuth,
    ];

    let certificate = params.self_signed(&key_pair)?;
    let cert_der = certificate.der().clone();
    let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    tracing::debug!(
        origin = %origin.to_hex(),
        fingerprint = %fingerprint(&cert_der),
        "generated self-signed identity"
    );

    Ok((cert_der, key_der))
}

/// Lowercase hex SHA-256 digest of a DER certificate.
#[must_use]
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert.as_ref()))
}

/// Add one calendar month, normalising day overflow into the following month.
///
/// Jan 31 plus one month is Mar 3 (Mar 2 in leap years), matching ordinary
/// calendar arithmetic rather than clamping to the end of February.
pub(crate) fn add_one_month(at: OffsetDateTime) -> Result<OffsetDateTime, IdentityError> {
    let date = at.date();
    let month = date.month().next();
    let year = if month == Month::January {
        date.year() + 1
    } else {
        date.year()
    };
    let first = Date::from_calendar_date(year, month, 1)?;
    let shifted = first.saturating_add(time::Duration::days(i64::from(date.day()) - 1));
    Ok(at.replace_date(shifted))
}

/// Big-endian serial bytes, uniformly distributed below `2^130`, without
/// redundant leading zeros.
fn random_serial() -> Result<Vec<u8>, IdentityError> {
    let mut bytes = [0u8; SERIAL_BITS.div_ceil(8) as usize];
    fill_random(&mut bytes)?;
    bytes[0] &= (1u8 << (SERIAL_BITS % 8)) - 1;

    let first_nonzero = bytes
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(bytes.len() - 1);
    Ok(bytes[first_nonzero..].to_vec())
}

fn fill_random(buf: &mut [u8]) -> Result<(), IdentityError> {
    rand::rngs::OsRng
        .try_fill_bytes(buf)
        .map_err(|e| IdentityError::Randomness(e.to_string()))
}
