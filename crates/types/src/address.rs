use serde::{Deserialize, Serialize};

/// Errors that can occur when parsing an address string.
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("address must start with '0x'")]
    InvalidPrefix,
    #[error("address must be {expected} characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("address payload is not valid hexadecimal")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Number of raw bytes contained in an address.
pub const ADDRESS_BYTES: usize = 20;
/// Expected string length of an encoded address ("0x" + 40 hex chars).
pub const ADDRESS_STRING_LENGTH: usize = 2 + ADDRESS_BYTES * 2;

/// A 20-byte account identifier, derived from the blake3 hash of the
/// account's ed25519 verifying key.
///
/// Serialized as a `0x`-prefixed hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(pub [u8; ADDRESS_BYTES]);

impl Address {
    /// The all-zero address. Never a valid sender.
    pub const NULL: Address = Address([0u8; ADDRESS_BYTES]);

    /// Derive an address from an ed25519 verifying key's raw bytes.
    pub fn from_pubkey(pubkey: &[u8; 32]) -> Self {
        let digest = blake3::hash(pubkey);
        let mut bytes = [0u8; ADDRESS_BYTES];
        bytes.copy_from_slice(&digest.as_bytes()[..ADDRESS_BYTES]);
        Address(bytes)
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_BYTES] {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl From<[u8; ADDRESS_BYTES]> for Address {
    fn from(value: [u8; ADDRESS_BYTES]) -> Self {
        Address(value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        decode_address(&value).map(Address)
    }
}

impl std::str::FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_address(s).map(Address)
    }
}

/// Attempt to decode a `0x`-prefixed hex address string into raw bytes.
pub fn decode_address(address: &str) -> Result<[u8; ADDRESS_BYTES], AddressError> {
    if !address.starts_with("0x") {
        return Err(AddressError::InvalidPrefix);
    }

    if address.len() != ADDRESS_STRING_LENGTH {
        return Err(AddressError::InvalidLength {
            expected: ADDRESS_STRING_LENGTH,
            actual: address.len(),
        });
    }

    let decoded = hex::decode(&address[2..])?;
    let mut bytes = [0u8; ADDRESS_BYTES];
    bytes.copy_from_slice(&decoded);
    Ok(bytes)
}
