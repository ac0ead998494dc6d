//! Symmetric primitives shared by PACE, chip authentication and secure
//! messaging: the TR-03110 key derivation function, AES-CBC in the two
//! padding modes the protocols need, and truncated AES-CMAC.

use aes::cipher::{
    BlockCipher, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit,
    block_padding::{Iso7816, NoPadding, Padding},
};
use aes::{Aes128, Aes192, Aes256};
use cmac::digest::typenum::{IsLess, Le, NonZero, U256};
use cmac::{Cmac, Mac};
use dbl::Dbl;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::oid::Oid;

/// AES block size used throughout secure messaging
pub const BLOCK_LEN: usize = 16;

/// Key derivation counter per TR-03110 A.2.3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    /// K_enc, counter 1
    Encryption,
    /// K_mac, counter 2
    Authentication,
    /// K_pi, counter 3
    Password,
}

impl KeyPurpose {
    const fn counter(self) -> u32 {
        match self {
            Self::Encryption => 1,
            Self::Authentication => 2,
            Self::Password => 3,
        }
    }
}

/// The AES flavor of a negotiated cipher suite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymmetricSuite {
    /// AES-128-CBC with CMAC, keys derived through SHA-1
    Aes128,
    /// AES-192-CBC with CMAC, keys derived through SHA-256
    Aes192,
    /// AES-256-CBC with CMAC, keys derived through SHA-256
    Aes256,
}

impl SymmetricSuite {
    /// Resolve the suite announced by a PACEInfo protocol identifier
    pub fn for_pace_protocol(protocol: &Oid) -> Result<Self> {
        if *protocol == Oid::PACE_ECDH_GM_AES_CBC_CMAC_128 {
            Ok(Self::Aes128)
        } else if *protocol == Oid::PACE_ECDH_GM_AES_CBC_CMAC_192 {
            Ok(Self::Aes192)
        } else if *protocol == Oid::PACE_ECDH_GM_AES_CBC_CMAC_256 {
            Ok(Self::Aes256)
        } else {
            Err(Error::UnsupportedProtocol(protocol.to_string()))
        }
    }

    /// Resolve the suite announced by a ChipAuthenticationInfo identifier
    pub fn for_chip_authentication_protocol(protocol: &Oid) -> Result<Self> {
        if *protocol == Oid::CA_ECDH_AES_CBC_CMAC_128 {
            Ok(Self::Aes128)
        } else if *protocol == Oid::CA_ECDH_AES_CBC_CMAC_192 {
            Ok(Self::Aes192)
        } else if *protocol == Oid::CA_ECDH_AES_CBC_CMAC_256 {
            Ok(Self::Aes256)
        } else {
            Err(Error::UnsupportedProtocol(protocol.to_string()))
        }
    }

    /// Key length in bytes
    pub const fn key_len(self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }

    /// KDF(K, [r], c): hash the secret, an optional nonce and the 32-bit
    /// counter, truncated to the suite's key length
    pub fn derive_key(
        self,
        secret: &[u8],
        nonce: Option<&[u8]>,
        purpose: KeyPurpose,
    ) -> Zeroizing<Vec<u8>> {
        let counter = purpose.counter().to_be_bytes();
        let digest: Zeroizing<Vec<u8>> = match self {
            Self::Aes128 => {
                let mut hasher = Sha1::new();
                hasher.update(secret);
                if let Some(nonce) = nonce {
                    hasher.update(nonce);
                }
                hasher.update(counter);
                Zeroizing::new(hasher.finalize().to_vec())
            }
            Self::Aes192 | Self::Aes256 => {
                let mut hasher = Sha256::new();
                hasher.update(secret);
                if let Some(nonce) = nonce {
                    hasher.update(nonce);
                }
                hasher.update(counter);
                Zeroizing::new(hasher.finalize().to_vec())
            }
        };
        Zeroizing::new(digest[..self.key_len()].to_vec())
    }

    /// KDF_pi: derive the password key from the password bytes
    pub fn derive_password_key(self, password: &[u8]) -> Zeroizing<Vec<u8>> {
        self.derive_key(password, None, KeyPurpose::Password)
    }

    /// AES-CBC encryption without padding; `data` must be block aligned
    pub fn encrypt_cbc(self, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        if !data.len().is_multiple_of(BLOCK_LEN) {
            return Err(Error::Crypto("plaintext not block aligned"));
        }
        match self {
            Self::Aes128 => cbc_encrypt::<Aes128, NoPadding>(key, iv, data),
            Self::Aes192 => cbc_encrypt::<Aes192, NoPadding>(key, iv, data),
            Self::Aes256 => cbc_encrypt::<Aes256, NoPadding>(key, iv, data),
        }
    }

    /// AES-CBC decryption without padding; `data` must be block aligned
    pub fn decrypt_cbc(self, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if !data.len().is_multiple_of(BLOCK_LEN) {
            return Err(Error::Crypto("ciphertext not block aligned"));
        }
        match self {
            Self::Aes128 => cbc_decrypt::<Aes128, NoPadding>(key, iv, data),
            Self::Aes192 => cbc_decrypt::<Aes192, NoPadding>(key, iv, data),
            Self::Aes256 => cbc_decrypt::<Aes256, NoPadding>(key, iv, data),
        }
    }

    /// AES-CBC encryption with ISO 7816-4 padding
    pub fn encrypt_cbc_padded(self, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Aes128 => cbc_encrypt::<Aes128, Iso7816>(key, iv, data),
            Self::Aes192 => cbc_encrypt::<Aes192, Iso7816>(key, iv, data),
            Self::Aes256 => cbc_encrypt::<Aes256, Iso7816>(key, iv, data),
        }
    }

    /// AES-CBC decryption removing ISO 7816-4 padding
    pub fn decrypt_cbc_padded(self, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if !data.len().is_multiple_of(BLOCK_LEN) {
            return Err(Error::Crypto("ciphertext not block aligned"));
        }
        match self {
            Self::Aes128 => cbc_decrypt::<Aes128, Iso7816>(key, iv, data),
            Self::Aes192 => cbc_decrypt::<Aes192, Iso7816>(key, iv, data),
            Self::Aes256 => cbc_decrypt::<Aes256, Iso7816>(key, iv, data),
        }
    }

    /// Encrypt a single block in ECB mode (send sequence counter to IV)
    pub fn encrypt_block(self, key: &[u8], block: &[u8; BLOCK_LEN]) -> Result<[u8; BLOCK_LEN]> {
        match self {
            Self::Aes128 => ecb_encrypt_block::<Aes128>(key, block),
            Self::Aes192 => ecb_encrypt_block::<Aes192>(key, block),
            Self::Aes256 => ecb_encrypt_block::<Aes256>(key, block),
        }
    }

    /// Full 16-byte AES-CMAC
    pub fn cmac(self, key: &[u8], data: &[u8]) -> Result<[u8; BLOCK_LEN]> {
        match self {
            Self::Aes128 => compute_cmac::<Aes128>(key, data),
            Self::Aes192 => compute_cmac::<Aes192>(key, data),
            Self::Aes256 => compute_cmac::<Aes256>(key, data),
        }
    }

    /// AES-CMAC truncated to 8 bytes, the authentication token and secure
    /// messaging checksum length
    pub fn cmac8(self, key: &[u8], data: &[u8]) -> Result<[u8; 8]> {
        let full = self.cmac(key, data)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(&full[..8]);
        Ok(out)
    }
}

fn cbc_encrypt<C, P>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>>
where
    C: BlockCipher + BlockEncryptMut + KeyInit,
    P: Padding<C::BlockSize>,
{
    let encryptor = cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::Crypto("invalid key or iv length"))?;
    Ok(encryptor.encrypt_padded_vec_mut::<P>(data))
}

fn cbc_decrypt<C, P>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Zeroizing<Vec<u8>>>
where
    C: BlockCipher + BlockDecryptMut + KeyInit,
    P: Padding<C::BlockSize>,
{
    let decryptor = cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::Crypto("invalid key or iv length"))?;
    let plaintext = decryptor.decrypt_padded_vec_mut::<P>(data)?;
    Ok(Zeroizing::new(plaintext))
}

fn ecb_encrypt_block<C>(key: &[u8], block: &[u8; BLOCK_LEN]) -> Result<[u8; BLOCK_LEN]>
where
    C: BlockCipher + BlockEncrypt + KeyInit,
{
    let cipher = C::new_from_slice(key).map_err(|_| Error::Crypto("invalid key length"))?;
    let mut buf = aes::cipher::Block::<C>::clone_from_slice(block);
    cipher.encrypt_block(&mut buf);
    let mut out = [0u8; BLOCK_LEN];
    out.copy_from_slice(&buf);
    Ok(out)
}

fn compute_cmac<C>(key: &[u8], data: &[u8]) -> Result<[u8; BLOCK_LEN]>
where
    C: BlockCipher + BlockEncrypt + KeyInit + Clone,
    aes::cipher::Block<C>: Dbl,
    C::BlockSize: IsLess<U256>,
    Le<C::BlockSize, U256>: NonZero,
{
    let mut mac =
        <Cmac<C> as Mac>::new_from_slice(key).map_err(|_| Error::Crypto("invalid key length"))?;
    mac.update(data);
    let mut out = [0u8; BLOCK_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}
