//! ISO 7816-4 secure messaging per TR-03110 part 3, appendix F
//!
//! [`EacSecureChannel`] layers over a transport: command data is encrypted
//! into a 0x87 cryptogram, the expected length echoed in 0x97 and the whole
//! protected APDU authenticated by a 0x8E checksum; responses are verified
//! and decrypted on the way back up. Protocol steps keep driving plaintext
//! commands and never see the enveloping.
//!
//! The channel starts as a transparent passthrough. A protocol run that
//! negotiates session keys installs them with [`EacSecureChannel::install`];
//! chip authentication later swaps them in place with
//! [`EacSecureChannel::replace_keys`].

use core::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use subtle::ConstantTimeEq;
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use perso_apdu_core::{
    CardTransport, Command, ExpectedLength, SecureChannel, SecurityLevel, StatusWord,
};

use crate::crypto::sym::{BLOCK_LEN, KeyPurpose, SymmetricSuite};
use crate::error::{Error, Result};
use crate::tlv::{TlvArena, encode};

/// Secure messaging indication in the class byte (command header included in
/// the checksum)
pub const CLA_SECURE_MESSAGING: u8 = 0x0C;

// Data object tags of a protected APDU.
const DO_CRYPTOGRAM: u32 = 0x87;
const DO_EXPECTED_LENGTH: u32 = 0x97;
const DO_PROCESSING_STATUS: u32 = 0x99;
const DO_CHECKSUM: u32 = 0x8E;

/// Padding indicator prefix of the cryptogram object
const PADDING_INDICATOR: u8 = 0x01;

/// Cryptographic operations of one secure messaging context.
///
/// The send sequence counter is fed in per call, so implementations hold key
/// material only; the channel owns the counter state.
pub trait SecureMessaging: fmt::Debug + Send {
    /// Cipher block length; padding and the counter width follow it
    fn block_len(&self) -> usize;

    /// Encrypt a command data field under the given send sequence counter
    fn encrypt(&self, ssc: u128, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt a response cryptogram under the given send sequence counter
    fn decrypt(&self, ssc: u128, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>>;

    /// Eight-byte cryptographic checksum over `data`
    fn mac(&self, data: &[u8]) -> Result<[u8; 8]>;
}

/// Session keys negotiated by a key agreement, scrubbed on drop
pub struct SessionKeys {
    suite: SymmetricSuite,
    k_enc: Zeroizing<Vec<u8>>,
    k_mac: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("suite", &self.suite)
            .finish_non_exhaustive()
    }
}

impl SessionKeys {
    /// Wrap existing key material
    pub const fn new(
        suite: SymmetricSuite,
        k_enc: Zeroizing<Vec<u8>>,
        k_mac: Zeroizing<Vec<u8>>,
    ) -> Self {
        Self { suite, k_enc, k_mac }
    }

    /// Derive the encryption and authentication keys from a shared secret,
    /// mixing in a nonce when the protocol supplies one (KDF counters 1 and 2)
    pub fn derive(suite: SymmetricSuite, secret: &[u8], nonce: Option<&[u8]>) -> Self {
        Self {
            suite,
            k_enc: suite.derive_key(secret, nonce, KeyPurpose::Encryption),
            k_mac: suite.derive_key(secret, nonce, KeyPurpose::Authentication),
        }
    }

    /// Negotiated AES flavor
    pub const fn suite(&self) -> SymmetricSuite {
        self.suite
    }
}

impl SecureMessaging for SessionKeys {
    fn block_len(&self) -> usize {
        BLOCK_LEN
    }

    fn encrypt(&self, ssc: u128, plaintext: &[u8]) -> Result<Vec<u8>> {
        // The IV is the encrypted counter, per TR-03110 F.3.
        let iv = self.suite.encrypt_block(&self.k_enc, &ssc.to_be_bytes())?;
        self.suite.encrypt_cbc_padded(&self.k_enc, &iv, plaintext)
    }

    fn decrypt(&self, ssc: u128, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let iv = self.suite.encrypt_block(&self.k_enc, &ssc.to_be_bytes())?;
        self.suite.decrypt_cbc_padded(&self.k_enc, &iv, ciphertext)
    }

    fn mac(&self, data: &[u8]) -> Result<[u8; 8]> {
        self.suite.cmac8(&self.k_mac, data)
    }
}

/// ISO 7816-4 padding, always appended (a full extra block on aligned input)
fn pad(data: &[u8]) -> Vec<u8> {
    let mut padded = Vec::with_capacity(data.len() + BLOCK_LEN);
    padded.extend_from_slice(data);
    padded.push(0x80);
    padded.resize(padded.len().next_multiple_of(BLOCK_LEN), 0x00);
    padded
}

/// Secure messaging wrapper over a card transport.
///
/// While no keys are installed, commands pass through unchanged (the key
/// agreement itself runs in plaintext). Once established, every command is
/// wrapped and every response verified; any failure in either direction
/// discards the keys so a broken channel cannot keep talking half-protected.
pub struct EacSecureChannel<T: CardTransport> {
    transport: T,
    keys: Option<SessionKeys>,
    /// Send sequence counter, stepped before each wrap and each unwrap
    ssc: u128,
    security: SecurityLevel,
}

impl<T: CardTransport> fmt::Debug for EacSecureChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EacSecureChannel")
            .field("established", &self.keys.is_some())
            .field("security", &self.security)
            .field("ssc", &self.ssc)
            .finish_non_exhaustive()
    }
}

impl<T: CardTransport> EacSecureChannel<T> {
    /// Wrap a transport; the channel stays a passthrough until keys arrive
    pub const fn new(transport: T) -> Self {
        Self {
            transport,
            keys: None,
            ssc: 0,
            security: SecurityLevel::none(),
        }
    }

    /// Install freshly negotiated session keys and restart the counter.
    ///
    /// Commands are protected from the next exchange on; the channel reports
    /// encryption and integrity but not yet an authenticated chip.
    pub fn install(&mut self, keys: SessionKeys) {
        debug!(suite = ?keys.suite(), "Installing secure messaging keys");
        self.keys = Some(keys);
        self.ssc = 0;
        self.security = SecurityLevel::enc_mac();
    }

    /// Swap the session keys in place, restarting the counter.
    ///
    /// Chip authentication replaces the password-derived keys with
    /// chip-authenticated ones without reopening the channel.
    pub fn replace_keys(&mut self, keys: SessionKeys) {
        debug!(suite = ?keys.suite(), "Replacing secure messaging keys");
        self.keys = Some(keys);
        self.ssc = 0;
        self.security = SecurityLevel::authenticated_enc_mac();
    }

    /// Negotiated keys, while established
    pub const fn session_keys(&self) -> Option<&SessionKeys> {
        self.keys.as_ref()
    }

    fn invalidate(&mut self) {
        self.keys = None;
        self.ssc = 0;
        self.security = SecurityLevel::none();
    }

    fn exchange(&mut self, command: &[u8]) -> Result<Bytes> {
        let wrapped = self.wrap_command(command)?;
        trace!(bytes = %hex::encode(&wrapped), "Protected command");
        let response = self.transport.transmit_raw(&wrapped)?;
        trace!(bytes = %hex::encode(&response), "Protected response");
        self.unwrap_response(&response)
    }

    fn wrap_command(&mut self, raw: &[u8]) -> Result<Bytes> {
        let command = Command::from_bytes(raw)?;
        if command.class() & CLA_SECURE_MESSAGING != 0 {
            return Err(Error::SecureMessaging(
                "command already carries secure messaging class bits",
            ));
        }
        let keys = self
            .keys
            .as_ref()
            .ok_or(Error::InvalidProtocolState("no secure messaging keys"))?;
        self.ssc += 1;

        let header = [
            command.class() | CLA_SECURE_MESSAGING,
            command.instruction(),
            command.p1(),
            command.p2(),
        ];

        let mut objects = BytesMut::new();
        if let Some(data) = command.data() {
            let cryptogram = keys.encrypt(self.ssc, data)?;
            let mut value = Vec::with_capacity(1 + cryptogram.len());
            value.push(PADDING_INDICATOR);
            value.extend_from_slice(&cryptogram);
            objects.put_slice(&encode(DO_CRYPTOGRAM, &value));
        }
        if let Some(le) = command.expected_length() {
            objects.put_slice(&encode(DO_EXPECTED_LENGTH, &le_field(&command, le)));
        }

        let mut mac_input = Vec::with_capacity(2 * BLOCK_LEN + objects.len() + BLOCK_LEN);
        mac_input.extend_from_slice(&self.ssc.to_be_bytes());
        mac_input.extend_from_slice(&pad(&header));
        if !objects.is_empty() {
            mac_input.extend_from_slice(&pad(&objects));
        }
        let checksum = keys.mac(&mac_input)?;
        objects.put_slice(&encode(DO_CHECKSUM, &checksum));

        // Responses grow under encryption, so a command that expects data
        // always requests the extended maximum.
        let extended = objects.len() > 0xFF || command.expected_length().is_some();
        let mut out = BytesMut::with_capacity(4 + 3 + objects.len() + 2);
        out.put_slice(&header);
        if extended {
            out.put_u8(0x00);
            out.put_u16(objects.len() as u16);
            out.put_slice(&objects);
            out.put_u16(0x0000);
        } else {
            out.put_u8(objects.len() as u8);
            out.put_slice(&objects);
            out.put_u8(0x00);
        }
        Ok(out.freeze())
    }

    fn unwrap_response(&mut self, raw: &[u8]) -> Result<Bytes> {
        if raw.len() < 2 {
            return Err(Error::SecureMessaging("response without a status trailer"));
        }
        let (body, trailer) = raw.split_at(raw.len() - 2);
        let status = StatusWord::new(trailer[0], trailer[1]);
        // 6987/6988: the card refused the protected command outright; such
        // responses carry no data objects.
        if status.to_u16() == 0x6987 || status.to_u16() == 0x6988 {
            return Err(Error::SecureMessaging(
                "card rejected the secure messaging objects",
            ));
        }
        let keys = self
            .keys
            .as_ref()
            .ok_or(Error::InvalidProtocolState("no secure messaging keys"))?;
        self.ssc += 1;

        // Strict object order: optional cryptogram, status, checksum, end.
        let arena = TlvArena::parse(Bytes::copy_from_slice(body))?;
        let mut reader = arena.root_reader();
        let cryptogram = reader.accept(DO_CRYPTOGRAM);
        let status_object = reader.expect(DO_PROCESSING_STATUS, "protected status object")?;
        let checksum_object = reader.expect(DO_CHECKSUM, "checksum object")?;
        if reader.peek(0).is_some() {
            return Err(Error::SecureMessaging("data objects after the checksum"));
        }

        let mut objects = Vec::with_capacity(body.len());
        if let Some(id) = cryptogram {
            objects.extend_from_slice(&arena.serialize(id));
        }
        objects.extend_from_slice(&arena.serialize(status_object));

        let mut mac_input = Vec::with_capacity(BLOCK_LEN + objects.len() + BLOCK_LEN);
        mac_input.extend_from_slice(&self.ssc.to_be_bytes());
        mac_input.extend_from_slice(&pad(&objects));
        let expected = keys.mac(&mac_input)?;

        let received = arena.value(checksum_object);
        if received.len() != 8 || !bool::from(expected.ct_eq(received)) {
            return Err(Error::SecureMessaging("response checksum mismatch"));
        }
        if arena.value(status_object) != trailer {
            return Err(Error::SecureMessaging(
                "protected status does not match the trailer",
            ));
        }

        let mut out = BytesMut::with_capacity(body.len());
        if let Some(id) = cryptogram {
            match arena.value(id).split_first() {
                Some((&PADDING_INDICATOR, ciphertext)) => {
                    let plaintext = keys.decrypt(self.ssc, ciphertext)?;
                    out.put_slice(&plaintext);
                }
                _ => return Err(Error::SecureMessaging("unsupported padding indicator")),
            }
        }
        out.put_slice(trailer);
        Ok(out.freeze())
    }
}

/// Le bytes carried in the protected length object: one byte in short form,
/// two in extended form. The leading zero marker of the plain encoding is
/// not part of the object value.
fn le_field(command: &Command, le: ExpectedLength) -> Vec<u8> {
    let extended = command.data().is_some_and(|d| d.len() > 255) || le > 256;
    if extended {
        le.to_be_bytes().to_vec()
    } else {
        vec![(le & 0xFF) as u8]
    }
}

impl<T: CardTransport> CardTransport for EacSecureChannel<T> {
    fn transmit_raw(&mut self, command: &[u8]) -> core::result::Result<Bytes, perso_apdu_core::Error> {
        if self.keys.is_none() {
            return self.transport.transmit_raw(command);
        }
        match self.exchange(command) {
            Ok(response) => Ok(response),
            Err(error) => {
                warn!(%error, "Secure messaging failure, discarding the channel");
                self.invalidate();
                Err(match error {
                    Error::DispatchFailure(inner) => inner,
                    Error::SecureMessaging(message) => {
                        perso_apdu_core::Error::SecureMessaging(message)
                    }
                    _ => perso_apdu_core::Error::SecureMessaging("response verification failed"),
                })
            }
        }
    }

    fn reset(&mut self) -> core::result::Result<(), perso_apdu_core::Error> {
        self.invalidate();
        self.transport.reset()
    }

    fn security_level(&self) -> SecurityLevel {
        self.security
    }
}

impl<T: CardTransport> SecureChannel for EacSecureChannel<T> {
    type UnderlyingTransport = T;

    fn transport(&self) -> &T {
        &self.transport
    }

    fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    // Establishment happens through a protocol run installing keys; the
    // channel cannot negotiate them itself.
    fn open(&mut self) -> core::result::Result<(), perso_apdu_core::Error> {
        if self.is_established() {
            Ok(())
        } else {
            Err(perso_apdu_core::Error::SecureChannelNotEstablished)
        }
    }

    fn is_established(&self) -> bool {
        self.keys.is_some()
    }

    fn close(&mut self) -> core::result::Result<(), perso_apdu_core::Error> {
        debug!("Closing secure messaging channel");
        self.invalidate();
        Ok(())
    }

    fn security_level(&self) -> SecurityLevel {
        self.security
    }
}
