//! Card flows driven end to end through the public surface: session
//! establishment, a PACE run on the ICAO Doc 9303 worked example, both
//! extended-access-control calls through the service access layer, and PIN
//! comparison with its retry grading.
//!
//! The card side of every protected exchange is rebuilt here from the
//! published session keys, so one byte out of place in the wrapping, the
//! counter bookkeeping or the key derivation breaks a checksum and fails
//! the whole flow.

use bytes::Bytes;
use hex_literal::hex;
use rand::RngCore;
use zeroize::Zeroizing;

use perso_eac::crypto::sym::SymmetricSuite;
use perso_eac::cvc::Role;
use perso_eac::dispatch::EacProtocol;
use perso_eac::tlv::{Tag, TlvWriter, encode};
use perso_eac::{
    AuthenticationData, AuthenticationResponse, CardSession, CardTransport,
    CardVerifiableCertificate, CvcDate, DidAuthenticateRequest, EAC_PROTOCOL, Eac1Input, Eac2Input,
    Error, Oid, PIN_COMPARE_PROTOCOL, PacePassword, PinInput, ProtocolRegistry, Sal, SecureChannel,
    SecureMessaging, SessionKeys,
};

#[derive(Debug, Default)]
struct ScriptedTransport {
    responses: Vec<Bytes>,
    commands: Vec<Bytes>,
}

impl ScriptedTransport {
    fn new(responses: Vec<Bytes>) -> Self {
        Self {
            responses,
            commands: Vec::new(),
        }
    }
}

impl CardTransport for ScriptedTransport {
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, perso_apdu_core::Error> {
        self.commands.push(Bytes::copy_from_slice(command));
        if self.responses.is_empty() {
            return Err(perso_apdu_core::Error::TransmissionFailed);
        }
        Ok(self.responses.remove(0))
    }

    fn reset(&mut self) -> Result<(), perso_apdu_core::Error> {
        Ok(())
    }
}

/// Replays scripted scalars into `generate_keypair`
struct ScalarQueue(Vec<[u8; 32]>);

impl RngCore for ScalarQueue {
    fn next_u32(&mut self) -> u32 {
        unreachable!("scalars are drawn via fill_bytes")
    }

    fn next_u64(&mut self) -> u64 {
        unreachable!("scalars are drawn via fill_bytes")
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        assert!(!self.0.is_empty(), "scalar queue exhausted");
        dest.copy_from_slice(&self.0.remove(0));
    }
}

/// Routes channel traces into the test harness when `RUST_LOG` asks for them
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Worked example from ICAO Doc 9303 part 11 appendix G-1: PACE with generic
// mapping on brainpoolP256r1, keyed on an MRZ.

const MRZ: &[u8] = b"T22000129364081251010318";
const MAPPING_PRIVATE: [u8; 32] =
    hex!("7F4EF07B9EA82FD78AD689B38D0BC78CF21F249D953BC46F4C6E19259C010F99");
const EPHEMERAL_PRIVATE: [u8; 32] =
    hex!("A73FB703AC1436A18E0CFA5ABB3F7BEC7A070E7A6788486BEE230C4A22762595");
const CARD_MAPPING_PUBLIC: [u8; 65] = hex!(
    "04"
    "824FBA91C9CBE26BEF53A0EBE7342A3BF178CEA9F45DE0B70AA601651FBA3F57"
    "30D8C879AAA9C9F73991E61B58F4D52EB87A0A0C709A49DC63719363CCD13C54"
);
const CARD_EPHEMERAL_PUBLIC: [u8; 65] = hex!(
    "04"
    "9E880F842905B8B3181F7AF7CAA9F0EFB743847F44A306D2D28C1D9EC65DF6DB"
    "7764B22277A2EDDC3C265A9F018F9CB852E111B768B326904B59A0193776F094"
);
const ENCRYPTED_NONCE: [u8; 16] = hex!("95A3A016522EE98D01E76CB6B98B42C3");
const TOKEN_PICC: [u8; 8] = hex!("3ABB9674BCE93C08");
const PACE_SESSION_ENC: [u8; 16] = hex!("F5F0E35C0D7161EE6724EE513A0D9A7F");
const PACE_SESSION_MAC: [u8; 16] = hex!("FE251C7858B356B24514B3BD5F4297D1");

// Chip authentication companion on the same curve: the chip's static pair is
// the appendix mapping pair and the terminal redraws the appendix ephemeral
// scalar, with token and session keys cross-computed independently.

const CHIP_STATIC_PUBLIC: [u8; 65] = hex!(
    "04"
    "7ACF3EFC982EC45565A4B155129EFBC74650DCBFA6362D896FC70262E0C2CC5E"
    "544552DCB6725218799115B55C9BAA6D9F6BC3A9618E70C25AF71777A9C4922D"
);
const CHIP_NONCE: [u8; 8] = hex!("0011223344556677");
const CHIP_TOKEN: [u8; 8] = hex!("D04F789BED980233");
const CA_SESSION_ENC: [u8; 16] = hex!("C7F9F92F6D56DF53925529067551C9CE");
const CA_SESSION_MAC: [u8; 16] = hex!("4926C2862DD576E524A7CFBEDA4AB753");

const CHALLENGE: [u8; 8] = hex!("FEDCBA9876543210");
const CVCA_CAR: &str = "DECVCA00001";
const DV_CAR: &str = "DEDVCA00001";
const TERMINAL_CHR: &str = "DETERM00001";

fn session_keys(enc: [u8; 16], mac: [u8; 16]) -> SessionKeys {
    SessionKeys::new(
        SymmetricSuite::Aes128,
        Zeroizing::new(enc.to_vec()),
        Zeroizing::new(mac.to_vec()),
    )
}

fn mrz_password() -> PacePassword {
    let mut buffer = MRZ.to_vec();
    PacePassword::mrz(&mut buffer)
}

/// EF.CardAccess announcing PACE alone
fn minimal_card_access() -> Vec<u8> {
    let mut writer = TlvWriter::new();
    writer.constructed(0x31, |w| {
        w.constructed(0x30, |w| {
            w.primitive(0x06, Oid::PACE_ECDH_GM_AES_CBC_CMAC_128.encoded());
            w.primitive(0x02, &[0x02]);
            w.primitive(0x02, &[0x0D]);
        });
    });
    writer.into_bytes().to_vec()
}

/// EF.CardAccess of an eID card: PACE, terminal and chip authentication
/// announced together, domain parameters from the standardized table
fn eid_card_access() -> Vec<u8> {
    let mut writer = TlvWriter::new();
    writer.constructed(0x31, |w| {
        w.constructed(0x30, |w| {
            w.primitive(0x06, Oid::PACE_ECDH_GM_AES_CBC_CMAC_128.encoded());
            w.primitive(0x02, &[0x02]);
            w.primitive(0x02, &[0x0D]);
        });
        w.constructed(0x30, |w| {
            w.primitive(0x06, Oid::TA.encoded());
            w.primitive(0x02, &[0x02]);
        });
        w.constructed(0x30, |w| {
            w.primitive(0x06, Oid::CA_ECDH_AES_CBC_CMAC_128.encoded());
            w.primitive(0x02, &[0x02]);
            w.primitive(0x02, &[0x41]);
        });
        w.constructed(0x30, |w| {
            w.primitive(0x06, Oid::CA_ECDH.encoded());
            w.constructed(0x30, |w| {
                w.primitive(0x06, Oid::STANDARDIZED_DOMAIN_PARAMETERS.encoded());
                w.primitive(0x02, &[0x0D]);
            });
            w.primitive(0x02, &[0x41]);
        });
    });
    writer.into_bytes().to_vec()
}

/// EF.CardSecurity carrying the chip's static key agreement key
fn card_security_file() -> Vec<u8> {
    let mut writer = TlvWriter::new();
    writer.constructed(0x31, |w| {
        w.constructed(0x30, |w| {
            w.primitive(0x06, Oid::CA_ECDH_AES_CBC_CMAC_128.encoded());
            w.primitive(0x02, &[0x02]);
            w.primitive(0x02, &[0x41]);
        });
        w.constructed(0x30, |w| {
            w.primitive(0x06, Oid::CA_ECDH.encoded());
            w.constructed(0x30, |w| {
                w.primitive(0x06, Oid::STANDARDIZED_DOMAIN_PARAMETERS.encoded());
                w.primitive(0x02, &[0x0D]);
            });
            w.primitive(0x02, &[0x41]);
        });
        w.constructed(0x30, |w| {
            w.primitive(0x06, Oid::PK_ECDH.encoded());
            w.constructed(0x30, |w| {
                w.constructed(0x30, |w| {
                    w.primitive(0x06, Oid::STANDARDIZED_DOMAIN_PARAMETERS.encoded());
                    w.primitive(0x02, &[0x0D]);
                });
                let mut bit_string = vec![0x00];
                bit_string.extend_from_slice(&CHIP_STATIC_PUBLIC);
                w.primitive(0x03, &bit_string);
            });
            w.primitive(0x02, &[0x41]);
        });
    });
    writer.into_bytes().to_vec()
}

/// A parseable certificate around the fixed test key and signature bytes
fn certificate(
    car: &str,
    chr: &str,
    chat_data: [u8; 5],
    effective: CvcDate,
    expiration: CvcDate,
) -> CardVerifiableCertificate {
    let mut w = TlvWriter::new();
    w.constructed(Tag::CV_CERTIFICATE, |w| {
        w.constructed(Tag::CERTIFICATE_BODY, |w| {
            w.primitive(0x5F29, &[0x00]);
            w.primitive(0x42, car.as_bytes());
            w.constructed(Tag::PUBLIC_KEY, |w| {
                w.primitive(0x06, Oid::TA_ECDSA_SHA_256.encoded());
                w.primitive(0x86, &[0x04; 65]);
            });
            w.primitive(0x5F20, chr.as_bytes());
            w.constructed(Tag::CHAT, |w| {
                w.primitive(0x06, Oid::TERMINAL_TYPE_AT.encoded());
                w.primitive(0x53, &chat_data);
            });
            w.primitive(0x5F25, &effective.encode());
            w.primitive(0x5F24, &expiration.encode());
        });
        w.primitive(0x5F37, &[0xAB; 64]);
    });
    CardVerifiableCertificate::parse(w.into_bytes()).unwrap()
}

/// Master file selection and the EF.CardAccess listing served at connect
fn connect_script(card_access: &[u8]) -> Vec<Bytes> {
    let mut listing = card_access.to_vec();
    listing.extend_from_slice(&hex!("9000"));
    vec![
        Bytes::from_static(&hex!("9000")),
        Bytes::from_static(&hex!("9000")),
        Bytes::from(listing),
        Bytes::from_static(&hex!("6B00")),
    ]
}

fn ga_response(tag: u32, content: &[u8]) -> Bytes {
    let mut payload = encode(Tag::DYNAMIC_AUTHENTICATION_DATA, &encode(tag, content)).to_vec();
    payload.extend_from_slice(&[0x90, 0x00]);
    Bytes::from(payload)
}

/// The card's five PACE responses, volunteering its trust point in the last
/// one when `trusted_car` is given
fn pace_script(trusted_car: Option<&str>) -> Vec<Bytes> {
    let mut writer = TlvWriter::new();
    writer.constructed(Tag::DYNAMIC_AUTHENTICATION_DATA, |w| {
        w.primitive(0x86, &TOKEN_PICC);
        if let Some(car) = trusted_car {
            w.primitive(0x87, car.as_bytes());
        }
    });
    let mut last = writer.into_bytes().to_vec();
    last.extend_from_slice(&[0x90, 0x00]);
    vec![
        Bytes::from_static(&hex!("9000")),
        ga_response(0x80, &ENCRYPTED_NONCE),
        ga_response(0x82, &CARD_MAPPING_PUBLIC),
        ga_response(0x84, &CARD_EPHEMERAL_PUBLIC),
        Bytes::from(last),
    ]
}

/// ISO 7816-4 padding to the AES block length, always appended
fn pad(data: &[u8]) -> Vec<u8> {
    let mut padded = data.to_vec();
    padded.push(0x80);
    padded.resize(padded.len().next_multiple_of(16), 0x00);
    padded
}

/// Card-side construction of one protected response at the given counter
fn protected(keys: &SessionKeys, ssc: u128, plaintext: Option<&[u8]>, status: [u8; 2]) -> Bytes {
    let mut objects = Vec::new();
    if let Some(plaintext) = plaintext {
        let mut value = vec![0x01];
        value.extend_from_slice(&keys.encrypt(ssc, plaintext).unwrap());
        objects.extend_from_slice(&encode(0x87, &value));
    }
    objects.extend_from_slice(&encode(0x99, &status));

    let mut mac_input = ssc.to_be_bytes().to_vec();
    mac_input.extend_from_slice(&pad(&objects));
    let checksum = keys.mac(&mac_input).unwrap();

    objects.extend_from_slice(&encode(0x8E, &checksum));
    objects.extend_from_slice(&status);
    Bytes::from(objects)
}

#[test]
fn test_pace_upgrade_protects_the_session() {
    init_tracing();
    let keys = session_keys(PACE_SESSION_ENC, PACE_SESSION_MAC);
    let mut responses = connect_script(&minimal_card_access());
    responses.extend(pace_script(None));
    responses.push(protected(&keys, 2, None, hex!("9000")));
    responses.push(protected(&keys, 4, Some(&hex!("D0D1D2D3")), hex!("9000")));
    responses.push(protected(&keys, 6, None, hex!("6B00")));

    let mut session = CardSession::connect(ScriptedTransport::new(responses)).unwrap();
    assert!(!session.is_secure());

    let mut scalars = ScalarQueue(vec![MAPPING_PRIVATE, EPHEMERAL_PRIVATE]);
    let output = session
        .establish_pace(&mrz_password(), None, &mut scalars)
        .unwrap();
    assert!(session.is_secure());
    assert_eq!(output.suite, SymmetricSuite::Aes128);
    assert_eq!(output.retry_counter, 3);
    assert_eq!(output.id_picc.as_ref(), &CARD_EPHEMERAL_PUBLIC[1..33]);
    assert_eq!(output.current_car, None);

    // A file read now travels wrapped and only verifies under exactly the
    // published session keys.
    let contents = session.read_file(0x0117).unwrap();
    assert_eq!(contents.as_ref(), hex!("D0D1D2D3"));

    let commands = &session.executor().transport().transport().commands;
    assert_eq!(commands.len(), 12);
    assert!(commands[9..].iter().all(|c| c[0] == 0x0C));
}

#[test]
fn test_eac_dispatch_drives_both_phases_under_secure_messaging() {
    init_tracing();
    let keys = session_keys(PACE_SESSION_ENC, PACE_SESSION_MAC);
    let security_file = card_security_file();

    let mut responses = connect_script(&eid_card_access());
    responses.extend(pace_script(Some(CVCA_CAR)));
    // Two certificates go down as MSE:Set DST plus verify pairs, then the
    // terminal announces itself, all under the PACE keys.
    for ssc in [2u128, 4, 6, 8, 10] {
        responses.push(protected(&keys, ssc, None, hex!("9000")));
    }
    responses.push(protected(&keys, 12, Some(&CHALLENGE), hex!("9000")));
    // Second call: signature check, EF.CardSecurity, chip authentication.
    responses.push(protected(&keys, 14, None, hex!("9000")));
    responses.push(protected(&keys, 16, None, hex!("9000")));
    responses.push(protected(&keys, 18, Some(&security_file), hex!("9000")));
    responses.push(protected(&keys, 20, None, hex!("6B00")));
    responses.push(protected(&keys, 22, None, hex!("9000")));
    let mut writer = TlvWriter::new();
    writer.constructed(Tag::DYNAMIC_AUTHENTICATION_DATA, |w| {
        w.primitive(0x81, &CHIP_NONCE);
        w.primitive(0x82, &CHIP_TOKEN);
    });
    let chip_response = writer.into_bytes().to_vec();
    responses.push(protected(&keys, 24, Some(&chip_response), hex!("9000")));

    let session = CardSession::connect(ScriptedTransport::new(responses)).unwrap();
    let mut registry: ProtocolRegistry<ScriptedTransport> = ProtocolRegistry::new();
    registry.register(EAC_PROTOCOL, || {
        // PACE mapping and ephemeral scalars, then the chip authentication
        // ephemeral.
        Box::new(EacProtocol::new(ScalarQueue(vec![
            MAPPING_PRIVATE,
            EPHEMERAL_PRIVATE,
            EPHEMERAL_PRIVATE,
        ])))
    });
    let mut sal = Sal::new(session, registry);

    let terminal = certificate(
        DV_CAR,
        TERMINAL_CHR,
        [0x00, 0x00, 0x00, 0x01, 0x00],
        CvcDate::new(2026, 6, 1),
        CvcDate::new(2027, 6, 1),
    );
    let response = sal
        .did_authenticate(
            EAC_PROTOCOL,
            DidAuthenticateRequest {
                did: "EAC.eID".into(),
                data: AuthenticationData::Eac1(Eac1Input {
                    password: mrz_password(),
                    certificates: vec![
                        terminal.clone(),
                        certificate(
                            CVCA_CAR,
                            CVCA_CAR,
                            [0xC0, 0x00, 0x00, 0x00, 0x00],
                            CvcDate::new(2024, 1, 1),
                            CvcDate::new(2030, 1, 1),
                        ),
                        certificate(
                            CVCA_CAR,
                            DV_CAR,
                            [0x80, 0x00, 0x00, 0x00, 0x00],
                            CvcDate::new(2025, 1, 1),
                            CvcDate::new(2028, 1, 1),
                        ),
                    ],
                    required_chat: None,
                    auxiliary_data: None,
                    certificate_description: None,
                    reference_date: CvcDate::new(2026, 8, 25),
                }),
            },
        )
        .unwrap();
    let AuthenticationResponse::Eac1(opened) = response else {
        panic!("expected a first-call response");
    };
    assert_eq!(opened.retry_counter, 3);
    assert_eq!(opened.current_car.to_string(), CVCA_CAR);
    assert_eq!(opened.previous_car, None);
    assert_eq!(opened.ef_card_access.as_ref(), eid_card_access().as_slice());
    assert_eq!(opened.id_picc.as_ref(), &CARD_EPHEMERAL_PUBLIC[1..33]);
    assert_eq!(opened.challenge.as_ref(), CHALLENGE);
    assert_eq!(opened.chat, *terminal.chat());
    assert_eq!(opened.chat.role(), Role::Terminal);
    assert!(!sal.session().is_authenticated("EAC.eID"));

    let response = sal
        .did_authenticate(
            EAC_PROTOCOL,
            DidAuthenticateRequest {
                did: "EAC.eID".into(),
                data: AuthenticationData::Eac2(Eac2Input {
                    signature: Bytes::from_static(&[0x5A; 64]),
                }),
            },
        )
        .unwrap();
    let AuthenticationResponse::Eac2(done) = response else {
        panic!("expected a second-call response");
    };
    assert_eq!(done.ef_card_security.as_ref(), security_file.as_slice());
    assert_eq!(done.nonce.as_ref(), CHIP_NONCE);
    assert_eq!(done.token.as_ref(), CHIP_TOKEN);
    assert!(sal.session().is_authenticated("EAC.eID"));

    // The channel was re-keyed in place to the chip-authenticated keys.
    let channel = sal.session_mut().executor().transport();
    assert!(channel.is_established());
    let rekeyed = channel.session_keys().unwrap().mac(b"probe").unwrap();
    let reference = session_keys(CA_SESSION_ENC, CA_SESSION_MAC)
        .mac(b"probe")
        .unwrap();
    assert_eq!(rekeyed, reference);

    let commands = &sal.session_mut().executor().transport().transport().commands;
    assert_eq!(commands.len(), 21);
    assert!(commands[9..].iter().all(|c| c[0] == 0x0C));
}

#[test]
fn test_wrong_password_counts_down_and_recovers() {
    init_tracing();
    let keys = session_keys(PACE_SESSION_ENC, PACE_SESSION_MAC);
    let mut responses = connect_script(&minimal_card_access());
    // First run ends with the card grading the token exchange: two tries
    // left.
    responses.extend(pace_script(None).into_iter().take(4));
    responses.push(Bytes::from_static(&hex!("63C2")));
    // The retry on the same connection succeeds and keys the channel.
    responses.extend(pace_script(None));
    responses.push(protected(&keys, 2, None, hex!("9000")));
    responses.push(protected(&keys, 4, Some(&hex!("AA")), hex!("9000")));
    responses.push(protected(&keys, 6, None, hex!("6B00")));

    let mut session = CardSession::connect(ScriptedTransport::new(responses)).unwrap();
    let mut scalars = ScalarQueue(vec![
        MAPPING_PRIVATE,
        EPHEMERAL_PRIVATE,
        MAPPING_PRIVATE,
        EPHEMERAL_PRIVATE,
    ]);

    let error = session
        .establish_pace(&mrz_password(), None, &mut scalars)
        .unwrap_err();
    assert!(matches!(error, Error::WrongPasswordRetryCounter(2)));
    assert_eq!(error.retry_counter(), Some(2));
    assert!(!error.is_fatal());
    assert!(!session.is_secure());

    let output = session
        .establish_pace(&mrz_password(), None, &mut scalars)
        .unwrap();
    assert_eq!(output.retry_counter, 3);
    assert!(session.is_secure());
    assert_eq!(session.read_file(0x0117).unwrap().as_ref(), hex!("AA"));
}

#[test]
fn test_pin_compare_grades_the_card_verdict() {
    init_tracing();
    let mut responses = connect_script(&minimal_card_access());
    responses.push(Bytes::from_static(&hex!("63C1")));
    responses.push(Bytes::from_static(&hex!("9000")));

    let session = CardSession::connect(ScriptedTransport::new(responses)).unwrap();
    let mut sal = Sal::new(session, ProtocolRegistry::with_defaults());

    let mut digits = *b"111111";
    let error = sal
        .did_authenticate(
            PIN_COMPARE_PROTOCOL,
            DidAuthenticateRequest {
                did: "PIN.eID".into(),
                data: AuthenticationData::PinCompare(PinInput::digits(&mut digits)),
            },
        )
        .unwrap_err();
    assert!(matches!(error, Error::WrongPasswordRetryCounter(1)));
    assert!(!error.is_fatal());
    // The caller's buffer is gone the moment the input is built.
    assert_eq!(digits, [0; 6]);
    assert!(!sal.session().is_authenticated("PIN.eID"));

    let mut digits = *b"123456";
    let response = sal
        .did_authenticate(
            PIN_COMPARE_PROTOCOL,
            DidAuthenticateRequest {
                did: "PIN.eID".into(),
                data: AuthenticationData::PinCompare(PinInput::digits(&mut digits)),
            },
        )
        .unwrap();
    assert!(matches!(response, AuthenticationResponse::PinCompare));
    assert_eq!(digits, [0; 6]);
    assert!(sal.session().is_authenticated("PIN.eID"));

    let commands = &sal.session_mut().executor().transport().transport().commands;
    assert_eq!(commands.len(), 6);
    assert_eq!(commands[4].as_ref(), hex!("00200003 06 313131313131"));

    // A blocked card fails closed.
    let mut responses = connect_script(&minimal_card_access());
    responses.push(Bytes::from_static(&hex!("63C0")));
    let session = CardSession::connect(ScriptedTransport::new(responses)).unwrap();
    let mut sal = Sal::new(session, ProtocolRegistry::with_defaults());

    let mut digits = *b"123456";
    let error = sal
        .did_authenticate(
            PIN_COMPARE_PROTOCOL,
            DidAuthenticateRequest {
                did: "PIN.eID".into(),
                data: AuthenticationData::PinCompare(PinInput::digits(&mut digits)),
            },
        )
        .unwrap_err();
    assert!(matches!(error, Error::PasswordBlocked));
    assert!(error.is_fatal());
    assert_eq!(error.retry_counter(), Some(0));
}
