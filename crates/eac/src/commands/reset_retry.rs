//! RESET RETRY COUNTER (INS 0x2C)

use perso_apdu_core::{ApduCommand, Command, Response};
use zeroize::Zeroizing;

use super::{CLA_PLAIN, PasswordType, unexpected_status};
use crate::error::{Error, Result};

const INS_RESET_RETRY_COUNTER: u8 = 0x2C;
const P1_SET_REFERENCE_DATA: u8 = 0x02;
const P1_UNBLOCK: u8 = 0x03;

/// RESET RETRY COUNTER unblocking a password or storing a new one.
///
/// Both flavors require the matching authorization: a PUK-keyed PACE channel
/// for unblocking, a PIN-keyed one for changing the PIN.
#[derive(Debug)]
pub struct ResetRetryCounter {
    p1: u8,
    reference: u8,
    new_value: Option<Zeroizing<Vec<u8>>>,
}

impl ResetRetryCounter {
    /// Reset the counter without touching the stored password (PUK flow)
    pub const fn unblock(password: PasswordType) -> Self {
        Self {
            p1: P1_UNBLOCK,
            reference: password.reference(),
            new_value: None,
        }
    }

    /// Reset the counter and store new reference data (PIN change)
    pub const fn set_new(password: PasswordType, new_value: Zeroizing<Vec<u8>>) -> Self {
        Self {
            p1: P1_SET_REFERENCE_DATA,
            reference: password.reference(),
            new_value: Some(new_value),
        }
    }
}

impl ApduCommand for ResetRetryCounter {
    type Success = ();
    type Error = Error;

    fn to_command(&self) -> Command {
        let command = Command::new(CLA_PLAIN, INS_RESET_RETRY_COUNTER, self.p1, self.reference);
        match &self.new_value {
            Some(value) => command.with_data(value.to_vec()),
            None => command,
        }
    }

    fn parse_response(response: Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status.is_authentication_method_blocked() {
            return Err(Error::PasswordBlocked);
        }
        match status.retry_counter() {
            Some(0) => Err(Error::PasswordBlocked),
            Some(tries) => Err(Error::WrongPasswordRetryCounter(tries)),
            None => Err(unexpected_status(status)),
        }
    }
}
