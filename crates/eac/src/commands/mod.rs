//! Typed command APDUs for the protocol steps
//!
//! One file per instruction. Each command pairs a byte-exact builder with the
//! response interpretation its protocol step relies on, via
//! [`perso_apdu_core::ApduCommand`]. Builders always produce plaintext
//! commands; secure messaging enveloping happens in the channel wrapper, not
//! here.

pub mod external_authenticate;
pub use external_authenticate::*;
pub mod general_authenticate;
pub use general_authenticate::*;
pub mod get_challenge;
pub use get_challenge::*;
pub mod mse;
pub use mse::*;
pub mod pso;
pub use pso::*;
pub mod read_binary;
pub use read_binary::*;
pub mod reset_retry;
pub use reset_retry::*;
pub mod select;
pub use select::*;
pub mod verify;
pub use verify::*;

use perso_apdu_core::StatusWord;

use crate::error::Error;

/// Class byte of an unchained plain command
pub const CLA_PLAIN: u8 = 0x00;

/// File identifier of EF.CardAccess at master file level
pub const EF_CARD_ACCESS: u16 = 0x011C;
/// File identifier of EF.CardSecurity at master file level
pub const EF_CARD_SECURITY: u16 = 0x011D;

/// Wrap a status word no command-specific arm claimed
pub(crate) fn unexpected_status(status: StatusWord) -> Error {
    Error::DispatchFailure(perso_apdu_core::Error::from(status))
}
