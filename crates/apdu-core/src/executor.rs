//! Executor for APDU command execution
//!
//! [`CardExecutor`] pairs a transport with the protocol-agnostic plumbing
//! every card session needs: serializing typed commands, collecting chained
//! responses via GET RESPONSE, and logging the exchange.

use core::fmt;

use bytes::BytesMut;
use tracing::{debug, instrument, trace};

use crate::command::{ApduCommand, Command, ExpectedLength};
use crate::error::{Error, Result};
use crate::response::Response;
use crate::secure::SecurityLevel;
use crate::transport::CardTransport;

/// Trait for APDU command execution
pub trait Executor: Send + fmt::Debug {
    /// Transmit a command and return the parsed response.
    ///
    /// Handles response chaining (`61 xx`) transparently; the returned
    /// response carries the final status word and the concatenated payload.
    #[instrument(level = "trace", skip_all, fields(executor = core::any::type_name::<Self>()))]
    fn transmit(&mut self, command: &Command) -> Result<Response> {
        trace!(command = %command, bytes = %hex::encode(command.to_bytes()), "Transmitting command");
        let result = self.do_transmit(command);
        match &result {
            Ok(response) => {
                trace!(status = %response.status(), payload = %hex::encode(response.payload()), "Received response");
            }
            Err(error) => {
                debug!(?error, "Error during transmission");
            }
        }
        result
    }

    /// Internal implementation of transmit
    fn do_transmit(&mut self, command: &Command) -> Result<Response>;

    /// Execute a typed command and parse its typed response
    fn execute<C: ApduCommand>(
        &mut self,
        command: &C,
    ) -> core::result::Result<C::Success, C::Error> {
        let response = self.transmit(&command.to_command())?;
        C::parse_response(response)
    }

    /// Get the current security level of the underlying transport stack
    fn security_level(&self) -> SecurityLevel;

    /// Reset the executor, including the transport
    fn reset(&mut self) -> Result<()>;
}

/// Card executor driving a [`CardTransport`]
#[derive(Debug)]
pub struct CardExecutor<T: CardTransport> {
    /// The transport used for communication
    transport: T,
    /// Maximum number of GET RESPONSE round trips per command
    max_chains: usize,
}

impl<T: CardTransport> CardExecutor<T> {
    /// Create a new executor over the given transport
    pub const fn new(transport: T) -> Self {
        Self {
            transport,
            max_chains: 10,
        }
    }

    /// Get a reference to the underlying transport
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Get a mutable reference to the underlying transport
    pub const fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Take ownership of the transport
    pub fn into_transport(self) -> T {
        self.transport
    }
}

impl<T: CardTransport> Executor for CardExecutor<T> {
    fn do_transmit(&mut self, command: &Command) -> Result<Response> {
        let response_bytes = self.transport.transmit_raw(&command.to_bytes())?;
        let mut response = Response::from_bytes(&response_bytes)?;

        // Collect chained response parts while the card reports more data.
        if response.status().remaining_bytes().is_some() {
            let mut buffer = BytesMut::from(response.payload().as_ref());
            let mut chains = 0usize;

            while let Some(remaining) = response.status().remaining_bytes() {
                if chains >= self.max_chains {
                    return Err(Error::ResponseChainLimit);
                }
                chains += 1;

                trace!(remaining, chain = chains, "Sending GET RESPONSE");
                let get_response =
                    Command::new(0x00, 0xC0, 0x00, 0x00).with_le(remaining as ExpectedLength);
                let part = self.transport.transmit_raw(&get_response.to_bytes())?;
                response = Response::from_bytes(&part)?;
                buffer.extend_from_slice(response.payload());
            }

            response = Response::new(buffer.freeze(), response.status());
        }

        Ok(response)
    }

    fn security_level(&self) -> SecurityLevel {
        self.transport.security_level()
    }

    fn reset(&mut self) -> Result<()> {
        self.transport.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use bytes::Bytes;

    #[test]
    fn test_basic_transmit() {
        let transport = MockTransport::with_response(Bytes::from_static(&[0x90, 0x00]));
        let mut executor = CardExecutor::new(transport);

        let command = Command::new(0x00, 0xA4, 0x04, 0x00);
        let response = executor.transmit(&command).unwrap();
        assert!(response.is_success());
        assert_eq!(
            executor.transport().commands[0].as_ref(),
            command.to_bytes().as_ref()
        );
    }

    #[test]
    fn test_get_response_chaining() {
        let transport = MockTransport::new(vec![
            Bytes::from_static(&[0x01, 0x02, 0x61, 0x03]),
            Bytes::from_static(&[0x03, 0x04, 0x05, 0x90, 0x00]),
        ]);
        let mut executor = CardExecutor::new(transport);

        let command = Command::new(0x00, 0xB0, 0x00, 0x00).with_le(0);
        let response = executor.transmit(&command).unwrap();

        assert_eq!(response.payload().as_ref(), &[0x01, 0x02, 0x03, 0x04, 0x05]);
        assert!(response.is_success());

        // Second command on the wire must be GET RESPONSE with Le = 3.
        let get_response = &executor.transport().commands[1];
        assert_eq!(get_response.as_ref(), &[0x00, 0xC0, 0x00, 0x00, 0x03]);
    }

    #[test]
    fn test_chain_limit() {
        // A card stuck on 61 01 must not loop forever.
        let responses = vec![Bytes::from_static(&[0x61, 0x01]); 12];
        let mut executor = CardExecutor::new(MockTransport::new(responses));

        let command = Command::new(0x00, 0xB0, 0x00, 0x00);
        assert!(matches!(
            executor.transmit(&command),
            Err(Error::ResponseChainLimit)
        ));
    }
}
