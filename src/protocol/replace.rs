//! Replacement check: before a new component takes an old one's place in the
//! provisioning record, it must sign a fresh challenge with the deployment's
//! component key.
//!
//! ```text
//! AP                                          incoming Component
//!  | REPLACE_COMMAND{r}                             |
//!  |----------------------------------------------->| sign
//!  | REPLACE_ACK{id, sign(C, L || r || id)}         |
//!  |<-----------------------------------------------|
//!  verify, then swap ids
//! ```
//!
//! No session is involved; the incoming component has not been keyed yet.

use crate::core::packet::{BoundedBytes, ReplaceAckPayload, COMPONENT_ID_LEN, REPLACE_CHALLENGE_LEN};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::crypto::{random_bytes, signed_message, MessageSigner, MessageVerifier};
use tracing::{debug, instrument, warn};

pub const REPLACE_ACK_LABEL: &[u8] = b"trustbus/replace-ack";

pub type ReplaceChallenge = [u8; REPLACE_CHALLENGE_LEN];

/// AP: fresh challenge for the incoming component.
pub fn build_replace_command() -> Result<(ReplaceChallenge, BoundedBytes<REPLACE_CHALLENGE_LEN>)> {
    let challenge: ReplaceChallenge = random_bytes()?;
    Ok((challenge, BoundedBytes::new(&challenge)?))
}

/// Component: sign the challenge together with our own id.
#[instrument(skip(signer, command))]
pub fn answer_replace_command(
    component_id: u32,
    signer: &dyn MessageSigner,
    command: &BoundedBytes<REPLACE_CHALLENGE_LEN>,
) -> Result<ReplaceAckPayload> {
    let challenge = command.as_slice();
    if challenge.len() != REPLACE_CHALLENGE_LEN {
        return Err(ProtocolError::MalformedPayload(
            constants::ERR_CHALLENGE_LEN.into(),
        ));
    }

    let id = component_id.to_le_bytes();
    let sig = signer.sign_message(&signed_message(REPLACE_ACK_LABEL, &[challenge, &id]))?;
    debug!("Replacement challenge signed");
    ReplaceAckPayload::new(&id, sig)
}

/// AP: the ack must name `incoming` and carry a deployment signature over our challenge.
#[instrument(skip(verifier, challenge, ack))]
pub fn verify_replace_ack(
    incoming: u32,
    verifier: &dyn MessageVerifier,
    challenge: &ReplaceChallenge,
    ack: &ReplaceAckPayload,
) -> Result<()> {
    let id: [u8; COMPONENT_ID_LEN] = ack.data.as_slice().try_into().map_err(|_| {
        ProtocolError::MalformedPayload(format!("component id is {} bytes", ack.data.len()))
    })?;
    let claimed = u32::from_le_bytes(id);
    if claimed != incoming {
        warn!(claimed, "Replacement ack names another component");
        return Err(ProtocolError::UnknownComponent(claimed));
    }

    let msg = signed_message(REPLACE_ACK_LABEL, &[challenge, &id]);
    if !verifier.verify_message(&msg, &ack.sig) {
        warn!("Replacement ack signature rejected");
        return Err(ProtocolError::Signature(
            constants::ERR_REPLACE_ACK_SIG.into(),
        ));
    }
    Ok(())
}
