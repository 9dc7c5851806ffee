//! Authentication of connections to a dtq queue server.
//!
//! Every party of a dtq deployment (the queue, its workers, and job submitters) shares one
//! opaque [Signature]. A client sends the signature as a [fixed-size][SIGNATURE_LEN] header
//! before its first message; the queue verifies the header before it reads any request, so a
//! connection with a wrong signature never reaches the scheduling state.

mod strategy;
mod token;

pub use strategy::{build_strategies, ClientAuthStrategy, ServerAuthStrategy};
pub use token::{Signature, SignatureError, SIGNATURE_LEN};
