//! Mapping ledger rejection payloads onto [`RejectReason`]
//!
//! Structured codes win. Free-text matching is only a fallback for ledgers
//! that report nothing but a message.

use super::RejectReason;
use once_cell::sync::Lazy;
use regex::Regex;

static SEQUENCE_MISMATCH: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)nonce|replay|invalid\s+sequence").ok());

/// Structured rejection codes the ledger may attach
pub const CODE_SEQUENCE_MISMATCH: &str = "sequence_mismatch";
pub const CODE_NONCE_TOO_LOW: &str = "nonce_too_low";
pub const CODE_NONCE_TOO_HIGH: &str = "nonce_too_high";

fn code_is_sequence_mismatch(code: &str) -> bool {
    matches!(
        code.to_ascii_lowercase().as_str(),
        CODE_SEQUENCE_MISMATCH | CODE_NONCE_TOO_LOW | CODE_NONCE_TOO_HIGH | "replay"
    )
}

fn message_is_sequence_mismatch(message: &str) -> bool {
    SEQUENCE_MISMATCH
        .as_ref()
        .map(|re| re.is_match(message))
        .unwrap_or(false)
}

/// Classify a rejection from its optional structured code and free-text message
pub fn classify_rejection(code: Option<&str>, message: &str) -> RejectReason {
    let mismatch = match code {
        Some(code) if !code.is_empty() => code_is_sequence_mismatch(code),
        _ => message_is_sequence_mismatch(message),
    };

    if mismatch {
        RejectReason::SequenceMismatch(message.to_string())
    } else {
        RejectReason::Other(message.to_string())
    }
}
