//! Pane-input submitter: deliver a short text message into an
//! interactive agent REPL and confirm it was consumed.
//!
//! Agent UIs differ in how they take input, and the user may be scrolled
//! back in copy-mode or parked on a confirmation prompt. The submitter
//! fails open: it returns `false` rather than corrupt pane state, and it
//! never raises.

use std::env;
use std::time::Duration;

use tracing::{debug, warn};

use super::Multiplexer;

/// Messages longer than this are truncated before delivery.
pub const MAX_MESSAGE_LEN: usize = 200;

/// Rounds of Enter-and-recheck before giving up on plain submission.
const SUBMIT_ROUNDS: usize = 6;
/// Extra rounds granted after an adaptive retry cleared the input.
const RETRY_ROUNDS: usize = 4;

const ROUND_WAIT: Duration = Duration::from_millis(100);
const KEY_GAP: Duration = Duration::from_millis(50);
const TRUST_DISMISS_GAP: Duration = Duration::from_millis(150);

/// Environment flag that disables the adaptive interrupt retry.
const AUTO_RETRY_ENV: &str = "OMX_TEAM_AUTO_INTERRUPT_RETRY";

/// Does the pane tail show a first-run trust prompt?
fn has_trust_prompt(tail: &str) -> bool {
    tail.contains("Do you trust the contents of this directory?")
        && (tail.contains("Yes, continue")
            || tail.contains("No, quit")
            || tail.contains("Press enter to continue"))
}

/// Is the REPL visibly mid-turn?
fn is_busy(tail: &str) -> bool {
    tail.contains("esc to interrupt") || tail.contains("background terminal running")
}

/// Does the pane look ready for input: a prompt glyph or an agent hint
/// (a model identifier or a context-remaining token).
fn looks_ready(tail: &str) -> bool {
    static HINTS: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    if tail.contains('›') || tail.contains('>') || tail.contains('❯') {
        return true;
    }
    HINTS
        .get_or_init(|| regex::Regex::new(r"gpt-\S+|\d+% left").expect("ready hint pattern is valid"))
        .is_match(tail)
}

fn adaptive_retry_enabled() -> bool {
    env::var(AUTO_RETRY_ENV).map(|v| v != "0").unwrap_or(true)
}

/// Truncate to [`MAX_MESSAGE_LEN`] on a char boundary, trimming any
/// partial character at the cut.
fn clamp_message(message: &str) -> String {
    if message.len() <= MAX_MESSAGE_LEN {
        return message.to_string();
    }
    warn!(
        len = message.len(),
        max = MAX_MESSAGE_LEN,
        "pane message truncated"
    );
    let mut end = MAX_MESSAGE_LEN;
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

/// Submit `message` into the REPL running in `pane`.
///
/// Returns `true` when the message was delivered and consumed, `false`
/// when it could not be delivered safely. Never errors: every tmux
/// failure degrades to a `false` or is ignored.
pub async fn submit_to_pane(mux: &dyn Multiplexer, pane: &str, message: &str) -> bool {
    // Copy-mode is a tripwire: keystrokes would scroll, not type.
    if mux.in_copy_mode(pane).await.unwrap_or(false) {
        debug!(pane, "pane is in copy-mode, not sending");
        return false;
    }

    let tail = mux.capture_pane(pane).await.unwrap_or_default();

    // A trust prompt swallows the first keystrokes; dismiss it first.
    if has_trust_prompt(&tail) {
        let _ = mux.send_key(pane, "Enter").await;
        tokio::time::sleep(TRUST_DISMISS_GAP).await;
        let _ = mux.send_key(pane, "Enter").await;
        tokio::time::sleep(TRUST_DISMISS_GAP).await;
    }

    let was_busy = is_busy(&tail);
    let message = clamp_message(message);

    if mux.send_literal(pane, &message).await.is_err() {
        return false;
    }

    if submit_rounds(mux, pane, &message, was_busy, SUBMIT_ROUNDS).await {
        return true;
    }

    // Adaptive retry: the REPL was busy and queued our text into a
    // stuck input buffer. Clear the line and try once more, but only
    // when the pane now looks idle and ready.
    if adaptive_retry_enabled() && was_busy && !mux.in_copy_mode(pane).await.unwrap_or(false) {
        let tail = mux.capture_pane(pane).await.unwrap_or_default();
        if tail.contains(message.as_str()) && !is_busy(&tail) && looks_ready(&tail) {
            debug!(pane, "adaptive retry: clearing input and re-sending");
            let _ = mux.send_key(pane, "C-u").await;
            tokio::time::sleep(KEY_GAP).await;
            if mux.send_literal(pane, &message).await.is_err() {
                return false;
            }
            if submit_rounds(mux, pane, &message, false, RETRY_ROUNDS).await {
                return true;
            }
        }
    }

    // Final check: if the user entered copy-mode while we were working,
    // back off entirely.
    if mux.in_copy_mode(pane).await.unwrap_or(false) {
        return false;
    }

    // One trailing nudge; assume the REPL absorbed the text.
    let _ = mux.send_key(pane, "Enter").await;
    tokio::time::sleep(KEY_GAP).await;
    let _ = mux.send_key(pane, "Enter").await;
    true
}

/// Drive up to `rounds` submission attempts, returning `true` once the
/// message line disappears from the pane tail.
async fn submit_rounds(
    mux: &dyn Multiplexer,
    pane: &str,
    message: &str,
    was_busy: bool,
    rounds: usize,
) -> bool {
    for round in 0..rounds {
        tokio::time::sleep(ROUND_WAIT).await;

        if round == 0 && was_busy {
            // Busy REPLs hide a "queue message" affordance behind Tab.
            let _ = mux.send_key(pane, "Tab").await;
            let _ = mux.send_key(pane, "Enter").await;
        } else {
            // Some UIs absorb the first Enter as an in-input newline;
            // the second submits.
            let _ = mux.send_key(pane, "Enter").await;
            tokio::time::sleep(KEY_GAP).await;
            let _ = mux.send_key(pane, "Enter").await;
        }

        let tail = mux.capture_pane(pane).await.unwrap_or_default();
        if !tail.contains(message) {
            return true;
        }
    }
    false
}

/// Retry [`submit_to_pane`] until it reports success.
///
/// Used for the initial task assignment, where delivery must not be
/// silently dropped.
pub async fn notify_pane_with_retry(
    mux: &dyn Multiplexer,
    pane: &str,
    message: &str,
    attempts: usize,
    delay: Duration,
) -> bool {
    for attempt in 0..attempts.max(1) {
        if submit_to_pane(mux, pane, message).await {
            return true;
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    false
}
