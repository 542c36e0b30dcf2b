//! Single-word passphrases for the pairing challenge.
//!
//! The receiver draws one word from [`WORDLIST`] and shows it on its own
//! screen; the human operating the initiator reads it and types it in.  The
//! word never crosses the network in the receiver→initiator direction.
//!
//! # Security model
//!
//! This is an anti-impersonation check, not a key exchange.  An attacker
//! who cannot see the receiver's screen has a `1 / WORDLIST.len()` chance
//! per guess.  The only throttle is that each session accepts exactly one
//! attempt: a wrong word destroys the session and a fresh word is drawn for
//! the next one.  Traffic is not encrypted.

use rand::seq::SliceRandom;
use rand::Rng;

/// Short, lowercase, technology-themed words.  All entries are distinct.
pub const WORDLIST: &[&str] = &[
    "pixel", "laser", "kernel", "socket", "vector", "binary", "cipher", "router",
    "buffer", "cache", "shader", "sprite", "voxel", "quark", "photon", "plasma",
    "rocket", "orbit", "nebula", "comet", "vertex", "matrix", "tensor", "signal",
    "module", "thread", "stack", "queue", "pointer", "packet", "beacon", "relay",
    "switch", "diode", "sensor", "magnet", "turbo", "nitro", "robot", "cyborg",
    "droid", "gadget", "widget", "console", "joystick", "trigger", "button", "cursor",
    "script", "syntax", "lambda", "tuple", "array", "struct", "bitmap", "codec",
    "fiber", "quantum", "atomic", "neutron", "proton", "circuit", "battery", "antenna",
    "modem", "server", "client", "portal", "hyper", "turing", "compile", "debug",
];

/// Draws a word uniformly from [`WORDLIST`] with the thread-local RNG.
///
/// Each call is independent; consecutive calls may return the same word.
pub fn generate_passphrase() -> &'static str {
    generate_passphrase_with(&mut rand::thread_rng())
}

/// Like [`generate_passphrase`] but with a caller-supplied RNG.
pub fn generate_passphrase_with<R: Rng + ?Sized>(rng: &mut R) -> &'static str {
    WORDLIST.choose(rng).copied().unwrap_or(WORDLIST[0])
}

/// `true` when `entered` is the displayed word, ignoring surrounding
/// whitespace and ASCII case.  No fuzzy matching: inner whitespace or a
/// typo fails.
pub fn passphrases_match(entered: &str, expected: &str) -> bool {
    let entered = entered.trim();
    !entered.is_empty() && entered.eq_ignore_ascii_case(expected.trim())
}

/// `true` when `word` is in [`WORDLIST`] (after normalising).
pub fn is_wordlist_word(word: &str) -> bool {
    let word = word.trim();
    WORDLIST.iter().any(|w| w.eq_ignore_ascii_case(word))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
