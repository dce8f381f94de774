//! Small helpers shared across modules.

use std::borrow::Cow;
use std::fmt::Write;

/// Generate a session identifier: 16 random bytes, hex-encoded.
pub fn gen_session_id() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().fold(String::with_capacity(32), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Expand a leading `~` to `$HOME`.
///
/// `"~/.kube/config"` becomes `"/home/user/.kube/config"`; anything else
/// passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Cow::Owned(format!("{home}{}", &path[1..]));
        }
    }
    Cow::Borrowed(path)
}
