//! Advertised capabilities.
//!
//! The pre-auth and post-auth sets differ: extensions that only matter once a
//! mailbox can be opened are not shown to anonymous clients.

use super::flow::Mode;

const PRE_AUTH: &[&str] = &["IMAP4rev1", "AUTH=PLAIN", "ENABLE", "ID"];

const POST_AUTH: &[&str] = &[
    "COMPRESS=DEFLATE",
    "CONDSTORE",
    "ESEARCH",
    "IDLE",
    "LIST-EXTENDED",
    "MOVE",
    "SPECIAL-USE",
    "UIDPLUS",
];

#[derive(Debug, Clone)]
pub struct ServerCapability {
    /// Set when the APNs bridge is configured.
    pub apple_push: bool,
}

impl ServerCapability {
    pub fn new(apple_push: bool) -> Self {
        Self { apple_push }
    }

    /// The capability listing for the given session mode, space separated,
    /// as it appears in `* CAPABILITY` and the greeting code.
    pub fn listing(&self, mode: Mode) -> String {
        let mut caps: Vec<&str> = PRE_AUTH.to_vec();
        if mode != Mode::NonAuth {
            caps.extend_from_slice(POST_AUTH);
            if self.apple_push {
                caps.push("XAPPLEPUSHSERVICE");
            }
        }
        caps.join(" ")
    }
}
