//! Pre-authentication commands: LOGIN and (already SASL-decoded by the
//! parser) AUTHENTICATE PLAIN share one path into the store.

use anyhow::Result;

use crate::imap::flow::Mode;
use crate::imap::response;
use crate::imap::session::Session;

impl Session {
    pub(crate) async fn cmd_login(
        &mut self,
        tag: &str,
        username: &str,
        password: &str,
    ) -> Result<()> {
        match self.store.login(username, password).await {
            Ok((user_id, store_session)) => {
                self.user_id = Some(user_id);
                self.store_session = Some(store_session);
                self.mode = Mode::Auth;
                self.notifier
                    .registry
                    .attach(user_id, self.shared.clone())
                    .await;
                tracing::info!(session = %self.id(), user = %username, "imap.login");
                self.send_flush(response::ok_code(
                    tag,
                    &format!("CAPABILITY {}", self.caps.listing(Mode::Auth)),
                    "logged in",
                ))
                .await
            }
            Err(e) => {
                tracing::debug!(session = %self.id(), user = %username, "imap.login.failed");
                self.send_store_error(tag, e).await
            }
        }
    }
}
