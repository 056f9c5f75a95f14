//! Commands legal in every mode: CAPABILITY, NOOP/CHECK, LOGOUT, ID and the
//! COMPRESS transport switch.

use anyhow::Result;

use crate::imap::response::{self, Line};
use crate::imap::session::Session;

impl Session {
    pub(crate) async fn cmd_capability(&mut self, tag: &str) -> Result<()> {
        let line = Line::untagged()
            .raw("CAPABILITY ")
            .raw(&self.caps.listing(self.mode))
            .finish();
        self.send(line).await?;
        self.send_flush(response::ok(tag, "CAPABILITY completed"))
            .await
    }

    pub(crate) async fn cmd_noop(&mut self, tag: &str) -> Result<()> {
        self.send_flush(response::ok(tag, "NOOP completed")).await
    }

    pub(crate) async fn cmd_logout(&mut self, tag: &str) -> Result<()> {
        self.send(Line::untagged().raw("BYE logging out").finish())
            .await?;
        self.send_flush(response::ok(tag, "LOGOUT completed"))
            .await?;
        self.set_logout();
        Ok(())
    }

    pub(crate) async fn cmd_id(
        &mut self,
        tag: &str,
        fields: &[(String, Option<String>)],
    ) -> Result<()> {
        for (key, value) in fields {
            tracing::debug!(session = %self.id(), key = %key, value = ?value, "client.id");
        }
        let line = Line::untagged()
            .raw("ID (\"name\" \"postillon\" \"version\" \"")
            .raw(env!("CARGO_PKG_VERSION"))
            .raw("\")")
            .finish();
        self.send(line).await?;
        self.send_flush(response::ok(tag, "ID completed")).await
    }

    /// The tagged OK goes out on the plain transport; the DEFLATE wrap
    /// happens right after it is flushed, before the next read.
    pub(crate) async fn cmd_compress(&mut self, tag: &str) -> Result<()> {
        if self.is_compressed() {
            return self
                .send_flush(response::no(
                    tag,
                    "[COMPRESSIONACTIVE] COMPRESS already active",
                ))
                .await;
        }
        self.send_flush(response::ok(tag, "DEFLATE active")).await?;
        self.request_compress_swap();
        Ok(())
    }
}
