use anyhow::{Context, Result};
use lettre::message::Mailbox;
use lettre::transport::sendmail::SendmailTransport;
use lettre::{Message, Transport};

/// Send a plain-text notification through the local sendmail binary.
pub fn send(recipient: &str, subject: &str, content: &str) -> Result<()> {
    if content.is_empty() {
        return Ok(());
    }

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".into());

    let from: Mailbox = format!("btrfs-sxbackup@{}", host)
        .parse()
        .context("invalid sender address")?;
    let to: Mailbox = recipient
        .parse()
        .with_context(|| format!("invalid recipient address [{}]", recipient))?;

    let message = Message::builder()
        .from(from)
        .to(to)
        .subject(subject)
        .body(content.to_string())
        .context("could not assemble notification mail")?;

    SendmailTransport::new()
        .send(&message)
        .context("sendmail failed")?;

    Ok(())
}
