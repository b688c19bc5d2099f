//! Decrypt stage: replaces an S/MIME enveloped body with its plaintext

use crate::envelope::Envelope;
use crate::pipeline::{Next, Processor, StageError, StageResult, Task};
use crate::smime::{mime, CmsError, EnvelopedMessage, KeyLoadError, KeyRing, KeyStore};
use async_trait::async_trait;
use serde_json::json;
use smimegw_common::config::{RecipientSelection, SmimeConfig};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Decrypt {
    name: &'static str,
    keys: Arc<KeyStore>,
    selection: RecipientSelection,
    require_authenticated: bool,
}

impl Decrypt {
    pub fn new(name: &'static str, keys: Arc<KeyStore>, config: &SmimeConfig) -> Self {
        Self {
            name,
            keys,
            selection: config.recipient_selection,
            require_authenticated: config.require_authenticated_content,
        }
    }

    /// Key rings of the envelope recipients that have keys, in envelope order.
    ///
    /// A recipient whose keys fail to load is skipped so the others still get
    /// a chance; the first such error comes back alongside the rings.
    async fn recipient_rings(&self, envelope: &Envelope) -> (Vec<Arc<KeyRing>>, Option<KeyLoadError>) {
        let mut rings = Vec::new();
        let mut load_error = None;
        for rcpt in envelope.recipients() {
            match self.keys.resolve(&rcpt.identity()).await {
                Ok(Some(ring)) => rings.push(ring),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        envelope_id = envelope.id(),
                        recipient = %rcpt.identity(),
                        error = %e,
                        "Failed to load recipient keys"
                    );
                    load_error.get_or_insert(e);
                }
            }
        }
        (rings, load_error)
    }
}

/// Whether one of the ring's certificates explicitly names a recipient info
fn names_a_recipient_info(ring: &KeyRing, message: &EnvelopedMessage) -> bool {
    ring.keys().iter().any(|key| {
        key.certificate().is_some()
            && message
                .key_transport_recipients()
                .any(|(_, ktri)| key.matches(&ktri.rid))
    })
}

fn integrity(err: impl std::fmt::Display) -> StageError {
    StageError::DecryptionIntegrity(err.to_string())
}

fn no_matching_recipient(envelope: &Envelope) -> StageError {
    let recipients: Vec<String> = envelope.recipients().iter().map(|r| r.identity()).collect();
    warn!(envelope_id = envelope.id(), recipients = ?recipients, "No recipient key for encrypted message");
    StageError::NoMatchingRecipient { recipients }
}

#[async_trait]
impl Processor for Decrypt {
    fn name(&self) -> &str {
        self.name
    }

    async fn process(&self, envelope: &mut Envelope, task: Task, next: Next<'_>) -> StageResult {
        match task {
            Task::SaveMail => {}
            Task::ValidateRecipient | Task::Close => return next.run(envelope, task).await,
        }

        let (der, detection) = match mime::detect(envelope.headers(), envelope.body()).map_err(integrity)? {
            Some(found) => found,
            None => {
                debug!(envelope_id = envelope.id(), "Not S/MIME enveloped-data, passing through");
                return next.run(envelope, task).await;
            }
        };

        // Keys first: a payload nobody here could open is refused as such,
        // whatever its shape
        let (mut rings, load_error) = self.recipient_rings(envelope).await;
        if rings.is_empty() {
            return Err(match load_error {
                Some(e) => StageError::KeyLoad(e),
                None => no_matching_recipient(envelope),
            });
        }

        let message = EnvelopedMessage::from_der(&der).map_err(integrity)?;
        if self.selection == RecipientSelection::BestMatch {
            // Stable: envelope order survives among equals
            rings.sort_by_key(|ring| !names_a_recipient_info(ring, &message));
        }

        // First failure of a key that was actually tried on a recipient info
        let mut failure: Option<CmsError> = None;
        for ring in &rings {
            for key in ring.keys() {
                match message.decrypt_with(key.private_key(), |rid| key.matches(rid)) {
                    Ok(decrypted) => {
                        if self.require_authenticated && !decrypted.authenticated {
                            warn!(
                                envelope_id = envelope.id(),
                                recipient = %ring.identity(),
                                algorithm = decrypted.content_algorithm,
                                "Refusing content encryption without integrity protection"
                            );
                            return Err(StageError::DecryptionIntegrity(format!(
                                "{} content is not integrity protected",
                                decrypted.content_algorithm
                            )));
                        }

                        let (headers, body) = mime::hoist(envelope.headers(), decrypted.plaintext);
                        let plaintext_bytes = body.len();
                        envelope.replace_content(headers, body);
                        envelope.set_metadata(
                            self.name,
                            json!({
                                "decrypted": true,
                                "recipient": ring.identity(),
                                "key": key.source().display().to_string(),
                                "content_algorithm": decrypted.content_algorithm,
                                "key_transport": decrypted.key_transport,
                                "detection": detection.as_str(),
                                "plaintext_bytes": plaintext_bytes,
                            }),
                        );
                        info!(
                            envelope_id = envelope.id(),
                            recipient = %ring.identity(),
                            algorithm = decrypted.content_algorithm,
                            "Decrypted S/MIME message"
                        );
                        return next.run(envelope, task).await;
                    }
                    Err(e) => {
                        debug!(
                            envelope_id = envelope.id(),
                            recipient = %ring.identity(),
                            key = %key.source().display(),
                            error = %e,
                            "Key did not open message"
                        );
                        if !matches!(e, CmsError::NoKeyTransportRecipient) {
                            failure.get_or_insert(e);
                        }
                    }
                }
            }
        }

        // An unreadable key may be the one that opens the message
        if let Some(e) = load_error {
            return Err(StageError::KeyLoad(e));
        }
        match failure {
            Some(e) => Err(integrity(e)),
            None => Err(no_matching_recipient(envelope)),
        }
    }
}
