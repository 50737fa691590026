use std::sync::OnceLock;

use taskgate_provider_core::TransportError;

static CLIENT: OnceLock<wreq::Client> = OnceLock::new();

/// Process wide upstream client. Timeouts are applied per call.
pub fn shared_client() -> Result<wreq::Client, TransportError> {
    if let Some(client) = CLIENT.get() {
        return Ok(client.clone());
    }
    let client = wreq::Client::builder()
        .build()
        .map_err(|err| TransportError::Request(err.to_string()))?;
    Ok(CLIENT.get_or_init(|| client).clone())
}
